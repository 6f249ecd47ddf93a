/// Maximum token length to store in the index.
/// Longer runs are almost always encoded blobs rather than searchable words.
const MAX_TOKEN_LENGTH: usize = 128;

/// A token with its byte span in the source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Lowercased term
    pub term: String,
    /// Byte offset of the first character
    pub start: usize,
    /// Byte offset one past the last character
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CharType {
    Word,
    Other,
}

fn classify_char(ch: char) -> CharType {
    if ch.is_alphanumeric() || ch == '_' {
        CharType::Word
    } else {
        CharType::Other
    }
}

/// Split text into lowercase word tokens, keeping byte offsets.
///
/// Words are maximal runs of alphanumeric characters or underscores.
pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(text.len() / 6 + 1);
    let mut token_start: Option<usize> = None;

    for (i, ch) in text.char_indices() {
        match classify_char(ch) {
            CharType::Word => {
                if token_start.is_none() {
                    token_start = Some(i);
                }
            }
            CharType::Other => {
                if let Some(start) = token_start.take() {
                    add_token(&mut tokens, text, start, i);
                }
            }
        }
    }

    if let Some(start) = token_start {
        add_token(&mut tokens, text, start, text.len());
    }

    tokens
}

/// Lowercased terms only, in document order
pub fn terms(text: &str) -> Vec<String> {
    tokenize(text).into_iter().map(|t| t.term).collect()
}

fn add_token(tokens: &mut Vec<Token>, text: &str, start: usize, end: usize) {
    let slice = &text[start..end];
    if !slice.is_empty() && slice.len() <= MAX_TOKEN_LENGTH {
        tokens.push(Token {
            term: slice.to_lowercase(),
            start,
            end,
        });
    }
}
