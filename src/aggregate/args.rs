//! Cursor over a request's argument vector.

use std::fmt;

/// Failure to read an argument of the expected shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgError {
    /// Ran out of arguments
    NoArg,
    /// Argument does not convert to the requested type
    BadType,
    /// Value outside the accepted range
    OutOfRange,
}

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArgError::NoArg => "Expected an argument, but none provided",
            ArgError::BadType => "Could not convert argument to expected type",
            ArgError::OutOfRange => "Value is outside acceptable bounds",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ArgError {}

/// Sequential reader over borrowed arguments
#[derive(Debug, Clone)]
pub struct ArgsCursor<'a> {
    args: &'a [String],
    pos: usize,
}

impl<'a> ArgsCursor<'a> {
    pub fn new(args: &'a [String]) -> Self {
        Self { args, pos: 0 }
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.args.len()
    }

    pub fn remaining(&self) -> usize {
        self.args.len().saturating_sub(self.pos)
    }

    /// Offset of the next argument within this cursor
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn peek(&self) -> Option<&'a str> {
        self.args.get(self.pos).map(|s| s.as_str())
    }

    /// Consume the next argument if it equals `keyword` (case-insensitive)
    pub fn advance_if_match(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(arg) if arg.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    pub fn advance(&mut self) {
        self.pos += 1;
    }

    pub fn get_str(&mut self) -> Result<&'a str, ArgError> {
        let arg = self.peek().ok_or(ArgError::NoArg)?;
        self.pos += 1;
        Ok(arg)
    }

    pub fn get_string(&mut self) -> Result<String, ArgError> {
        self.get_str().map(str::to_string)
    }

    /// Non-negative integer
    pub fn get_u64(&mut self) -> Result<u64, ArgError> {
        let arg = self.peek().ok_or(ArgError::NoArg)?;
        let value = parse_integer(arg)?;
        if value < 0 {
            return Err(ArgError::OutOfRange);
        }
        self.pos += 1;
        Ok(value as u64)
    }

    pub fn get_i64(&mut self) -> Result<i64, ArgError> {
        let arg = self.peek().ok_or(ArgError::NoArg)?;
        let value = parse_integer(arg)?;
        self.pos += 1;
        Ok(value)
    }

    pub fn get_f64(&mut self) -> Result<f64, ArgError> {
        let arg = self.peek().ok_or(ArgError::NoArg)?;
        let value = arg.parse::<f64>().map_err(|_| ArgError::BadType)?;
        self.pos += 1;
        Ok(value)
    }

    /// Integer within `[min, max]`
    pub fn get_u64_in(&mut self, min: u64, max: u64) -> Result<u64, ArgError> {
        let start = self.pos;
        let value = self.get_u64()?;
        if value < min || value > max {
            self.pos = start;
            return Err(ArgError::OutOfRange);
        }
        Ok(value)
    }

    /// Take the next `n` arguments as a sub-cursor
    pub fn get_slice(&mut self, n: usize) -> Result<ArgsCursor<'a>, ArgError> {
        if self.remaining() < n {
            return Err(ArgError::NoArg);
        }
        let sub = ArgsCursor::new(&self.args[self.pos..self.pos + n]);
        self.pos += n;
        Ok(sub)
    }

    /// Read a count `n` followed by `n` arguments
    pub fn get_var_args(&mut self) -> Result<ArgsCursor<'a>, ArgError> {
        let start = self.pos;
        let n = self.get_u64()? as usize;
        self.get_slice(n).inspect_err(|_| self.pos = start)
    }

    /// Remaining arguments as owned strings, consuming them
    pub fn take_rest(&mut self) -> Vec<String> {
        let rest = self.args[self.pos.min(self.args.len())..].to_vec();
        self.pos = self.args.len();
        rest
    }

    pub fn as_slice(&self) -> &'a [String] {
        &self.args[self.pos.min(self.args.len())..]
    }
}

fn parse_integer(arg: &str) -> Result<i64, ArgError> {
    arg.parse::<i64>().map_err(|_| ArgError::BadType)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_keywords_case_insensitive() {
        let v = args(&["limit", "0", "10"]);
        let mut ac = ArgsCursor::new(&v);
        assert!(!ac.advance_if_match("SORTBY"));
        assert!(ac.advance_if_match("LIMIT"));
        assert_eq!(ac.get_u64(), Ok(0));
        assert_eq!(ac.get_u64(), Ok(10));
        assert!(ac.is_at_end());
        assert_eq!(ac.get_u64(), Err(ArgError::NoArg));
    }

    #[test]
    fn test_numeric_errors_do_not_consume() {
        let v = args(&["-3", "x"]);
        let mut ac = ArgsCursor::new(&v);
        assert_eq!(ac.get_u64(), Err(ArgError::OutOfRange));
        assert_eq!(ac.get_i64(), Ok(-3));
        assert_eq!(ac.get_u64(), Err(ArgError::BadType));
        assert_eq!(ac.position(), 1);
    }

    #[test]
    fn test_var_args() {
        let v = args(&["2", "@a", "@b", "REDUCE"]);
        let mut ac = ArgsCursor::new(&v);
        let mut sub = ac.get_var_args().unwrap();
        assert_eq!(sub.get_str(), Ok("@a"));
        assert_eq!(sub.get_str(), Ok("@b"));
        assert!(sub.is_at_end());
        assert_eq!(ac.peek(), Some("REDUCE"));

        let short = args(&["3", "a"]);
        let mut ac = ArgsCursor::new(&short);
        assert!(ac.get_var_args().is_err());
        assert_eq!(ac.position(), 0);
    }

    #[test]
    fn test_range() {
        let v = args(&["5"]);
        let mut ac = ArgsCursor::new(&v);
        assert_eq!(ac.get_u64_in(1, 4), Err(ArgError::OutOfRange));
        assert_eq!(ac.get_u64_in(1, 5), Ok(5));
    }
}
