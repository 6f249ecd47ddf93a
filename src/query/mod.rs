pub mod expr;
pub mod filters;
pub mod parser;
pub mod scorer;

pub use expr::Expr;
pub use parser::{ParseOptions, QueryAst, QueryNode, parse_query};
pub use scorer::{ScoringArgs, ScoringFn, get_scoring_function};
