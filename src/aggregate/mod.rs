//! Request compilation and execution: arguments, plan, pipeline builder and
//! cursors.

pub mod args;
mod build;
pub mod cursor;
pub mod plan;
pub mod request;

pub use build::{DEFAULT_LIMIT, SCORE_KEY};
pub use cursor::CursorList;
pub use plan::{Plan, Step};
pub use request::{Request, RequestKind};
