//! # fxagg - search and aggregation request pipeline
//!
//! fxagg compiles FT.SEARCH / FT.AGGREGATE style argument lists into a
//! declarative plan, binds the plan to an index and executes it as a chain of
//! pull-based processors.
//!
//! ## Architecture
//!
//! - [`aggregate`] - Argument compilation, plan steps, pipeline building and cursors
//! - [`pipeline`] - Row registry, processors, reducers, sorting and highlighting
//! - [`query`] - Query text parsing, filters, scoring functions and expressions
//! - [`index`] - In-memory document index and its iterators
//! - [`output`] - Reply rows and their JSON / terminal rendering
//! - [`utils`] - Engine configuration and tokenization
//!
//! ## Quick Start
//!
//! ```ignore
//! use fxagg::aggregate::{Request, RequestKind};
//! use fxagg::index::{self, MemoryIndex};
//! use fxagg::utils::EngineConfig;
//!
//! let idx = index::shared(MemoryIndex::from_json_file("docs.json".as_ref())?);
//! let args: Vec<String> = ["*", "GROUPBY", "1", "@color", "REDUCE", "COUNT", "0", "AS", "n"]
//!     .iter()
//!     .map(|s| s.to_string())
//!     .collect();
//!
//! let mut req = Request::prepare(RequestKind::Aggregate, &args, idx, &EngineConfig::default())?;
//! let result = req.execute()?;
//! for row in &result.rows {
//!     println!("{:?}", row.fields);
//! }
//! ```

pub mod aggregate;
pub mod error;
pub mod index;
pub mod output;
pub mod pipeline;
pub mod query;
pub mod utils;
