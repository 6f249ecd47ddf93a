//! Utility functions and configuration.
//!
//! ## Modules
//!
//! - [`app_data`] - Engine configuration (JSON file in the user config directory)
//! - [`tokenizer`] - Word extraction for indexing, query terms and highlighting

pub mod app_data;
pub mod tokenizer;

pub use app_data::*;
pub use tokenizer::*;
