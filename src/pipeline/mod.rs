//! Row-processing pipeline: values, rows, key registries and the result
//! processors that make up an execution chain.

pub mod grouper;
pub mod highlight;
pub mod lookup;
pub mod processor;
pub mod reducers;
pub mod row;
pub mod sorter;
pub mod value;

pub use lookup::{KeyFlags, KeyId, Lookup, LookupRef};
pub use processor::{Chain, ProcessorKind, Pull, QueryState, ResultProcessor};
pub use row::Row;
pub use value::Value;
