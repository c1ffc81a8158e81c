//! HttpQuery — compile and run LINQ-style query expressions over an
//! in-memory record sequence.

pub mod envelope;
pub mod query;
pub mod types;

pub use envelope::{Diagnostic, ResponseEnvelope};
pub use query::{compile, execute, CompiledQuery, Type, Value};
pub use types::*;

/// Name the record sequence is bound to inside query text.
pub const DEFAULT_PARAMETER: &str = "people";

/// Compile `text` against [`DEFAULT_PARAMETER`] and run it over `dataset`.
pub fn evaluate(text: &str, dataset: &Dataset) -> QueryResult<Value> {
    let query = compile(DEFAULT_PARAMETER, text)?;
    execute(&query, dataset.people())
}
