//! Query expressions — a LINQ-style language over the record sequence.
//!
//! Text is parsed into an [`parser::Expr`], bound and checked against the
//! operator allow-list by the [`compiler`], and evaluated by the [`executor`].

pub mod compiler;
pub mod executor;
pub mod parser;
pub mod value;

pub use compiler::{compile, CompiledQuery, Type};
pub use executor::execute;
pub use value::Value;
