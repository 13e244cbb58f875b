//! Statement model and parser.
//!
//! - [`ast`]: statements, tag-filter expressions, aggregate functions
//! - [`parser`]: `show ...` / `select ...` parsing on top of the `sqlparser` tokenizer

pub mod ast;
pub mod parser;

pub use ast::{
    like_match, AggFunc, BinaryOp, Expr, Metadata, MetadataType, Query, SelectItem, Statement,
    TimeRange, DEFAULT_METADATA_LIMIT, DEFAULT_NAMESPACE,
};
pub use parser::parse_statement;
