//! The `schema` module stores named payload schemas keyed by topic and
//! validates inbound JSON payloads against them.
//!
//! A schema body is a small subset of JSON Schema: `type` (object, string,
//! number, boolean, array) plus `properties`/`required` on objects,
//! `minimum`/`maximum` on numbers and `enum` on strings. Array items are not
//! validated against an item schema.

pub mod registry;
pub mod validator;

pub use registry::{
    MAX_SCHEMA_NAME_LEN, MAX_SCHEMAS, MAX_TOPIC_PATTERN_LEN, Schema, SchemaRegistry,
    ValidatorStats,
};
pub use validator::{ValidationError, ValidationResult};
