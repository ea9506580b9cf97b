pub mod analyzer;

pub use analyzer::{analyze, is_unique_identifier, normalize_query};
