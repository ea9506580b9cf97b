pub mod answer;
pub mod cache;
pub mod core;
pub mod embedding;
pub mod index;
pub mod query;
pub mod retrieval;
pub mod store;
pub mod transport;
pub mod vector;

// --- Primary core exports ---
pub use crate::core::config::{self, Config};
pub use crate::core::error::{Error, Result};
pub use crate::core::types;
pub use crate::core::types::*;
pub use crate::core::AppState;

// --- Flat module paths ---
pub use answer::{generator, prompt, source_pack, validator};
pub use index::{chunker, indexer};
pub use query::analyzer;
pub use retrieval::engine;
