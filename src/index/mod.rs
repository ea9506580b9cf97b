pub mod chunker;
pub mod indexer;

pub use chunker::{assemble_note_chunks, extract_terms, fingerprint, normalize_note_text};
pub use indexer::Indexer;
