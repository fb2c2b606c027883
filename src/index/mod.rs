//! Local full-text index
//!
//! - Term generation from document texts and explicit terms
//! - In-memory inverted index with tf-idf style scoring
//! - sled-backed document persistence

mod analyzer;
mod inverted;
mod storage;

pub use analyzer::*;
pub use inverted::*;
pub use storage::*;
