//! lindex: line-protocol search server
//!
//! A text-protocol server for indexing and searching JSON documents across
//! one or more databases, featuring:
//! - Local databases persisted with sled, searched through an inverted index
//! - Remote databases hosted by peer lindex servers
//! - Concurrent fan-out with a per-command deadline and deterministic merge
//! - Faceting, ordering, partial-word matching and global pagination

pub mod backend;
pub mod client;
pub mod config;
pub mod daemon;
pub mod endpoint;
pub mod error;
pub mod index;
pub mod query;
pub mod types;

pub use config::Config;
pub use types::*;
