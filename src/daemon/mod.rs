//! Daemon Module
//!
//! The TCP server that speaks the lindex line protocol.
//!
//! # Architecture
//!
//! ```text
//! client ──▶ Server ──▶ Connection (one task, owns a Session)
//!                           │
//!                           ▼
//!                     RequestHandler
//!                      │          │
//!                      ▼          ▼
//!             EndpointRegistry  QueryCoordinator ──▶ fan-out to backends
//! ```
//!
//! # Usage
//!
//! ```bash
//! lindex start --listen 127.0.0.1:33333
//! ```

pub mod command;
pub mod handler;
pub mod lifecycle;
pub mod protocol;
pub mod server;

pub use command::{parse_command, parse_document, Command};
pub use handler::{RequestHandler, Session};
pub use lifecycle::Daemon;
pub use protocol::{Response, Status};
pub use server::{ConnectionState, Server};
