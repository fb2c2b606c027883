//! Endpoints: addressable databases, local or remote
//!
//! - Address grammar and normalization
//! - Process-wide registry with single-flight opens

mod address;
mod registry;

pub use address::*;
pub use registry::*;

use std::fmt;
use std::sync::Arc;

use crate::backend::StorageBackend;

/// Resolved endpoint: its canonical address plus a shared backend handle
#[derive(Clone)]
pub struct Endpoint {
    pub address: EndpointAddress,
    pub backend: Arc<dyn StorageBackend>,
}

impl Endpoint {
    pub fn new(address: EndpointAddress, backend: Arc<dyn StorageBackend>) -> Self {
        Self { address, backend }
    }

    /// Name reported to clients
    pub fn name(&self) -> String {
        self.address.to_string()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address.to_string())
            .field("kind", &self.backend.kind())
            .finish()
    }
}
