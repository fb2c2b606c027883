//! Query paging configuration

use serde::{Deserialize, Serialize};

/// Page size limits applied to SEARCH
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// LIMIT used when a query gives none
    pub default_limit: usize,
    /// Larger LIMITs are clamped to this
    pub max_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 10_000,
        }
    }
}
