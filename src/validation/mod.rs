pub mod parser;
pub mod rules;
pub mod service;

pub use parser::{parse, ParseError, ParsedSource};
pub use service::{CacheStats, CodeValidator};

use serde::{Deserialize, Serialize};

use crate::types::Strictness;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub cache_ttl_secs: u64,
    pub complexity_threshold: usize,
    pub max_line_length: usize,
    /// Used when a caller does not ask for a strictness.
    pub default_strictness: Strictness,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 24 * 60 * 60,
            complexity_threshold: 10,
            max_line_length: 120,
            default_strictness: Strictness::Standard,
        }
    }
}
