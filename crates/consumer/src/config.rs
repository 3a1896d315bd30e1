//! Consumer configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ConsumerError;

/// Configuration for one serviced chain endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Spec id of the serviced chain (e.g. "ETH1").
    pub spec_id: String,

    /// Chain id of the relay settlement chain, bound into every signature.
    pub relay_chain_id: String,

    /// API interface this endpoint serves (e.g. "jsonrpc", "rest").
    pub api_interface: String,

    /// Successful replies gathered per client request.
    #[serde(default = "default_required_responses")]
    pub required_responses: usize,
}

fn default_required_responses() -> usize {
    1
}

impl ConsumerConfig {
    /// Load a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConsumerError> {
        let contents = std::fs::read(path)
            .map_err(|err| ConsumerError::Config(format!("reading {path:?}: {err}")))?;
        serde_json::from_slice(&contents)
            .map_err(|err| ConsumerError::Config(format!("parsing {path:?}: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_responses_defaults_to_one() {
        let config: ConsumerConfig = serde_json::from_str(
            r#"{"spec_id": "ETH1", "relay_chain_id": "relaymesh-1", "api_interface": "jsonrpc"}"#,
        )
        .unwrap();
        assert_eq!(config.required_responses, 1);
    }

    #[test]
    fn test_from_file_missing_path() {
        let err = ConsumerConfig::from_file(Path::new("/nonexistent/consumer.json")).unwrap_err();
        assert!(matches!(err, ConsumerError::Config(_)));
    }
}
