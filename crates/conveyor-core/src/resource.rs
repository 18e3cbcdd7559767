//! Resource-plugin protocol shapes.
//!
//! Resource plugins (`git`, `mock`, ...) live outside the core; pipelines
//! talk to them through this JSON protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::Result;

/// An opaque resource version: a flat string map.
pub type Version = BTreeMap<String, String>;

/// A single metadata entry reported by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub source: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

/// Versions newer than the requested one, oldest first.
pub type CheckResponse = Vec<Version>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InRequest {
    pub source: serde_json::Value,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InResponse {
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutRequest {
    pub source: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutResponse {
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

/// The operations every resource plugin answers.
#[async_trait]
pub trait ResourcePlugin: Send + Sync {
    async fn check(&self, req: CheckRequest) -> Result<CheckResponse>;

    async fn fetch(&self, dest_dir: &Path, req: InRequest) -> Result<InResponse>;

    async fn publish(&self, src_dir: &Path, req: OutRequest) -> Result<OutResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_request_omits_absent_version() {
        let req = CheckRequest {
            source: serde_json::json!({"uri": "https://example.com/repo.git"}),
            version: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("version"));
    }

    #[test]
    fn version_round_trips() {
        let mut version = Version::new();
        version.insert("ref".to_string(), "abc123".to_string());
        let resp = InResponse {
            version: version.clone(),
            metadata: vec![MetadataEntry {
                name: "author".to_string(),
                value: "dev".to_string(),
            }],
        };
        let parsed: InResponse = serde_json::from_str(&serde_json::to_string(&resp).unwrap()).unwrap();
        assert_eq!(parsed.version, version);
        assert_eq!(parsed.metadata.len(), 1);
    }
}
