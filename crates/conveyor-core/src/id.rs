//! Pipeline and run identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier of a registered pipeline.
///
/// Derived deterministically from `(name, content)` so that registering the
/// same pipeline twice is idempotent and a content change mints a new id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct PipelineId(String);

impl PipelineId {
    /// Derive the id for a pipeline from its name and program content.
    pub fn derive(name: &str, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for PipelineId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<String> for PipelineId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh random run id.
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(21))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for RunId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_id_is_deterministic() {
        let a = PipelineId::derive("p1", "export const pipeline = async () => {};");
        let b = PipelineId::derive("p1", "export const pipeline = async () => {};");
        assert_eq!(a, b);
    }

    #[test]
    fn pipeline_id_changes_with_content() {
        let a = PipelineId::derive("p1", "content-a");
        let b = PipelineId::derive("p1", "content-b");
        assert_ne!(a, b);
    }

    #[test]
    fn pipeline_id_changes_with_name() {
        let a = PipelineId::derive("p1", "same");
        let b = PipelineId::derive("p2", "same");
        assert_ne!(a, b);
    }

    #[test]
    fn pipeline_id_is_url_safe() {
        let id = PipelineId::derive("p1", "content");
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn run_id_is_21_chars() {
        let id = RunId::generate();
        assert_eq!(id.as_str().len(), 21);
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
    }
}
