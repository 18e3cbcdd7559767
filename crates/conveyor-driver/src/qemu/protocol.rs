//! Guest-agent wire protocol.
//!
//! Line-delimited JSON over vsock. Stdin/stdout/stderr travel base64
//! encoded so arbitrary bytes survive the framing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const AGENT_PORT: u32 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentRequest {
    Ping,
    Exec {
        path: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdin_data: Option<String>,
    },
    ExecStatus {
        pid: u32,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Base64-encoded output collected since the previous status poll.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl AgentResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_use_kebab_case_tags() {
        let json = serde_json::to_string(&AgentRequest::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);

        let json = serde_json::to_string(&AgentRequest::ExecStatus { pid: 42 }).unwrap();
        assert_eq!(json, r#"{"type":"exec-status","pid":42}"#);
    }

    #[test]
    fn exec_round_trips() {
        let request = AgentRequest::Exec {
            path: "/bin/echo".to_string(),
            args: vec!["hi".to_string()],
            env: HashMap::new(),
            stdin_data: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""type":"exec""#));
        assert!(!json.contains("stdin_data"));
        let parsed: AgentRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, AgentRequest::Exec { .. }));
    }

    #[test]
    fn response_omits_absent_fields() {
        let response = AgentResponse {
            ok: true,
            pid: Some(7),
            ..Default::default()
        };
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"ok":true,"pid":7}"#);
    }
}
