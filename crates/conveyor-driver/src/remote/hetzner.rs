//! Hetzner Cloud host provisioner.
//!
//! DSN: `hetzner://ns?token=...&location=fsn1&server_type=cx32&label=ci`.

use async_trait::async_trait;
use conveyor_core::{ContainerLimits, Dsn, Error, Result};
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

use super::{CloudHost, HostProvisioner, docker_user_data, pick_tier, random_suffix};

const API: &str = "https://api.hetzner.cloud/v1";

/// Server types ordered smallest first: (name, vcpus, memory MB).
const SERVER_TYPES: &[(&str, u32, u64)] = &[
    ("cx22", 2, 4096),
    ("cx32", 4, 8192),
    ("cx42", 8, 16384),
    ("cx52", 16, 32768),
];

pub struct Hetzner {
    http: reqwest::Client,
    token: String,
    location: String,
    server_type_override: Option<String>,
    label: String,
}

impl Hetzner {
    pub fn from_dsn(dsn: &Dsn) -> Result<Self> {
        let token = dsn
            .param("token")
            .ok_or_else(|| Error::Validation("hetzner driver requires token=".into()))?
            .to_string();
        Ok(Self {
            http: reqwest::Client::new(),
            token,
            location: dsn.param_or("location", "fsn1").to_string(),
            server_type_override: dsn.param("server_type").map(str::to_string),
            label: dsn.param_or("label", "conveyor").to_string(),
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(format!("{API}{path}"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("hetzner {path}: {e}")))?;
        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("hetzner {path}: {e}")))?;
        if !status.is_success() {
            return Err(Error::Provisioning(format!(
                "hetzner {path} returned {status}: {value}"
            )));
        }
        Ok(value)
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{API}{path}"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("hetzner {path}: {e}")))?;
        response
            .error_for_status()
            .map_err(|e| Error::Transient(format!("hetzner {path}: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Transient(format!("hetzner {path}: {e}")))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{API}{path}"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("hetzner {path}: {e}")))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(Error::Transient(format!(
                "hetzner {path} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl HostProvisioner for Hetzner {
    fn name(&self) -> &str {
        "hetzner"
    }

    async fn create_host(&self, public_key: &str, limits: ContainerLimits) -> Result<CloudHost> {
        let key = self
            .post(
                "/ssh_keys",
                json!({
                    "name": format!("conveyor-{}", random_suffix(8)),
                    "public_key": public_key,
                }),
            )
            .await?;
        let key_id = key["ssh_key"]["id"]
            .as_u64()
            .ok_or_else(|| Error::Provisioning("hetzner key response missing id".into()))?;

        let server_type = self
            .server_type_override
            .clone()
            .unwrap_or_else(|| pick_tier(SERVER_TYPES, limits).to_string());
        info!(location = %self.location, server_type = %server_type, "creating server");

        let server = self
            .post(
                "/servers",
                json!({
                    "name": format!("conveyor-{}", random_suffix(8)),
                    "location": self.location,
                    "server_type": server_type,
                    "image": "ubuntu-22.04",
                    "ssh_keys": [key_id],
                    "user_data": docker_user_data(),
                    "labels": { "managed-by": self.label },
                }),
            )
            .await?;
        let server_id = server["server"]["id"]
            .as_u64()
            .ok_or_else(|| Error::Provisioning("hetzner server response missing id".into()))?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
        loop {
            let current = self.get(&format!("/servers/{server_id}")).await?;
            let status = current["server"]["status"].as_str().unwrap_or("");
            debug!(server = server_id, status = %status, "server status");
            if status == "running" {
                let ip = current["server"]["public_net"]["ipv4"]["ip"]
                    .as_str()
                    .ok_or_else(|| Error::Provisioning("hetzner server has no ipv4".into()))?;
                let address: IpAddr = ip
                    .parse()
                    .map_err(|e| Error::Provisioning(format!("hetzner address: {e}")))?;
                return Ok(CloudHost {
                    id: server_id.to_string(),
                    key_id: key_id.to_string(),
                    address,
                });
            }
            if tokio::time::Instant::now() > deadline {
                return Err(Error::Timeout(format!(
                    "server {server_id} not running after 300s"
                )));
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn destroy_host(&self, host: &CloudHost) -> Result<()> {
        self.delete(&format!("/servers/{}", host.id)).await?;
        self.delete(&format!("/ssh_keys/{}", host.key_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_requires_a_token() {
        let dsn = Dsn::parse("hetzner://ns").unwrap();
        assert!(Hetzner::from_dsn(&dsn).is_err());
    }

    #[test]
    fn server_types_scale_with_limits() {
        assert_eq!(pick_tier(SERVER_TYPES, ContainerLimits::default()), "cx22");
        let limits = ContainerLimits {
            cpus: Some(6),
            memory_mb: Some(4096),
        };
        assert_eq!(pick_tier(SERVER_TYPES, limits), "cx42");
    }
}
