//! DigitalOcean host provisioner.
//!
//! DSN: `digitalocean://ns?token=...&region=nyc3&size=s-2vcpu-4gb&tag=ci`.

use async_trait::async_trait;
use conveyor_core::{ContainerLimits, Dsn, Error, Result};
use serde::Deserialize;
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info};

use super::{CloudHost, HostProvisioner, docker_user_data, pick_tier, random_suffix};

const API: &str = "https://api.digitalocean.com/v2";

/// Droplet sizes ordered smallest first: (slug, vcpus, memory MB).
const SIZES: &[(&str, u32, u64)] = &[
    ("s-1vcpu-1gb", 1, 1024),
    ("s-1vcpu-2gb", 1, 2048),
    ("s-2vcpu-2gb", 2, 2048),
    ("s-2vcpu-4gb", 2, 4096),
    ("s-4vcpu-8gb", 4, 8192),
    ("s-8vcpu-16gb", 8, 16384),
];

pub struct DigitalOcean {
    http: reqwest::Client,
    token: String,
    region: String,
    size_override: Option<String>,
    tag: String,
}

impl DigitalOcean {
    pub fn from_dsn(dsn: &Dsn) -> Result<Self> {
        let token = dsn
            .param("token")
            .ok_or_else(|| Error::Validation("digitalocean driver requires token=".into()))?
            .to_string();
        Ok(Self {
            http: reqwest::Client::new(),
            token,
            region: dsn.param_or("region", "nyc3").to_string(),
            size_override: dsn.param("size").map(str::to_string),
            tag: dsn.param_or("tag", "conveyor").to_string(),
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
            .map_err(|e| Error::Transient(format!("digitalocean {path}: {e}")))?;
        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("digitalocean {path}: {e}")))?;
        if !status.is_success() {
            return Err(Error::Provisioning(format!(
                "digitalocean {path} returned {status}: {value}"
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
            .map_err(|e| Error::Transient(format!("digitalocean {path}: {e}")))?;
        response
            .error_for_status()
            .map_err(|e| Error::Transient(format!("digitalocean {path}: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Transient(format!("digitalocean {path}: {e}")))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{API}{path}"))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Transient(format!("digitalocean {path}: {e}")))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(Error::Transient(format!(
                "digitalocean {path} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct DropletNetworks {
    v4: Vec<DropletAddress>,
}

#[derive(Deserialize)]
struct DropletAddress {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[async_trait]
impl HostProvisioner for DigitalOcean {
    fn name(&self) -> &str {
        "digitalocean"
    }

    async fn create_host(&self, public_key: &str, limits: ContainerLimits) -> Result<CloudHost> {
        let key = self
            .post(
                "/account/keys",
                json!({
                    "name": format!("conveyor-{}", random_suffix(8)),
                    "public_key": public_key,
                }),
            )
            .await?;
        let key_id = key["ssh_key"]["id"]
            .as_u64()
            .ok_or_else(|| Error::Provisioning("digitalocean key response missing id".into()))?
            .to_string();

        let size = self
            .size_override
            .clone()
            .unwrap_or_else(|| pick_tier(SIZES, limits).to_string());
        info!(region = %self.region, size = %size, "creating droplet");

        let droplet = self
            .post(
                "/droplets",
                json!({
                    "name": format!("conveyor-{}", random_suffix(8)),
                    "region": self.region,
                    "size": size,
                    "image": "ubuntu-22-04-x64",
                    "ssh_keys": [key["ssh_key"]["id"]],
                    "user_data": docker_user_data(),
                    "tags": [self.tag],
                }),
            )
            .await?;
        let droplet_id = droplet["droplet"]["id"]
            .as_u64()
            .ok_or_else(|| Error::Provisioning("digitalocean droplet response missing id".into()))?;

        // Poll until the droplet is active and has a public address.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
        loop {
            let current = self.get(&format!("/droplets/{droplet_id}")).await?;
            let status = current["droplet"]["status"].as_str().unwrap_or("");
            debug!(droplet = droplet_id, status = %status, "droplet status");
            if status == "active" {
                let networks: DropletNetworks =
                    serde_json::from_value(current["droplet"]["networks"].clone()).map_err(
                        |e| Error::Provisioning(format!("digitalocean networks: {e}")),
                    )?;
                if let Some(public) = networks.v4.iter().find(|a| a.kind == "public") {
                    let address: IpAddr = public.ip_address.parse().map_err(|e| {
                        Error::Provisioning(format!("digitalocean address: {e}"))
                    })?;
                    return Ok(CloudHost {
                        id: droplet_id.to_string(),
                        key_id,
                        address,
                    });
                }
            }
            if tokio::time::Instant::now() > deadline {
                return Err(Error::Timeout(format!(
                    "droplet {droplet_id} not active after 300s"
                )));
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn destroy_host(&self, host: &CloudHost) -> Result<()> {
        self.delete(&format!("/droplets/{}", host.id)).await?;
        self.delete(&format!("/account/keys/{}", host.key_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_requires_a_token() {
        let dsn = Dsn::parse("digitalocean://ns").unwrap();
        assert!(DigitalOcean::from_dsn(&dsn).is_err());
    }

    #[test]
    fn dsn_params_are_honored() {
        let dsn =
            Dsn::parse("digitalocean://ns?token=t&region=fra1&size=s-4vcpu-8gb&tag=team").unwrap();
        let provisioner = DigitalOcean::from_dsn(&dsn).unwrap();
        assert_eq!(provisioner.region, "fra1");
        assert_eq!(provisioner.size_override.as_deref(), Some("s-4vcpu-8gb"));
        assert_eq!(provisioner.tag, "team");
    }

    #[test]
    fn sizes_scale_with_limits() {
        let limits = ContainerLimits {
            cpus: Some(2),
            memory_mb: Some(3000),
        };
        assert_eq!(pick_tier(SIZES, limits), "s-2vcpu-4gb");
    }
}
