//! Fly.io API client: machines and volumes over the machines REST API,
//! WireGuard peers and log access over the platform API.

use conveyor_core::{Error, Result};
use serde::Deserialize;
use serde_json::json;
use std::net::Ipv6Addr;
use tracing::debug;

const MACHINES_API: &str = "https://api.machines.dev/v1";
const PLATFORM_API: &str = "https://api.fly.io";

pub struct FlyClient {
    http: reqwest::Client,
    token: String,
    app: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub events: Vec<MachineEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub request: Option<MachineEventRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MachineEventRequest {
    #[serde(default)]
    pub exit_event: Option<ExitEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitEvent {
    #[serde(default)]
    pub exit_code: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlyVolume {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct WireGuardPeer {
    pub local_ip: Ipv6Addr,
    pub endpoint_ip: String,
    pub gateway_public_key: String,
}

impl Machine {
    pub fn exit_code(&self) -> Option<i64> {
        self.events
            .iter()
            .find(|event| event.kind == "exit")
            .and_then(|event| event.request.as_ref())
            .and_then(|request| request.exit_event.as_ref())
            .map(|exit| exit.exit_code)
    }

    pub fn private_ipv6(&self) -> Result<Ipv6Addr> {
        self.private_ip
            .as_deref()
            .ok_or_else(|| Error::Provisioning(format!("machine {} has no private ip", self.id)))?
            .parse()
            .map_err(|e| Error::Provisioning(format!("machine {} private ip: {e}", self.id)))
    }
}

impl FlyClient {
    pub fn new(token: &str, app: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.to_string(),
            app: app.to_string(),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut request = self.http.request(method, &url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Transient(format!("fly api {url}: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transient(format!("fly api {url}: {e}")))?;
        if !status.is_success() {
            return Err(Error::Provisioning(format!(
                "fly api {url} returned {status}: {text}"
            )));
        }
        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::Transient(format!("fly api {url} body: {e}")))
    }

    pub async fn create_machine(
        &self,
        name: &str,
        config: serde_json::Value,
        region: &str,
    ) -> Result<Machine> {
        let body = json!({
            "name": name,
            "region": region,
            "config": config,
        });
        let value = self
            .request(
                reqwest::Method::POST,
                format!("{MACHINES_API}/apps/{}/machines", self.app),
                Some(body),
            )
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Transient(format!("machine decode: {e}")))
    }

    pub async fn get_machine(&self, id: &str) -> Result<Machine> {
        let value = self
            .request(
                reqwest::Method::GET,
                format!("{MACHINES_API}/apps/{}/machines/{id}", self.app),
                None,
            )
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Transient(format!("machine decode: {e}")))
    }

    pub async fn find_machine_by_name(&self, name: &str) -> Result<Option<Machine>> {
        let value = self
            .request(
                reqwest::Method::GET,
                format!("{MACHINES_API}/apps/{}/machines", self.app),
                None,
            )
            .await?;
        let machines: Vec<Machine> = serde_json::from_value(value)
            .map_err(|e| Error::Transient(format!("machine list decode: {e}")))?;
        Ok(machines.into_iter().find(|m| m.name == name))
    }

    /// Block until the machine reaches `state` or the server-side wait
    /// times out.
    pub async fn wait_machine(&self, id: &str, state: &str) -> Result<()> {
        self.request(
            reqwest::Method::GET,
            format!(
                "{MACHINES_API}/apps/{}/machines/{id}/wait?state={state}&timeout=60",
                self.app
            ),
            None,
        )
        .await
        .map(drop)
    }

    pub async fn start_machine(&self, id: &str) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            format!("{MACHINES_API}/apps/{}/machines/{id}/start", self.app),
            None,
        )
        .await
        .map(drop)
    }

    /// Suspend keeps the machine's memory image so resume is cheap.
    pub async fn suspend_machine(&self, id: &str) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            format!("{MACHINES_API}/apps/{}/machines/{id}/suspend", self.app),
            None,
        )
        .await
        .map(drop)
    }

    pub async fn destroy_machine(&self, id: &str) -> Result<()> {
        self.request(
            reqwest::Method::DELETE,
            format!(
                "{MACHINES_API}/apps/{}/machines/{id}?force=true",
                self.app
            ),
            None,
        )
        .await
        .map(drop)
    }

    pub async fn create_volume(&self, name: &str, size_gb: u32, region: &str) -> Result<FlyVolume> {
        let body = json!({
            "name": name,
            "size_gb": size_gb.max(1),
            "region": region,
        });
        let value = self
            .request(
                reqwest::Method::POST,
                format!("{MACHINES_API}/apps/{}/volumes", self.app),
                Some(body),
            )
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Transient(format!("volume decode: {e}")))
    }

    pub async fn delete_volume(&self, id: &str) -> Result<()> {
        self.request(
            reqwest::Method::DELETE,
            format!("{MACHINES_API}/apps/{}/volumes/{id}", self.app),
            None,
        )
        .await
        .map(drop)
    }

    /// Recent log lines for one machine, oldest first.
    pub async fn machine_logs(&self, machine_id: &str) -> Result<Vec<LogEntry>> {
        let value = self
            .request(
                reqwest::Method::GET,
                format!(
                    "{PLATFORM_API}/api/v1/apps/{}/logs?instance={machine_id}",
                    self.app
                ),
                None,
            )
            .await?;
        let envelope: LogEnvelope = serde_json::from_value(value)
            .map_err(|e| Error::Transient(format!("log decode: {e}")))?;
        Ok(envelope.data.into_iter().map(|d| d.attributes).collect())
    }

    /// Register a WireGuard peer for this session and return the gateway
    /// coordinates.
    pub async fn add_wireguard_peer(
        &self,
        org_slug: &str,
        region: &str,
        name: &str,
        public_key: &str,
    ) -> Result<WireGuardPeer> {
        let org = self
            .graphql(
                "query($slug:String!){ organization(slug:$slug){ id } }",
                json!({ "slug": org_slug }),
            )
            .await?;
        let org_id = org["data"]["organization"]["id"]
            .as_str()
            .ok_or_else(|| Error::Provisioning(format!("unknown fly organization {org_slug}")))?
            .to_string();

        let peer = self
            .graphql(
                r#"mutation($input:AddWireGuardPeerInput!){
                    addWireGuardPeer(input:$input){ peerip endpointip pubkey }
                }"#,
                json!({
                    "input": {
                        "organizationId": org_id,
                        "region": region,
                        "name": name,
                        "pubkey": public_key,
                    }
                }),
            )
            .await?;
        let added = &peer["data"]["addWireGuardPeer"];
        let local_ip: Ipv6Addr = added["peerip"]
            .as_str()
            .ok_or_else(|| Error::Provisioning("peer response missing peerip".into()))?
            .parse()
            .map_err(|e| Error::Provisioning(format!("peerip: {e}")))?;
        debug!(peer = %local_ip, "wireguard peer registered");

        Ok(WireGuardPeer {
            local_ip,
            endpoint_ip: added["endpointip"]
                .as_str()
                .ok_or_else(|| Error::Provisioning("peer response missing endpointip".into()))?
                .to_string(),
            gateway_public_key: added["pubkey"]
                .as_str()
                .ok_or_else(|| Error::Provisioning("peer response missing pubkey".into()))?
                .to_string(),
        })
    }

    async fn graphql(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let value = self
            .request(
                reqwest::Method::POST,
                format!("{PLATFORM_API}/graphql"),
                Some(json!({ "query": query, "variables": variables })),
            )
            .await?;
        if let Some(errors) = value.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                return Err(Error::Provisioning(format!("fly graphql: {errors:?}")));
            }
        }
        Ok(value)
    }
}

#[derive(Debug, Deserialize)]
struct LogEnvelope {
    #[serde(default)]
    data: Vec<LogDatum>,
}

#[derive(Debug, Deserialize)]
struct LogDatum {
    attributes: LogEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub level: String,
}
