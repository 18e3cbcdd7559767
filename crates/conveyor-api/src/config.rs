//! Server configuration from the environment.

use conveyor_driver::AllowedDrivers;
use conveyor_scheduler::DEFAULT_MAX_IN_FLIGHT;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Feature allowlist, comma separated; `*` enables everything.
#[derive(Debug, Clone)]
pub struct Features {
    entries: Vec<String>,
}

impl Features {
    pub fn parse(raw: &str) -> Self {
        Self {
            entries: raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn allows(&self, feature: &str) -> bool {
        self.entries.iter().any(|e| e == "*" || e == feature)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub database_path: PathBuf,
    pub allowed_drivers: AllowedDrivers,
    pub features: Features,
    pub max_in_flight: usize,
    pub webhook_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let listen_addr = env_or("CONVEYOR_LISTEN", "0.0.0.0:3000")
            .parse()
            .unwrap_or_else(|_| {
                warn!("invalid CONVEYOR_LISTEN, falling back to 0.0.0.0:3000");
                SocketAddr::from(([0, 0, 0, 0], 3000))
            });

        Self {
            listen_addr,
            database_path: PathBuf::from(env_or("CONVEYOR_DB", "conveyor.db")),
            allowed_drivers: AllowedDrivers::parse(&env_or("CONVEYOR_DRIVERS", "*")),
            features: Features::parse(&env_or("CONVEYOR_FEATURES", "*")),
            max_in_flight: env_or("CONVEYOR_MAX_IN_FLIGHT", "10")
                .parse()
                .unwrap_or(DEFAULT_MAX_IN_FLIGHT),
            webhook_timeout: Duration::from_secs(
                env_or("CONVEYOR_WEBHOOK_TIMEOUT", "30").parse().unwrap_or(30),
            ),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn features_parse_and_match() {
        let features = Features::parse("webhooks,secrets");
        assert!(features.allows("webhooks"));
        assert!(!features.allows("terminal"));

        let all = Features::parse("*");
        assert!(all.allows("webhooks"));

        let none = Features::parse("");
        assert!(!none.allows("webhooks"));
    }
}
