//! Driver composition.
//!
//! Parses a DSN, enforces the driver allowlist, instantiates the driver
//! through the scheme registry, and wraps it with the caching layer when
//! the DSN asks for one.

use conveyor_core::{Driver, Dsn, Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::docker::DockerDriver;
use crate::fly::FlyDriver;
use crate::native::NativeDriver;
use crate::qemu::QemuDriver;
use crate::remote::{RemoteDriver, RemoteTimeouts, digitalocean::DigitalOcean, hetzner::Hetzner};

type DriverFactory = fn(&Dsn) -> Result<Arc<dyn Driver>>;

/// Scheme-keyed driver factories.
pub struct DriverRegistry {
    factories: HashMap<&'static str, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, scheme: &'static str, factory: DriverFactory) {
        self.factories.insert(scheme, factory);
    }

    pub fn schemes(&self) -> Vec<&'static str> {
        let mut schemes: Vec<_> = self.factories.keys().copied().collect();
        schemes.sort_unstable();
        schemes
    }

    pub fn instantiate(&self, dsn: &Dsn) -> Result<Arc<dyn Driver>> {
        let factory = self
            .factories
            .get(dsn.scheme())
            .ok_or_else(|| Error::Validation(format!("unknown driver {:?}", dsn.scheme())))?;
        factory(dsn)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("native", |_| {
            Ok(Arc::new(NativeDriver::new()?) as Arc<dyn Driver>)
        });
        registry.register("docker", |dsn| {
            Ok(Arc::new(DockerDriver::new(dsn.namespace())?) as Arc<dyn Driver>)
        });
        registry.register("qemu", |dsn| {
            Ok(Arc::new(QemuDriver::from_dsn(dsn)?) as Arc<dyn Driver>)
        });
        registry.register("digitalocean", |dsn| {
            let provisioner = DigitalOcean::from_dsn(dsn)?;
            Ok(Arc::new(RemoteDriver::new(
                Box::new(provisioner),
                dsn.namespace(),
                remote_timeouts(dsn)?,
            )?) as Arc<dyn Driver>)
        });
        registry.register("hetzner", |dsn| {
            let provisioner = Hetzner::from_dsn(dsn)?;
            Ok(Arc::new(RemoteDriver::new(
                Box::new(provisioner),
                dsn.namespace(),
                remote_timeouts(dsn)?,
            )?) as Arc<dyn Driver>)
        });
        registry.register("fly", |dsn| {
            Ok(Arc::new(FlyDriver::from_dsn(dsn)?) as Arc<dyn Driver>)
        });
        registry
    }
}

fn remote_timeouts(dsn: &Dsn) -> Result<RemoteTimeouts> {
    let mut timeouts = RemoteTimeouts::default();
    if let Some(raw) = dsn.param("ssh_timeout") {
        let secs: u64 = raw
            .parse()
            .map_err(|_| Error::Validation(format!("invalid ssh_timeout={raw:?}")))?;
        timeouts.ssh = Duration::from_secs(secs);
    }
    if let Some(raw) = dsn.param("docker_timeout") {
        let secs: u64 = raw
            .parse()
            .map_err(|_| Error::Validation(format!("invalid docker_timeout={raw:?}")))?;
        timeouts.docker = Duration::from_secs(secs);
    }
    Ok(timeouts)
}

/// The comma-separated driver allowlist; `*` admits everything.
#[derive(Debug, Clone)]
pub struct AllowedDrivers {
    entries: Vec<String>,
}

impl AllowedDrivers {
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

    pub fn allows(&self, scheme: &str) -> bool {
        self.entries.iter().any(|e| e == "*" || e == scheme)
    }

    /// The default driver DSN: the first allowlist entry, or `docker` when
    /// the list is a wildcard.
    pub fn default_dsn(&self) -> String {
        match self.entries.first().map(String::as_str) {
            None | Some("*") => "docker".to_string(),
            Some(first) => first.to_string(),
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

impl Default for AllowedDrivers {
    fn default() -> Self {
        Self::parse("*")
    }
}

/// Validate a DSN against the allowlist without instantiating anything.
/// Used at pipeline registration time.
pub fn validate_dsn(raw: &str, allowed: &AllowedDrivers) -> Result<()> {
    let dsn = Dsn::parse(raw)?;
    if !allowed.allows(dsn.scheme()) {
        return Err(Error::Validation(format!(
            "driver {:?} is not allowed",
            dsn.scheme()
        )));
    }
    Ok(())
}

/// Open the driver a pipeline asked for: parse, check the allowlist,
/// instantiate, and wrap with caching when configured.
pub fn open_driver(raw: &str, allowed: &AllowedDrivers) -> Result<Arc<dyn Driver>> {
    open_driver_with(raw, allowed, &DriverRegistry::default())
}

pub fn open_driver_with(
    raw: &str,
    allowed: &AllowedDrivers,
    registry: &DriverRegistry,
) -> Result<Arc<dyn Driver>> {
    let dsn = Dsn::parse(raw)?;
    if !allowed.allows(dsn.scheme()) {
        return Err(Error::Validation(format!(
            "driver {:?} is not allowed",
            dsn.scheme()
        )));
    }
    let driver = registry.instantiate(&dsn)?;
    conveyor_cache::wrap_driver(driver, &dsn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_parses_and_matches() {
        let allowed = AllowedDrivers::parse("native,docker");
        assert!(allowed.allows("native"));
        assert!(allowed.allows("docker"));
        assert!(!allowed.allows("qemu"));
        assert_eq!(allowed.default_dsn(), "native");
    }

    #[test]
    fn wildcard_allows_anything_and_defaults_to_docker() {
        let allowed = AllowedDrivers::parse("*");
        assert!(allowed.allows("fly"));
        assert_eq!(allowed.default_dsn(), "docker");
    }

    #[test]
    fn validate_rejects_disallowed_scheme_by_name() {
        let allowed = AllowedDrivers::parse("native,docker");
        let err = validate_dsn("qemu", &allowed).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("qemu"));
        assert!(message.contains("not allowed"));
    }

    #[test]
    fn registry_rejects_unknown_schemes() {
        let registry = DriverRegistry::default();
        let dsn = Dsn::parse("warp://ns").unwrap();
        assert!(registry.instantiate(&dsn).is_err());
    }

    #[test]
    fn registry_lists_schemes_sorted() {
        let registry = DriverRegistry::default();
        assert_eq!(
            registry.schemes(),
            vec!["digitalocean", "docker", "fly", "hetzner", "native", "qemu"]
        );
    }

    #[tokio::test]
    async fn open_driver_builds_native_and_wraps_cache() {
        let allowed = AllowedDrivers::parse("*");
        let plain = open_driver("native://", &allowed).unwrap();
        assert_eq!(plain.name(), "native");

        let cached = open_driver("native://?cache=memory://", &allowed).unwrap();
        // The wrapper keeps the inner driver's name.
        assert_eq!(cached.name(), "native");
        assert!(cached.volume_data().is_some());
    }

    #[tokio::test]
    async fn open_driver_enforces_the_allowlist() {
        let allowed = AllowedDrivers::parse("docker");
        let err = open_driver("native://", &allowed).unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }
}
