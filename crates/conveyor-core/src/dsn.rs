//! Driver DSN parsing.
//!
//! A DSN names a driver scheme, a namespace, and per-driver parameters:
//! `docker://my-project?cache=s3://bucket&cache_compression=zstd`.

use std::collections::HashMap;
use url::Url;

use crate::{Error, Result};

/// A parsed driver DSN.
#[derive(Debug, Clone)]
pub struct Dsn {
    scheme: String,
    namespace: String,
    params: HashMap<String, String>,
    raw: String,
}

impl Dsn {
    pub fn parse(input: &str) -> Result<Self> {
        // Bare scheme shorthand: "docker" == "docker://".
        let normalized = if input.contains("://") {
            input.to_string()
        } else {
            format!("{input}://")
        };

        let url = Url::parse(&normalized)
            .map_err(|e| Error::Validation(format!("invalid driver DSN {input:?}: {e}")))?;

        let mut params = HashMap::new();
        for (key, value) in url.query_pairs() {
            params.insert(key.into_owned(), value.into_owned());
        }

        Ok(Self {
            scheme: url.scheme().to_string(),
            namespace: url.host_str().unwrap_or_default().to_string(),
            params,
            raw: input.to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Look up a parameter. Unknown parameters are simply absent.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn param_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.param(key).unwrap_or(default)
    }

    /// The DSN exactly as the user wrote it.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for Dsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_namespace_and_params() {
        let dsn = Dsn::parse("docker://ci-ns?cache=s3://bucket&cache_prefix=pfx").unwrap();
        assert_eq!(dsn.scheme(), "docker");
        assert_eq!(dsn.namespace(), "ci-ns");
        assert_eq!(dsn.param("cache"), Some("s3://bucket"));
        assert_eq!(dsn.param("cache_prefix"), Some("pfx"));
    }

    #[test]
    fn bare_scheme_is_accepted() {
        let dsn = Dsn::parse("native").unwrap();
        assert_eq!(dsn.scheme(), "native");
        assert_eq!(dsn.namespace(), "");
    }

    #[test]
    fn empty_namespace_is_accepted() {
        let dsn = Dsn::parse("native://").unwrap();
        assert_eq!(dsn.scheme(), "native");
        assert_eq!(dsn.namespace(), "");
    }

    #[test]
    fn unknown_params_are_readable_but_harmless() {
        let dsn = Dsn::parse("docker://ns?bogus=1").unwrap();
        assert_eq!(dsn.param("bogus"), Some("1"));
        assert_eq!(dsn.param("cache"), None);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Dsn::parse("://nope").is_err());
    }

    #[test]
    fn default_fallback() {
        let dsn = Dsn::parse("qemu://ns").unwrap();
        assert_eq!(dsn.param_or("memory", "2048"), "2048");
    }
}
