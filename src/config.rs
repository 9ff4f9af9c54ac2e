//! Process configuration
//!
//! All environment lookups happen once at startup in `from_env`; the
//! resulting structs are threaded explicitly through constructors.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Registry hosts always treated as aliases of the default registry.
const DEFAULT_REGISTRY_ALIASES: &[&str] = &["index.docker.io", "docker.io"];

/// The registry used when a reference does not name one.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Maximum number of concurrent model pulls per process.
pub const DEFAULT_MAX_CONCURRENT_PULLS: usize = 2;

/// Registry-facing options, resolved once from `DEFAULT_REGISTRY` and
/// `INSECURE_REGISTRY`.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub default_registry: String,
    /// When true, registries are addressed over http:// instead of https://.
    pub insecure: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_registry: DEFAULT_REGISTRY.to_string(),
            insecure: false,
        }
    }
}

impl RegistrySettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(registry) = std::env::var("DEFAULT_REGISTRY") {
            let registry = registry.trim().to_string();
            // The Docker Hub aliases always mean "the default"; anything else
            // overrides it.
            if !registry.is_empty() && !DEFAULT_REGISTRY_ALIASES.contains(&registry.as_str()) {
                settings.default_registry = registry;
            }
        }
        if let Ok(insecure) = std::env::var("INSECURE_REGISTRY") {
            settings.insecure = insecure.trim().eq_ignore_ascii_case("true");
        }
        settings
    }

    /// Whether the given host is the default registry or one of its aliases.
    pub fn is_default_registry(&self, host: &str) -> bool {
        host == self.default_registry || DEFAULT_REGISTRY_ALIASES.contains(&host)
    }

    /// Scheme-qualified base URL for a registry host.
    pub fn base_url(&self, host: &str) -> String {
        if self.insecure {
            format!("http://{host}")
        } else {
            format!("https://{host}")
        }
    }
}

/// Top-level runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory of the model store.
    pub store_root: PathBuf,
    pub host: String,
    pub port: u16,
    /// Origins allowed by the CORS layer.
    pub allowed_origins: Vec<String>,
    pub max_concurrent_pulls: usize,
    /// Incomplete downloads older than this are removed by the janitor.
    pub stale_download_max_age: Duration,
    pub registry: RegistrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_root: default_store_root(),
            host: "127.0.0.1".to_string(),
            port: 13131,
            allowed_origins: Vec::new(),
            max_concurrent_pulls: DEFAULT_MAX_CONCURRENT_PULLS,
            stale_download_max_age: Duration::from_secs(24 * 60 * 60),
            registry: RegistrySettings::default(),
        }
    }
}

fn default_store_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("modelstream")
        .join("models")
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        settings.registry = RegistrySettings::from_env();

        if let Ok(root) = std::env::var("MODELSTREAM_STORE_ROOT") {
            if !root.trim().is_empty() {
                settings.store_root = PathBuf::from(root);
            }
        }
        if let Ok(host) = std::env::var("MODELSTREAM_HOST") {
            if !host.trim().is_empty() {
                settings.host = host;
            }
        }
        if let Ok(port) = std::env::var("MODELSTREAM_PORT") {
            if let Ok(port) = port.trim().parse() {
                settings.port = port;
            }
        }
        if let Ok(origins) = std::env::var("MODELSTREAM_CORS_ORIGINS") {
            settings.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(pulls) = std::env::var("MODELSTREAM_MAX_CONCURRENT_PULLS") {
            if let Ok(n) = pulls.trim().parse::<usize>() {
                if n > 0 {
                    settings.max_concurrent_pulls = n;
                }
            }
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_aliases() {
        let settings = RegistrySettings::default();
        assert!(settings.is_default_registry("index.docker.io"));
        assert!(settings.is_default_registry("docker.io"));
        assert!(!settings.is_default_registry("hf.co"));
    }

    #[test]
    fn test_custom_default_registry_still_aliases_docker() {
        let settings = RegistrySettings {
            default_registry: "registry.example.com".into(),
            insecure: false,
        };
        assert!(settings.is_default_registry("registry.example.com"));
        assert!(settings.is_default_registry("docker.io"));
    }

    #[test]
    fn test_base_url_scheme() {
        let secure = RegistrySettings::default();
        assert_eq!(secure.base_url("reg.io"), "https://reg.io");

        let insecure = RegistrySettings {
            insecure: true,
            ..Default::default()
        };
        assert_eq!(insecure.base_url("reg.io"), "http://reg.io");
    }
}
