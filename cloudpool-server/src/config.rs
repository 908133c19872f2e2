use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use cloudpool_backends::{BackendConfig, RcloneSettings, SelectionPolicy, UnionConfig};
use cloudpool_cache::CacheConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub rclone: RcloneSettings,
    #[serde(default)]
    pub union: UnionSection,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_secs: default_ttl_secs(),
            capacity_bytes: default_capacity_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnionSection {
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_probe_ttl_secs")]
    pub probe_ttl_secs: u64,
    #[serde(default)]
    pub selection: SelectionPolicy,
}

impl Default for UnionSection {
    fn default() -> Self {
        Self {
            op_timeout_secs: default_op_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_ttl_secs: default_probe_ttl_secs(),
            selection: SelectionPolicy::default(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:5601".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_ttl_secs() -> u64 {
    86_400
}

fn default_capacity_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_op_timeout_secs() -> u64 {
    30
}

fn default_transfer_timeout_secs() -> u64 {
    3600
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_probe_ttl_secs() -> u64 {
    30
}

impl GatewayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: GatewayConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment variables take precedence over the file.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = get("CLOUDPOOL_LISTEN") {
            self.listen = listen;
        }
        if let Some(dir) = get("CLOUDPOOL_CACHE_DIR") {
            self.cache.dir = PathBuf::from(dir);
        }
        if let Some(bin) = get("CLOUDPOOL_RCLONE_BIN") {
            self.rclone.binary = PathBuf::from(bin);
        }
        if let Some(path) = get("RCLONE_CONFIG") {
            self.rclone.config_path = Some(PathBuf::from(path));
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backends.is_empty() {
            bail!("at least one [[backends]] entry is required");
        }
        let mut names = HashSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                bail!("duplicate backend name: {}", backend.name);
            }
        }
        if self.cache.ttl_secs == 0 {
            bail!("cache.ttl_secs must be greater than zero");
        }
        if self.cache.capacity_bytes == 0 {
            bail!("cache.capacity_bytes must be greater than zero");
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("invalid listen address: {}", self.listen))
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            root: self.cache.dir.clone(),
            capacity_bytes: self.cache.capacity_bytes,
            ttl: Duration::from_secs(self.cache.ttl_secs),
        }
    }

    pub fn union_config(&self) -> UnionConfig {
        UnionConfig {
            op_timeout: Duration::from_secs(self.union.op_timeout_secs),
            transfer_timeout: Duration::from_secs(self.union.transfer_timeout_secs),
            probe_timeout: Duration::from_secs(self.union.probe_timeout_secs),
            probe_ttl: Duration::from_secs(self.union.probe_ttl_secs),
            selection: self.union.selection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudpool_backends::BackendKind;

    const MINIMAL: &str = r#"
[[backends]]
name = "gdrive"
type = "rclone"
remote = "gdrive"
"#;

    #[test]
    fn test_parse_valid_config() {
        let toml_str = r#"
listen = "127.0.0.1:9000"

[cache]
dir = "/var/cache/cloudpool"
ttl_secs = 600
capacity_bytes = 1048576

[rclone]
binary = "/usr/local/bin/rclone"
extra_args = ["--fast-list"]

[union]
op_timeout_secs = 10
selection = "least_loaded"

[[backends]]
name = "gdrive"
priority = 10
type = "rclone"
remote = "gdrive"
root = "media"

[[backends]]
name = "scratch"
type = "directory"
path = "/srv/scratch"
"#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen_addr().unwrap().port(), 9000);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].priority, 10);
        assert!(matches!(
            config.backends[1].kind,
            BackendKind::Directory { ref path } if path == Path::new("/srv/scratch")
        ));

        let cache = config.cache_config();
        assert_eq!(cache.ttl, Duration::from_secs(600));
        assert_eq!(cache.capacity_bytes, 1_048_576);

        let union = config.union_config();
        assert_eq!(union.op_timeout, Duration::from_secs(10));
        assert_eq!(union.transfer_timeout, Duration::from_secs(3600));
        assert_eq!(union.selection, SelectionPolicy::LeastLoaded);
    }

    #[test]
    fn test_defaults() {
        let config: GatewayConfig = toml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen, "0.0.0.0:5601");
        assert_eq!(config.cache.dir, PathBuf::from("./cache"));
        assert_eq!(config.cache.ttl_secs, 86_400);
        assert_eq!(config.cache.capacity_bytes, 10 << 30);
        assert_eq!(config.rclone.binary, PathBuf::from("rclone"));
        assert_eq!(config.union.selection, SelectionPolicy::RoundRobin);
    }

    #[test]
    fn test_env_overrides() {
        let mut config: GatewayConfig = toml::from_str(MINIMAL).unwrap();
        config.apply_overrides(|name| match name {
            "CLOUDPOOL_LISTEN" => Some("127.0.0.1:7000".to_string()),
            "CLOUDPOOL_CACHE_DIR" => Some("/tmp/cp".to_string()),
            "RCLONE_CONFIG" => Some("/etc/rclone.conf".to_string()),
            _ => None,
        });
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert_eq!(config.cache.dir, PathBuf::from("/tmp/cp"));
        assert_eq!(config.rclone.binary, PathBuf::from("rclone"));
        assert_eq!(
            config.rclone.config_path,
            Some(PathBuf::from("/etc/rclone.conf"))
        );
    }

    #[test]
    fn test_no_backends_rejected() {
        let config: GatewayConfig = toml::from_str("listen = \"0.0.0.0:5601\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_backend_names_rejected() {
        let toml_str = r#"
[[backends]]
name = "a"
type = "directory"
path = "/a"

[[backends]]
name = "a"
type = "directory"
path = "/b"
"#;
        let config: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let toml_str = format!("[cache]\nttl_secs = 0\n{}", MINIMAL);
        let config: GatewayConfig = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_listen_rejected() {
        let toml_str = format!("listen = \"nowhere\"\n{}", MINIMAL);
        let config: GatewayConfig = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloudpool.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = GatewayConfig::load(&path).unwrap();
        assert_eq!(config.backends[0].name, "gdrive");

        assert!(GatewayConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
