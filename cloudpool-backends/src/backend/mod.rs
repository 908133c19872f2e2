pub mod directory;
mod process;
pub mod rclone;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use serde::Deserialize;

use cloudpool_common::BackendAdapter;

use self::directory::DirectoryAdapter;
use self::rclone::RcloneAdapter;

/// One `[[backends]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// Higher is tried first for reads.
    #[serde(default)]
    pub priority: i32,
    #[serde(flatten)]
    pub kind: BackendKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendKind {
    /// A remote defined in the rclone config file, optionally rooted at a
    /// sub-path (`remote:root/...`).
    Rclone {
        remote: String,
        #[serde(default)]
        root: Option<String>,
    },
    Directory { path: PathBuf },
}

/// How to invoke the external sync utility. Shared by every rclone backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RcloneSettings {
    #[serde(default = "default_rclone_binary")]
    pub binary: PathBuf,
    /// Exported to each subprocess as `RCLONE_CONFIG`.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// Global flags placed before the subcommand.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_rclone_binary() -> PathBuf {
    PathBuf::from("rclone")
}

impl Default for RcloneSettings {
    fn default() -> Self {
        Self {
            binary: default_rclone_binary(),
            config_path: None,
            extra_args: Vec::new(),
        }
    }
}

/// Construct a backend adapter from its config table.
///
/// `transfer_timeout` caps how long one streamed transfer may keep its
/// subprocess alive.
pub fn from_config(
    backend: &BackendConfig,
    rclone: &RcloneSettings,
    transfer_timeout: Duration,
) -> anyhow::Result<Arc<dyn BackendAdapter>> {
    if backend.name.trim().is_empty() {
        bail!("backend name must not be empty");
    }
    match &backend.kind {
        BackendKind::Rclone { remote, root } => {
            let remote = remote.trim_end_matches(':');
            if remote.is_empty() {
                bail!("backend '{}': rclone remote must not be empty", backend.name);
            }
            Ok(Arc::new(
                RcloneAdapter::new(&backend.name, remote, root.as_deref().unwrap_or(""), rclone)
                    .with_transfer_timeout(transfer_timeout),
            ))
        }
        BackendKind::Directory { path } => {
            if path.as_os_str().is_empty() {
                bail!("backend '{}': directory path must not be empty", backend.name);
            }
            Ok(Arc::new(DirectoryAdapter::new(&backend.name, path)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Tables {
        backends: Vec<BackendConfig>,
    }

    #[test]
    fn test_parse_backend_tables() {
        let toml_str = r#"
[[backends]]
name = "mega1"
type = "rclone"
remote = "mega1:"
priority = 10

[[backends]]
name = "gdrive"
type = "rclone"
remote = "gdrive"
root = "media"

[[backends]]
name = "scratch"
type = "directory"
path = "/srv/scratch"
"#;
        let tables: Tables = toml::from_str(toml_str).unwrap();
        assert_eq!(tables.backends.len(), 3);
        assert_eq!(tables.backends[0].priority, 10);
        assert_eq!(tables.backends[1].priority, 0);
        assert!(matches!(
            &tables.backends[1].kind,
            BackendKind::Rclone { root: Some(r), .. } if r == "media"
        ));
        assert!(matches!(tables.backends[2].kind, BackendKind::Directory { .. }));

        let rclone = RcloneSettings::default();
        for backend in &tables.backends {
            let adapter = from_config(backend, &rclone, Duration::from_secs(60)).unwrap();
            assert_eq!(adapter.name(), backend.name);
        }
    }

    #[test]
    fn test_unknown_backend_type_rejected() {
        let toml_str = r#"
[[backends]]
name = "s3"
type = "s3"
bucket = "x"
"#;
        assert!(toml::from_str::<Tables>(toml_str).is_err());
    }

    #[test]
    fn test_empty_remote_rejected() {
        let backend = BackendConfig {
            name: "bad".to_string(),
            priority: 0,
            kind: BackendKind::Rclone {
                remote: ":".to_string(),
                root: None,
            },
        };
        assert!(from_config(&backend, &RcloneSettings::default(), Duration::from_secs(1)).is_err());
    }
}
