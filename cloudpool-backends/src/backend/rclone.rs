//! Backend adapter that shells out to `rclone` once per operation.
//!
//! There is no session and no native range support: reads stream `rclone
//! cat` stdout from the first byte, writes pipe into `rclone rcat` stdin,
//! and metadata comes from `rclone lsjson`.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cloudpool_common::{BackendAdapter, ObjectDescriptor, ObjectReader, Result, StorageError};

use super::process::{spawn_reaper, ExitReport, ProcessReader};
use super::RcloneSettings;

/// rclone exit codes for a missing directory and a missing file.
const EXIT_DIR_NOT_FOUND: i32 = 3;
const EXIT_FILE_NOT_FOUND: i32 = 4;

const FIRST_CHUNK: usize = 64 * 1024;
const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(3600);

/// One entry of `rclone lsjson` output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RcloneEntry {
    path: String,
    #[serde(default)]
    size: i64,
    mod_time: DateTime<Utc>,
    #[serde(default)]
    is_dir: bool,
}

pub struct RcloneAdapter {
    name: String,
    remote: String,
    root: String,
    binary: PathBuf,
    config_path: Option<PathBuf>,
    extra_args: Vec<String>,
    transfer_timeout: Duration,
}

impl RcloneAdapter {
    pub fn new(name: &str, remote: &str, root: &str, settings: &RcloneSettings) -> Self {
        Self {
            name: name.to_string(),
            remote: remote.trim_end_matches(':').to_string(),
            root: root.trim_matches('/').to_string(),
            binary: settings.binary.clone(),
            config_path: settings.config_path.clone(),
            extra_args: settings.extra_args.clone(),
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// `remote:root/path` for a logical path; `path` may be empty.
    fn target(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        match (self.root.is_empty(), path.is_empty()) {
            (true, _) => format!("{}:{}", self.remote, path),
            (false, true) => format!("{}:{}", self.remote, self.root),
            (false, false) => format!("{}:{}/{}", self.remote, self.root, path),
        }
    }

    fn command(&self, subcommand: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.extra_args)
            .arg(subcommand)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(config) = &self.config_path {
            cmd.env("RCLONE_CONFIG", config);
        }
        cmd
    }

    fn spawn_error(&self, subcommand: &str, e: io::Error) -> StorageError {
        StorageError::backend(
            &self.name,
            format!("failed to spawn {} {}: {}", self.binary.display(), subcommand, e),
        )
    }

    /// Map a failed run to NotFound or a backend error.
    fn classify(&self, subcommand: &str, path: &str, report: &ExitReport) -> StorageError {
        let missing = matches!(report.code, Some(EXIT_DIR_NOT_FOUND | EXIT_FILE_NOT_FOUND))
            || report.stderr.to_lowercase().contains("not found");
        if missing {
            StorageError::NotFound(path.to_string())
        } else {
            StorageError::backend(&self.name, format!("{} failed: {}", subcommand, report.describe()))
        }
    }

    /// Run a non-streaming subcommand to completion and return its stdout.
    ///
    /// Dropping the returned future kills the child.
    async fn run(&self, subcommand: &str, path: &str, args: Vec<String>) -> Result<Vec<u8>> {
        debug!(backend = %self.name, subcommand, key = %path, "Running rclone");
        let output = self
            .command(subcommand, &args)
            .output()
            .await
            .map_err(|e| self.spawn_error(subcommand, e))?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let report = ExitReport {
            success: false,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        Err(self.classify(subcommand, path, &report))
    }

    fn descriptor(&self, path: String, entry: &RcloneEntry) -> ObjectDescriptor {
        ObjectDescriptor {
            path,
            size: entry.size.max(0) as u64,
            modified: entry.mod_time,
            backend: self.name.clone(),
        }
    }

    fn decode_error(&self, subcommand: &str, e: serde_json::Error) -> StorageError {
        StorageError::backend(&self.name, format!("undecodable {} output: {}", subcommand, e))
    }
}

#[async_trait]
impl BackendAdapter for RcloneAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(
        &self,
        path: &str,
        mut reader: ObjectReader,
        size: Option<u64>,
    ) -> Result<ObjectDescriptor> {
        let mut args = vec![self.target(path)];
        if let Some(size) = size {
            args.push("--size".to_string());
            args.push(size.to_string());
        }
        let mut child = self
            .command("rcat", &args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error("rcat", e))?;

        let stdin = child.stdin.take();
        let cancel = CancellationToken::new();
        let _kill_on_drop = cancel.clone().drop_guard();
        let exit = spawn_reaper(child, format!("rcat {}", path), cancel.clone(), self.transfer_timeout);

        let fed = match stdin {
            Some(mut stdin) => {
                let copied = tokio::io::copy(&mut reader, &mut stdin).await;
                // Closing stdin is what tells rcat the object is complete.
                drop(stdin);
                copied
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "rcat stdin unavailable")),
        };

        let written = match fed {
            Ok(n) if size.map_or(true, |s| s == n) => n,
            Ok(n) => {
                cancel.cancel();
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected {} bytes, received {}", size.unwrap_or(n), n),
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                // rcat died early; its exit status says why.
                let report = exit
                    .await
                    .map_err(|_| StorageError::backend(&self.name, "rcat reaper went away"))?;
                return Err(self.classify("rcat", path, &report));
            }
            Err(e) => {
                cancel.cancel();
                return Err(match e.kind() {
                    io::ErrorKind::ConnectionAborted => StorageError::Cancelled,
                    _ => StorageError::Io(e),
                });
            }
        };

        let report = exit
            .await
            .map_err(|_| StorageError::backend(&self.name, "rcat reaper went away"))?;
        if !report.success {
            return Err(self.classify("rcat", path, &report));
        }
        debug!(backend = %self.name, key = %path, size = written, "rclone upload complete");
        Ok(ObjectDescriptor {
            path: path.to_string(),
            size: written,
            modified: Utc::now(),
            backend: self.name.clone(),
        })
    }

    async fn download(&self, path: &str) -> Result<ObjectReader> {
        let mut child = self
            .command("cat", &[self.target(path)])
            .spawn()
            .map_err(|e| self.spawn_error("cat", e))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| StorageError::backend(&self.name, "cat stdout unavailable"))?;

        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let exit = spawn_reaper(child, format!("cat {}", path), cancel, self.transfer_timeout);

        // Wait for the first bytes so a dead remote fails here, where the
        // caller can still try another backend.
        let mut first = vec![0u8; FIRST_CHUNK];
        let n = stdout.read(&mut first).await?;
        if n == 0 {
            let report = exit
                .await
                .map_err(|_| StorageError::backend(&self.name, "cat reaper went away"))?;
            if !report.success {
                return Err(self.classify("cat", path, &report));
            }
            // A genuinely empty object.
            return Ok(Box::new(tokio::io::empty()));
        }
        first.truncate(n);

        Ok(Box::new(ProcessReader::new(
            Bytes::from(first),
            stdout,
            exit,
            guard,
        )))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>> {
        // lsjson lists directories; list the directory part of the prefix
        // and filter the remainder client-side.
        let dir = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let args = vec![
            "--recursive".to_string(),
            "--files-only".to_string(),
            self.target(dir),
        ];
        let stdout = match self.run("lsjson", prefix, args).await {
            Ok(stdout) => stdout,
            Err(StorageError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let entries: Vec<RcloneEntry> =
            serde_json::from_slice(&stdout).map_err(|e| self.decode_error("lsjson", e))?;

        let mut objects: Vec<ObjectDescriptor> = entries
            .iter()
            .filter(|entry| !entry.is_dir)
            .filter_map(|entry| {
                let path = if dir.is_empty() {
                    entry.path.clone()
                } else {
                    format!("{}/{}", dir, entry.path)
                };
                path.starts_with(prefix).then(|| self.descriptor(path, entry))
            })
            .collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(backend = %self.name, prefix, count = objects.len(), "rclone list complete");
        Ok(objects)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.run("deletefile", path, vec![self.target(path)]).await?;
        debug!(backend = %self.name, key = %path, "rclone delete complete");
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<ObjectDescriptor> {
        let stdout = self
            .run("lsjson", path, vec!["--stat".to_string(), self.target(path)])
            .await?;
        let entry: RcloneEntry =
            serde_json::from_slice(&stdout).map_err(|e| self.decode_error("lsjson --stat", e))?;
        if entry.is_dir {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(self.descriptor(path.to_string(), &entry))
    }

    async fn signed_url(&self, path: &str, expires: Duration) -> Result<String> {
        let args = vec![
            "--expire".to_string(),
            format!("{}s", expires.as_secs().max(1)),
            self.target(path),
        ];
        let stdout = self.run("link", path, args).await?;
        let url = String::from_utf8_lossy(&stdout).trim().to_string();
        if url.is_empty() {
            return Err(StorageError::Unsupported("signed urls"));
        }
        Ok(url)
    }

    async fn is_available(&self) -> bool {
        let args = vec!["--max-depth".to_string(), "1".to_string(), self.target("")];
        match self.run("lsd", "", args).await {
            Ok(_) => true,
            Err(e) => {
                warn!(backend = %self.name, error = %e, "rclone probe failed");
                false
            }
        }
    }
}
