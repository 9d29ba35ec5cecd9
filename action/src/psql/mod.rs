//! psql integration: binary discovery, invocation and the connectivity probe.

pub mod probe;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::PsqlConfig;
use crate::errors::ActionError;

const WELL_KNOWN_LOCATIONS: &[&str] = &[
    "/usr/bin/psql",
    "/usr/local/bin/psql",
    "/opt/homebrew/bin/psql",
    "C:\\Program Files\\PostgreSQL\\bin\\psql.exe",
];

/// Captured result of one psql invocation.
#[derive(Debug)]
pub struct PsqlOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Locates psql once, on first use, and runs it.
pub struct PsqlTool {
    override_path: Option<PathBuf>,
    connect_timeout: Duration,
    binary: OnceCell<PathBuf>,
}

impl PsqlTool {
    pub fn new(config: &PsqlConfig) -> Self {
        let override_path = std::env::var("PSQL_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .or_else(|| config.binary.clone())
            .map(PathBuf::from);

        Self {
            override_path,
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
            binary: OnceCell::new(),
        }
    }

    /// Resolve the binary, caching the answer for the life of this instance.
    pub async fn binary(&self) -> Result<&Path, ActionError> {
        let path = self
            .binary
            .get_or_try_init(|| async {
                let path = find_psql(self.override_path.as_deref())?;
                info!("Using psql at {}", path.display());
                Ok::<_, ActionError>(path)
            })
            .await?;
        Ok(path.as_path())
    }

    /// Run `psql <connection> <args…>` and capture both streams.
    pub async fn run<I, S>(&self, connection: &str, args: I) -> Result<PsqlOutput, ActionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let binary = self.binary().await?;

        let output = Command::new(binary)
            .arg(connection)
            .args(args)
            .env("PGCONNECT_TIMEOUT", self.connect_timeout.as_secs().to_string())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ActionError::Tool(format!("failed to run {}: {e}", binary.display())))?;

        let result = PsqlOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        debug!(status = %result.status, stderr_len = result.stderr.len(), "psql finished");
        Ok(result)
    }
}

fn find_psql(override_path: Option<&Path>) -> Result<PathBuf, ActionError> {
    // 1. Explicit override
    if let Some(path) = override_path {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        warn!(
            "Configured psql path {} does not exist, searching PATH",
            path.display()
        );
    }

    // 2. PATH
    let exe = if cfg!(windows) { "psql.exe" } else { "psql" };
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(exe);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    // 3. Well-known locations
    for candidate in WELL_KNOWN_LOCATIONS {
        let path = PathBuf::from(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }

    Err(ActionError::Tool(
        "psql binary not found. Install the PostgreSQL client or set PSQL_PATH".to_string(),
    ))
}
