//! Connectivity probe
//!
//! Runs `select 1` through psql. A clean exit with nothing on stderr means the
//! server is reachable from here. Rejections often name the address the
//! server saw, which is exactly what a firewall rule needs.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::PsqlTool;
use crate::errors::ActionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Connected,
    Unreachable {
        /// Client address reported by the server, when it said one.
        client_ip: Option<Ipv4Addr>,
        diagnostic: String,
    },
}

impl ProbeOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, ProbeOutcome::Connected)
    }

    pub fn client_ip(&self) -> Option<Ipv4Addr> {
        match self {
            ProbeOutcome::Connected => None,
            ProbeOutcome::Unreachable { client_ip, .. } => *client_ip,
        }
    }

    pub fn diagnostic(&self) -> &str {
        match self {
            ProbeOutcome::Connected => "",
            ProbeOutcome::Unreachable { diagnostic, .. } => diagnostic,
        }
    }
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Errors only for malformed input or a missing tool; connection-level
    /// failures come back as `Unreachable`.
    async fn probe(&self, connection: &str) -> Result<ProbeOutcome, ActionError>;
}

pub struct PsqlProbe {
    tool: Arc<PsqlTool>,
}

impl PsqlProbe {
    pub fn new(tool: Arc<PsqlTool>) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl ConnectivityProbe for PsqlProbe {
    async fn probe(&self, connection: &str) -> Result<ProbeOutcome, ActionError> {
        if connection.trim().is_empty() {
            return Err(ActionError::configuration("connection string is empty"));
        }

        let output = self.tool.run(connection, ["-c", "select 1"]).await?;
        let stderr = output.stderr.trim();

        if output.status.success() && stderr.is_empty() {
            info!("Database is reachable, no firewall rule needed");
            return Ok(ProbeOutcome::Connected);
        }

        let client_ip = parse_client_ip(stderr);
        debug!(?client_ip, "Connectivity probe rejected: {stderr}");
        Ok(ProbeOutcome::Unreachable {
            client_ip,
            diagnostic: stderr.to_string(),
        })
    }
}

/// Pull the client address out of a server rejection, e.g.
/// `no pg_hba.conf entry for host "203.0.113.7"` or
/// `Client with IP address '203.0.113.7' is not allowed`.
pub fn parse_client_ip(stderr: &str) -> Option<Ipv4Addr> {
    const MARKERS: &[&str] = &["no pg_hba.conf entry for host ", "Client with IP address "];

    MARKERS.iter().find_map(|marker| {
        let start = stderr.find(marker)? + marker.len();
        let rest = stderr[start..].trim_start_matches(['"', '\'']);
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        rest[..end].parse().ok()
    })
}
