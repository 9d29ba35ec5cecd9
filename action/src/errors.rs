//! Run-level error kinds

use std::fmt;
use std::path::PathBuf;

/// Terminal failure of a run. The first one raised wins.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Invalid action configuration: {0}")]
    Configuration(String),

    #[error("Failed to provision firewall access: {0}")]
    Provisioning(String),

    #[error("Script {} failed:\n{stderr}", file.display())]
    ScriptExecution { file: PathBuf, stderr: String },

    #[error("psql is unavailable: {0}")]
    Tool(String),
}

impl ActionError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Flatten an anyhow chain into a provisioning failure.
    pub fn provisioning(err: anyhow::Error) -> Self {
        Self::Provisioning(format!("{err:#}"))
    }
}

/// A firewall rule that could not be removed. Never fails the run.
#[derive(Debug)]
pub struct CleanupWarning {
    pub rule_name: String,
    pub reason: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to remove firewall rule {}: {}. Delete it manually from the server's networking settings.",
            self.rule_name, self.reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_mentions_file_and_stderr() {
        let err = ActionError::ScriptExecution {
            file: PathBuf::from("migrations/002_users.sql"),
            stderr: "ERROR:  relation \"users\" already exists".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("002_users.sql"));
        assert!(msg.contains("already exists"));
    }

    #[test]
    fn test_provisioning_keeps_context_chain() {
        let inner = anyhow::anyhow!("HTTP 403").context("PUT firewall rule");
        let err = ActionError::provisioning(inner);
        let msg = err.to_string();
        assert!(msg.contains("PUT firewall rule"));
        assert!(msg.contains("HTTP 403"));
    }

    #[test]
    fn test_cleanup_warning_display() {
        let w = CleanupWarning {
            rule_name: "ClientIPAddress_1".to_string(),
            reason: "timed out".to_string(),
        };
        assert!(w.to_string().contains("ClientIPAddress_1"));
    }
}
