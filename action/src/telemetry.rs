//! User-agent tag for outbound Azure calls
//!
//! The tag lives in a process-wide variable for the duration of a run and is
//! put back to its prior value when the guard drops, whatever the outcome.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::workflow;

pub const USER_AGENT_VAR: &str = "AZURE_HTTP_USER_AGENT";
const ACTION_NAME: &str = "AzurePSQLAction";

/// Build the tag: `[<prior>+]GITHUBACTIONS_<action>_<sha256(repo)>`.
pub fn compose_user_agent(prior: Option<&str>, repository: &str) -> String {
    let repo_hash = format!("{:x}", Sha256::digest(repository.as_bytes()));
    let tag = format!("GITHUBACTIONS_{ACTION_NAME}_{repo_hash}");
    match prior {
        Some(p) if !p.is_empty() => format!("{p}+{tag}"),
        _ => tag,
    }
}

/// Restores the variable it replaced on drop.
pub struct UserAgentGuard {
    var: String,
    prior: Option<String>,
    value: String,
    env_file: Option<PathBuf>,
}

impl UserAgentGuard {
    /// Tag `AZURE_HTTP_USER_AGENT` for the repository in `GITHUB_REPOSITORY`.
    pub fn install() -> Self {
        let repository = std::env::var("GITHUB_REPOSITORY").unwrap_or_default();
        Self::install_as(USER_AGENT_VAR, &repository, workflow::github_env_file())
    }

    /// Tag `var`, exporting through `env_file` when given.
    pub fn install_as(var: &str, repository: &str, env_file: Option<PathBuf>) -> Self {
        let prior = std::env::var(var).ok();
        let value = compose_user_agent(prior.as_deref(), repository);
        if let Err(e) = workflow::export_variable(env_file.as_deref(), var, &value) {
            warn!("Failed to export {var}: {e:#}");
        }
        debug!("{var} set for this run");

        Self {
            var: var.to_string(),
            prior,
            value,
            env_file,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }
}

impl Drop for UserAgentGuard {
    fn drop(&mut self) {
        // Later steps see the prior value, or an empty one if there was none.
        let restored = self.prior.clone().unwrap_or_default();
        if let Err(e) = workflow::export_variable(self.env_file(), &self.var, &restored) {
            warn!("Failed to restore {}: {e:#}", self.var);
        }
        if self.prior.is_none() {
            std::env::remove_var(&self.var);
        }
    }
}
