//! Sequential script execution
//!
//! Files run one at a time, in order. Anything psql writes to stderr fails
//! the file and stops the run; the exit code is not consulted.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::ActionError;
use crate::files::ScriptFileSet;
use crate::psql::PsqlTool;

/// Result of running a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    Succeeded,
    /// Captured stderr text
    Failed(String),
}

#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run_script(
        &self,
        connection: &str,
        file: &Path,
        args: &[String],
    ) -> Result<ScriptOutcome, ActionError>;
}

/// Runs a file with `psql <connection> -f <file> <args…>`.
pub struct PsqlScriptRunner {
    tool: Arc<PsqlTool>,
}

impl PsqlScriptRunner {
    pub fn new(tool: Arc<PsqlTool>) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl ScriptRunner for PsqlScriptRunner {
    async fn run_script(
        &self,
        connection: &str,
        file: &Path,
        args: &[String],
    ) -> Result<ScriptOutcome, ActionError> {
        let mut argv: Vec<OsString> = Vec::with_capacity(args.len() + 2);
        argv.push("-f".into());
        argv.push(file.as_os_str().to_os_string());
        argv.extend(args.iter().map(OsString::from));

        let output = match self.tool.run(connection, argv).await {
            Ok(output) => output,
            // Could not even start psql for this file.
            Err(ActionError::Tool(msg)) => return Ok(ScriptOutcome::Failed(msg)),
            Err(e) => return Err(e),
        };

        if !output.stdout.trim().is_empty() {
            info!("{}", output.stdout.trim_end());
        }

        if !output.stderr.is_empty() {
            return Ok(ScriptOutcome::Failed(output.stderr));
        }
        if !output.status.success() {
            warn!(
                "psql exited with {} for {} but wrote nothing to stderr; treating as success",
                output.status,
                file.display()
            );
        }
        Ok(ScriptOutcome::Succeeded)
    }
}

/// Executes a resolved file set through a `ScriptRunner`.
pub struct FilesExecutor {
    runner: Arc<dyn ScriptRunner>,
}

impl FilesExecutor {
    pub fn new(runner: Arc<dyn ScriptRunner>) -> Self {
        Self { runner }
    }

    pub async fn execute(
        &self,
        connection: &str,
        files: &ScriptFileSet,
        args: &[String],
    ) -> Result<(), ActionError> {
        let start = Instant::now();

        for file in files.files() {
            info!("Executing file: {}", file.display());
            match self.runner.run_script(connection, file, args).await? {
                ScriptOutcome::Succeeded => {}
                ScriptOutcome::Failed(stderr) => {
                    return Err(ActionError::ScriptExecution {
                        file: file.clone(),
                        stderr,
                    });
                }
            }
        }

        info!(
            "Executed {} file(s) in {}ms",
            files.len(),
            start.elapsed().as_millis()
        );
        Ok(())
    }
}
