//! GitHub Actions workflow commands
//!
//! Annotations go to stdout as `::error::` / `::warning::` lines. Variables
//! exported for later steps are appended to the `GITHUB_ENV` file.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Escape a message body the way the runner expects.
pub fn escape_data(msg: &str) -> String {
    msg.replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

pub fn error(msg: &str) {
    println!("::error::{}", escape_data(msg));
}

pub fn warning(msg: &str) {
    println!("::warning::{}", escape_data(msg));
}

/// The runner's `GITHUB_ENV` file, when there is one.
pub fn github_env_file() -> Option<PathBuf> {
    std::env::var_os("GITHUB_ENV")
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

/// Set `name` for this process and, given the runner's env file, for the
/// steps that follow.
pub fn export_variable(env_file: Option<&Path>, name: &str, value: &str) -> Result<()> {
    std::env::set_var(name, value);
    match env_file {
        Some(path) => append_env_file(path, name, value),
        None => Ok(()),
    }
}

fn append_env_file(path: &Path, name: &str, value: &str) -> Result<()> {
    let delimiter = format!("ghadelimiter_{}", uuid::Uuid::new_v4());
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    write!(file, "{name}<<{delimiter}\n{value}\n{delimiter}\n")
        .with_context(|| format!("Failed to write {name} to {}", path.display()))?;
    Ok(())
}
