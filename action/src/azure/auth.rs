//! Credentials for Azure Resource Manager
//!
//! A pre-issued token in `AZURE_ACCESS_TOKEN` is used when present. Otherwise
//! the Azure CLI session left behind by a previous `azure/login` step is asked
//! for one.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

/// Bearer token plus the subscription it should act in.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub subscription_id: String,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn access_token(&self) -> Result<AccessToken>;
}

/// A token handed in through the environment.
pub struct StaticTokenAuthorizer {
    token: AccessToken,
}

#[async_trait]
impl Authorizer for StaticTokenAuthorizer {
    async fn access_token(&self) -> Result<AccessToken> {
        Ok(self.token.clone())
    }
}

/// Delegates to `az account get-access-token`.
pub struct AzureCliAuthorizer {
    resource: String,
    subscription_override: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    subscription: Option<String>,
}

impl AzureCliAuthorizer {
    pub fn new(management_endpoint: &str, subscription_override: Option<String>) -> Self {
        Self {
            resource: format!("{}/", management_endpoint.trim_end_matches('/')),
            subscription_override,
        }
    }
}

#[async_trait]
impl Authorizer for AzureCliAuthorizer {
    async fn access_token(&self) -> Result<AccessToken> {
        let az = if cfg!(windows) { "az.cmd" } else { "az" };
        let output = Command::new(az)
            .args(["account", "get-access-token", "--resource", self.resource.as_str(), "--output", "json"])
            .output()
            .await
            .context("Failed to run the Azure CLI. Run azure/login before this action")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("az account get-access-token failed: {}", stderr.trim());
        }

        let token = parse_cli_token(&output.stdout, self.subscription_override.as_deref())?;
        debug!(subscription = %token.subscription_id, "Obtained ARM token from Azure CLI");
        Ok(token)
    }
}

fn parse_cli_token(stdout: &[u8], subscription_override: Option<&str>) -> Result<AccessToken> {
    let cli: CliToken =
        serde_json::from_slice(stdout).context("Unexpected output from az account get-access-token")?;

    let subscription_id = subscription_override
        .map(str::to_string)
        .or(cli.subscription)
        .filter(|s| !s.is_empty())
        .context("No subscription in the Azure CLI session; set AZURE_SUBSCRIPTION_ID")?;

    Ok(AccessToken {
        token: cli.access_token,
        subscription_id,
    })
}

/// Pick the authorizer for this environment.
pub fn authorizer_from_env(management_endpoint: &str) -> Box<dyn Authorizer> {
    let subscription = std::env::var("AZURE_SUBSCRIPTION_ID")
        .ok()
        .filter(|s| !s.is_empty());

    match (std::env::var("AZURE_ACCESS_TOKEN").ok().filter(|t| !t.is_empty()), subscription.clone()) {
        (Some(token), Some(subscription_id)) => {
            info!("Using ARM token from AZURE_ACCESS_TOKEN");
            Box::new(StaticTokenAuthorizer {
                token: AccessToken {
                    token,
                    subscription_id,
                },
            })
        }
        _ => {
            info!("Using Azure CLI credentials");
            Box::new(AzureCliAuthorizer::new(management_endpoint, subscription))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_token() {
        let stdout = br#"{
            "accessToken": "eyJ0eXAi",
            "expiresOn": "2026-10-17 12:00:00.000000",
            "subscription": "00000000-1111-2222-3333-444444444444",
            "tenant": "tenant-id",
            "tokenType": "Bearer"
        }"#;
        let token = parse_cli_token(stdout, None).unwrap();
        assert_eq!(token.token, "eyJ0eXAi");
        assert_eq!(token.subscription_id, "00000000-1111-2222-3333-444444444444");
    }

    #[test]
    fn test_subscription_override() {
        let stdout = br#"{"accessToken": "t", "subscription": "from-cli"}"#;
        let token = parse_cli_token(stdout, Some("from-env")).unwrap();
        assert_eq!(token.subscription_id, "from-env");
    }

    #[test]
    fn test_missing_subscription_is_an_error() {
        let stdout = br#"{"accessToken": "t"}"#;
        assert!(parse_cli_token(stdout, None).is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = AccessToken {
            token: "secret-token".to_string(),
            subscription_id: "sub".to_string(),
        };
        assert!(!format!("{token:?}").contains("secret-token"));
    }

    #[test]
    fn test_cli_resource_has_trailing_slash() {
        let auth = AzureCliAuthorizer::new("https://management.azure.com", None);
        assert_eq!(auth.resource, "https://management.azure.com/");
    }
}
