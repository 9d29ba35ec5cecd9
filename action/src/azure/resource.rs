//! Azure Resource Manager access for PostgreSQL servers
//!
//! Finds the server resource by name among single and flexible servers in
//! the subscription, then creates and deletes firewall rules on it. Both
//! writes are long-running operations on ARM; this module waits for them to
//! settle before returning.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::auth::authorizer_from_env;
use super::firewall::FirewallRule;
use crate::config::AzureConfig;

const PROVIDER: &str = "Microsoft.DBforPostgreSQL";

/// Firewall rule operations on one server.
#[async_trait]
pub trait FirewallApi: Send + Sync {
    async fn create_firewall_rule(&self, rule: &FirewallRule) -> Result<()>;
    async fn delete_firewall_rule(&self, name: &str) -> Result<()>;
}

/// Produces a `FirewallApi` bound to a named server.
#[async_trait]
pub trait ResourceConnector: Send + Sync {
    async fn firewall_api(&self, server_name: &str) -> Result<Arc<dyn FirewallApi>>;
}

/// Where a client's public address can be looked up.
#[async_trait]
pub trait PublicIpSource: Send + Sync {
    async fn public_ip(&self) -> Option<Ipv4Addr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Single,
    Flexible,
}

impl ServerKind {
    fn resource_type(self) -> &'static str {
        match self {
            ServerKind::Single => "servers",
            ServerKind::Flexible => "flexibleServers",
        }
    }

    fn api_version(self, config: &AzureConfig) -> &str {
        match self {
            ServerKind::Single => &config.single_server_api_version,
            ServerKind::Flexible => &config.flexible_server_api_version,
        }
    }
}

/// A located server resource.
#[derive(Debug, Clone)]
pub struct PostgresServer {
    pub id: String,
    pub name: String,
    pub kind: ServerKind,
}

#[derive(Deserialize)]
struct ResourceList {
    #[serde(default)]
    value: Vec<ResourceEntry>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct ResourceEntry {
    id: String,
    name: String,
}

#[derive(Serialize)]
struct FirewallRuleBody {
    properties: FirewallRuleProperties,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FirewallRuleProperties {
    start_ip_address: String,
    end_ip_address: String,
}

/// Thin authenticated HTTP client for ARM.
pub struct ArmClient {
    http: reqwest::Client,
    token: String,
    config: AzureConfig,
}

impl ArmClient {
    pub fn new(token: String, user_agent: &str, config: AzureConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, token, config })
    }

    fn url(&self, path: &str, api_version: &str) -> String {
        format!(
            "{}{}?api-version={}",
            self.config.management_endpoint.trim_end_matches('/'),
            path,
            api_version
        )
    }

    /// List every server of `kind` in the subscription, following pages.
    async fn list_servers(&self, subscription_id: &str, kind: ServerKind) -> Result<Vec<PostgresServer>> {
        let mut next = Some(self.url(
            &format!("/subscriptions/{subscription_id}/providers/{PROVIDER}/{}", kind.resource_type()),
            kind.api_version(&self.config),
        ));
        let mut servers = Vec::new();

        while let Some(url) = next.take() {
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.token)
                .send()
                .await
                .with_context(|| format!("Failed to list {} servers", kind.resource_type()))?;
            let response = error_for_status(response).await?;
            let page: ResourceList = response
                .json()
                .await
                .context("Unexpected server list response")?;

            servers.extend(page.value.into_iter().map(|entry| PostgresServer {
                id: entry.id,
                name: entry.name,
                kind,
            }));
            next = page.next_link.filter(|l| !l.is_empty());
        }

        Ok(servers)
    }

    pub async fn find_server(&self, subscription_id: &str, name: &str) -> Result<PostgresServer> {
        for kind in [ServerKind::Flexible, ServerKind::Single] {
            let servers = self.list_servers(subscription_id, kind).await?;
            debug!("Found {} {} server(s)", servers.len(), kind.resource_type());
            if let Some(server) = pick_server(servers, name) {
                return Ok(server);
            }
        }
        bail!("PostgreSQL server '{name}' not found in subscription {subscription_id}")
    }

    /// Issue a write and wait for ARM to report it finished.
    async fn write(&self, method: Method, url: &str, body: Option<&FirewallRuleBody>) -> Result<()> {
        let mut request = self.http.request(method.clone(), url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?;

        let status = response.status();
        if method == Method::DELETE && status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let response = error_for_status(response).await?;

        match async_operation_url(response.headers()) {
            Some(poll) => self.wait_for_operation(poll).await,
            None if status == StatusCode::ACCEPTED => {
                bail!("ARM accepted the {method} but gave no operation to track")
            }
            None => Ok(()),
        }
    }

    /// Poll until the operation settles. The wait before each poll is cut
    /// short at the deadline, and the deadline is only checked after a poll.
    async fn wait_for_operation(&self, poll: PollTarget) -> Result<()> {
        let deadline = Instant::now() + self.config.operation_timeout();
        let mut delay = self.config.poll_interval();

        loop {
            tokio::time::sleep(delay.min(deadline.saturating_duration_since(Instant::now()))).await;

            let response = self
                .http
                .get(poll.url())
                .bearer_auth(&self.token)
                .send()
                .await
                .context("Failed to poll operation status")?;
            delay = retry_after(response.headers()).unwrap_or(self.config.poll_interval());

            match &poll {
                PollTarget::AsyncOperation(_) => {
                    let response = error_for_status(response).await?;
                    let body: Value = response.json().await.context("Unexpected operation status")?;
                    match operation_status(&body) {
                        OperationStatus::Succeeded => return Ok(()),
                        OperationStatus::InProgress => debug!("Operation still running"),
                        OperationStatus::Failed(msg) => bail!("Operation failed: {msg}"),
                    }
                }
                PollTarget::Location(_) => match response.status() {
                    StatusCode::ACCEPTED => debug!("Operation still running"),
                    s if s.is_success() => return Ok(()),
                    _ => {
                        error_for_status(response).await?;
                    }
                },
            }

            if Instant::now() >= deadline {
                bail!(
                    "Operation did not complete within {}s",
                    self.config.operation_timeout().as_secs()
                );
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PollTarget {
    AsyncOperation(String),
    Location(String),
}

impl PollTarget {
    fn url(&self) -> &str {
        match self {
            PollTarget::AsyncOperation(u) | PollTarget::Location(u) => u,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum OperationStatus {
    Succeeded,
    InProgress,
    Failed(String),
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn async_operation_url(headers: &HeaderMap) -> Option<PollTarget> {
    header_str(headers, "azure-asyncoperation")
        .map(|u| PollTarget::AsyncOperation(u.to_string()))
        .or_else(|| header_str(headers, "location").map(|u| PollTarget::Location(u.to_string())))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_str(headers, RETRY_AFTER.as_str())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.max(1)))
}

fn operation_status(body: &Value) -> OperationStatus {
    match body.get("status").and_then(Value::as_str) {
        Some(s) if s.eq_ignore_ascii_case("succeeded") => OperationStatus::Succeeded,
        Some(s) if s.eq_ignore_ascii_case("failed") || s.eq_ignore_ascii_case("canceled") => {
            let msg = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or(s);
            OperationStatus::Failed(msg.to_string())
        }
        _ => OperationStatus::InProgress,
    }
}

fn pick_server(servers: Vec<PostgresServer>, name: &str) -> Option<PostgresServer> {
    servers
        .into_iter()
        .find(|s| s.name.eq_ignore_ascii_case(name))
}

fn rule_path(server: &PostgresServer, rule_name: &str) -> String {
    format!("{}/firewallRules/{rule_name}", server.id.trim_end_matches('/'))
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    Err(anyhow!("Azure Resource Manager returned {status}: {detail}"))
}

/// `FirewallApi` bound to a located server.
pub struct ServerFirewallApi {
    client: ArmClient,
    server: PostgresServer,
}

#[async_trait]
impl FirewallApi for ServerFirewallApi {
    async fn create_firewall_rule(&self, rule: &FirewallRule) -> Result<()> {
        let url = self.client.url(
            &rule_path(&self.server, &rule.name),
            self.server.kind.api_version(&self.client.config),
        );
        let body = FirewallRuleBody {
            properties: FirewallRuleProperties {
                start_ip_address: rule.range.start.to_string(),
                end_ip_address: rule.range.end.to_string(),
            },
        };
        self.client
            .write(Method::PUT, &url, Some(&body))
            .await
            .with_context(|| format!("Creating firewall rule {}", rule.name))
    }

    async fn delete_firewall_rule(&self, name: &str) -> Result<()> {
        let url = self.client.url(
            &rule_path(&self.server, name),
            self.server.kind.api_version(&self.client.config),
        );
        self.client
            .write(Method::DELETE, &url, None)
            .await
            .with_context(|| format!("Deleting firewall rule {name}"))
    }
}

/// Resolves servers through ARM. Credentials are acquired on first use so a
/// run that never needs a firewall rule never talks to Azure.
pub struct AzureConnector {
    user_agent: String,
    config: AzureConfig,
}

impl AzureConnector {
    pub fn new(user_agent: &str, config: AzureConfig) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            config,
        }
    }
}

#[async_trait]
impl ResourceConnector for AzureConnector {
    async fn firewall_api(&self, server_name: &str) -> Result<Arc<dyn FirewallApi>> {
        let authorizer = authorizer_from_env(&self.config.management_endpoint);
        let token = authorizer
            .access_token()
            .await
            .context("Failed to obtain Azure credentials")?;
        let client = ArmClient::new(token.token, &self.user_agent, self.config.clone())?;
        let server = client.find_server(&token.subscription_id, server_name).await?;
        info!("Found {:?} server {} ({})", server.kind, server.name, server.id);
        Ok(Arc::new(ServerFirewallApi { client, server }))
    }
}

/// Plain-text public IP lookup over HTTPS.
pub struct HttpPublicIpSource {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpPublicIpSource {
    pub fn new(endpoint: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl PublicIpSource for HttpPublicIpSource {
    async fn public_ip(&self) -> Option<Ipv4Addr> {
        let response = self.http.get(&self.endpoint).send().await.ok()?;
        let text = response.error_for_status().ok()?.text().await.ok()?;
        text.trim().parse().ok()
    }
}
