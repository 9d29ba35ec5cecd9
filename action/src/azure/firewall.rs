//! Temporary firewall rule lifecycle
//!
//! A `FirewallManager` owns at most one rule. It moves `NoRule -> RuleActive`
//! when the rule is created and back when it is removed. Removal never fails
//! from the caller's point of view; problems come back as a `CleanupWarning`.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::resource::{FirewallApi, PublicIpSource};
use crate::errors::{ActionError, CleanupWarning};

/// Inclusive IPv4 range a rule admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl IpRange {
    pub fn single(ip: Ipv4Addr) -> Self {
        Self { start: ip, end: ip }
    }

    /// Used when the caller's address cannot be determined.
    pub fn permissive() -> Self {
        Self {
            start: Ipv4Addr::new(0, 0, 0, 0),
            end: Ipv4Addr::new(255, 255, 255, 255),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: String,
    pub range: IpRange,
}

impl FirewallRule {
    pub fn new(range: IpRange) -> Self {
        Self {
            name: generate_rule_name(),
            range,
        }
    }
}

/// `ClientIPAddress_<unix millis>_<8 hex>`, unique per run.
fn generate_rule_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "ClientIPAddress_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

#[derive(Debug)]
enum RuleState {
    NoRule,
    RuleActive(FirewallRule),
}

pub struct FirewallManager {
    api: Arc<dyn FirewallApi>,
    ip_source: Arc<dyn PublicIpSource>,
    state: RuleState,
}

impl FirewallManager {
    pub fn new(api: Arc<dyn FirewallApi>, ip_source: Arc<dyn PublicIpSource>) -> Self {
        Self {
            api,
            ip_source,
            state: RuleState::NoRule,
        }
    }

    pub fn active_rule(&self) -> Option<&FirewallRule> {
        match &self.state {
            RuleState::NoRule => None,
            RuleState::RuleActive(rule) => Some(rule),
        }
    }

    async fn client_range(&self, ip_hint: Option<Ipv4Addr>) -> IpRange {
        if let Some(ip) = ip_hint {
            return IpRange::single(ip);
        }
        match self.ip_source.public_ip().await {
            Some(ip) => IpRange::single(ip),
            None => {
                warn!("Could not determine the runner's IP address; opening the rule to all IPv4 addresses");
                IpRange::permissive()
            }
        }
    }

    /// Create the run's rule and wait until ARM reports it in place.
    pub async fn add_firewall_rule(
        &mut self,
        server: &str,
        ip_hint: Option<Ipv4Addr>,
    ) -> Result<FirewallRule, ActionError> {
        if let Some(rule) = self.active_rule() {
            return Err(ActionError::Provisioning(format!(
                "firewall rule {} is already active for this run",
                rule.name
            )));
        }

        let rule = FirewallRule::new(self.client_range(ip_hint).await);
        info!(
            "Adding firewall rule {} to {server} for {} - {}",
            rule.name, rule.range.start, rule.range.end
        );

        self.api
            .create_firewall_rule(&rule)
            .await
            .map_err(ActionError::provisioning)?;

        info!("Firewall rule {} added", rule.name);
        self.state = RuleState::RuleActive(rule.clone());
        Ok(rule)
    }

    /// Delete the rule if one is active. Always ends in `NoRule`.
    pub async fn remove_firewall_rule(&mut self) -> Option<CleanupWarning> {
        let RuleState::RuleActive(rule) = std::mem::replace(&mut self.state, RuleState::NoRule) else {
            return None;
        };

        info!("Removing firewall rule {}", rule.name);
        match self.api.delete_firewall_rule(&rule.name).await {
            Ok(()) => {
                info!("Firewall rule {} removed", rule.name);
                None
            }
            Err(e) => {
                let warning = CleanupWarning {
                    rule_name: rule.name,
                    reason: format!("{e:#}"),
                };
                warn!("{warning}");
                Some(warning)
            }
        }
    }

    /// Add a rule, run `body`, then remove the rule on every exit path.
    ///
    /// If the rule cannot be added the body never runs. A removal failure is
    /// handed to `on_cleanup_warning` and does not change the body's result.
    pub async fn scoped<F, Fut, T, W>(
        &mut self,
        server: &str,
        ip_hint: Option<Ipv4Addr>,
        body: F,
        on_cleanup_warning: W,
    ) -> Result<T, ActionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ActionError>>,
        W: FnOnce(&CleanupWarning),
    {
        self.add_firewall_rule(server, ip_hint).await?;
        let result = body().await;
        if let Some(warning) = self.remove_firewall_rule().await {
            on_cleanup_warning(&warning);
        }
        result
    }
}
