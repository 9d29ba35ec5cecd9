//! Azure side of the run: credentials, resource lookup, firewall rules.

pub mod auth;
pub mod firewall;
pub mod resource;

pub use firewall::FirewallManager;
pub use resource::{AzureConnector, HttpPublicIpSource, PublicIpSource, ResourceConnector};
