//! Run orchestration
//!
//! resolve files → probe → (connect to Azure → add rule) → execute → remove rule
//!
//! The rule, if one is added, is removed on every path out of the run. A
//! failed removal is reported as a warning and never becomes the run's
//! result.

use std::sync::Arc;

use tracing::info;

use crate::azure::{FirewallManager, PublicIpSource, ResourceConnector};
use crate::errors::ActionError;
use crate::executor::{FilesExecutor, ScriptRunner};
use crate::files::ScriptFileSet;
use crate::inputs::ActionInputs;
use crate::psql::probe::ConnectivityProbe;
use crate::workflow;

/// What a successful run did.
#[derive(Debug, Default)]
pub struct RunReport {
    pub files_executed: usize,
    pub firewall_rule_added: bool,
    /// Set when the temporary rule could not be removed.
    pub cleanup_warning: Option<String>,
}

pub struct Orchestrator {
    probe: Arc<dyn ConnectivityProbe>,
    connector: Arc<dyn ResourceConnector>,
    ip_source: Arc<dyn PublicIpSource>,
    runner: Arc<dyn ScriptRunner>,
}

impl Orchestrator {
    pub fn new(
        probe: Arc<dyn ConnectivityProbe>,
        connector: Arc<dyn ResourceConnector>,
        ip_source: Arc<dyn PublicIpSource>,
        runner: Arc<dyn ScriptRunner>,
    ) -> Self {
        Self {
            probe,
            connector,
            ip_source,
            runner,
        }
    }

    pub async fn run(&self, inputs: &ActionInputs) -> Result<RunReport, ActionError> {
        let files = ScriptFileSet::resolve(&inputs.files_path)?;
        info!("Resolved {} script file(s) from {}", files.len(), inputs.files_path);

        let executor = FilesExecutor::new(self.runner.clone());
        let connection = inputs.connection_string.as_str();
        let mut report = RunReport {
            files_executed: files.len(),
            ..Default::default()
        };

        let probe = self.probe.probe(connection).await?;
        if probe.is_connected() {
            executor.execute(connection, &files, &inputs.args).await?;
            return Ok(report);
        }

        let server = inputs.server_resource_name();
        info!(
            "Database not reachable from this runner ({}), opening firewall on {server}",
            probe.diagnostic().lines().last().unwrap_or("no diagnostic")
        );
        let api = self
            .connector
            .firewall_api(&server)
            .await
            .map_err(ActionError::provisioning)?;
        let mut firewall = FirewallManager::new(api, self.ip_source.clone());

        let mut cleanup_warning = None;
        firewall
            .scoped(
                &server,
                probe.client_ip(),
                || executor.execute(connection, &files, &inputs.args),
                |warning| {
                    workflow::warning(&warning.to_string());
                    cleanup_warning = Some(warning.to_string());
                },
            )
            .await?;

        report.firewall_rule_added = true;
        report.cleanup_warning = cleanup_warning;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::azure::firewall::tests::{ApiCall, FakeFirewallApi, FixedIp};
    use crate::azure::resource::FirewallApi;
    use crate::executor::tests::RecordingRunner;
    use crate::psql::probe::ProbeOutcome;
    use crate::telemetry::UserAgentGuard;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProbe(ProbeOutcome);

    #[async_trait]
    impl ConnectivityProbe for FakeProbe {
        async fn probe(&self, _connection: &str) -> Result<ProbeOutcome, ActionError> {
            Ok(self.0.clone())
        }
    }

    struct FakeConnector {
        api: Arc<FakeFirewallApi>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResourceConnector for FakeConnector {
        async fn firewall_api(&self, _server_name: &str) -> anyhow::Result<Arc<dyn FirewallApi>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("PostgreSQL server 'contoso' not found");
            }
            Ok(self.api.clone())
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        api: Arc<FakeFirewallApi>,
        connector: Arc<FakeConnector>,
        runner: Arc<RecordingRunner>,
        orchestrator: Orchestrator,
    }

    impl Harness {
        fn new(probe: ProbeOutcome, api: FakeFirewallApi, runner: RecordingRunner) -> Self {
            Self::with_connector(probe, api, runner, false)
        }

        fn with_connector(
            probe: ProbeOutcome,
            api: FakeFirewallApi,
            runner: RecordingRunner,
            connector_fails: bool,
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            for name in ["a.sql", "b.sql", "c.sql"] {
                std::fs::write(dir.path().join(name), "select 1;\n").unwrap();
            }

            let api = Arc::new(api);
            let connector = Arc::new(FakeConnector {
                api: api.clone(),
                fail: connector_fails,
                calls: AtomicUsize::new(0),
            });
            let runner = Arc::new(runner);
            let orchestrator = Orchestrator::new(
                Arc::new(FakeProbe(probe)),
                connector.clone(),
                Arc::new(FixedIp(Some(Ipv4Addr::new(198, 51, 100, 1)))),
                runner.clone(),
            );

            Self {
                dir,
                api,
                connector,
                runner,
                orchestrator,
            }
        }

        fn inputs(&self) -> ActionInputs {
            ActionInputs {
                server_name: "contoso.postgres.database.azure.com".into(),
                connection_string: "host=contoso.postgres.database.azure.com dbname=app".into(),
                files_path: self.dir.path().to_string_lossy().to_string(),
                args: vec![],
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn ran_names(&self) -> Vec<String> {
            self.runner
                .ran()
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
                .collect()
        }
    }

    fn rejected(ip: Option<Ipv4Addr>) -> ProbeOutcome {
        ProbeOutcome::Unreachable {
            client_ip: ip,
            diagnostic: "no pg_hba.conf entry".into(),
        }
    }

    #[tokio::test]
    async fn test_invalid_file_set_creates_no_rule() {
        let h = Harness::new(rejected(None), FakeFirewallApi::default(), RecordingRunner::default());
        let mut inputs = h.inputs();
        inputs.files_path = h.path("missing/*.sql").to_string_lossy().to_string();

        let err = h.orchestrator.run(&inputs).await.unwrap_err();
        assert!(matches!(err, ActionError::Configuration(_)));
        assert_eq!(h.connector.calls.load(Ordering::SeqCst), 0);
        assert!(h.api.calls().is_empty());
        assert!(h.runner.ran().is_empty());
    }

    #[tokio::test]
    async fn test_connected_skips_firewall() {
        let h = Harness::new(ProbeOutcome::Connected, FakeFirewallApi::default(), RecordingRunner::default());

        let report = h.orchestrator.run(&h.inputs()).await.unwrap();
        assert!(!report.firewall_rule_added);
        assert_eq!(report.files_executed, 3);
        assert_eq!(h.connector.calls.load(Ordering::SeqCst), 0);
        assert!(h.api.calls().is_empty());
        assert_eq!(h.ran_names(), vec!["a.sql", "b.sql", "c.sql"]);
    }

    #[tokio::test]
    async fn test_rule_added_and_removed_once_on_success() {
        let ip = Ipv4Addr::new(203, 0, 113, 7);
        let h = Harness::new(rejected(Some(ip)), FakeFirewallApi::default(), RecordingRunner::default());

        let report = h.orchestrator.run(&h.inputs()).await.unwrap();
        assert!(report.firewall_rule_added);
        assert!(report.cleanup_warning.is_none());

        let calls = h.api.calls();
        assert_eq!(calls.len(), 2);
        match (&calls[0], &calls[1]) {
            (ApiCall::Create(rule), ApiCall::Delete(name)) => {
                assert_eq!(&rule.name, name);
                assert_eq!(rule.range.start, ip);
                assert_eq!(rule.range.end, ip);
            }
            other => panic!("unexpected calls: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_script_failure_still_removes_rule() {
        let h = Harness::new(rejected(None), FakeFirewallApi::default(), RecordingRunner::default());
        // Fail the middle file of the harness directory.
        let runner = Arc::new(RecordingRunner::failing(
            h.path("b.sql").to_str().unwrap(),
            "ERROR:  permission denied for schema public",
        ));
        let orchestrator = Orchestrator::new(
            Arc::new(FakeProbe(rejected(None))),
            h.connector.clone(),
            Arc::new(FixedIp(None)),
            runner.clone(),
        );

        let err = orchestrator.run(&h.inputs()).await.unwrap_err();
        match err {
            ActionError::ScriptExecution { file, stderr } => {
                assert_eq!(file, h.path("b.sql"));
                assert!(stderr.contains("permission denied"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(runner.ran(), vec![h.path("a.sql"), h.path("b.sql")]);
        assert_eq!(h.api.deletes(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_runs_nothing() {
        let api = FakeFirewallApi {
            fail_create: true,
            ..Default::default()
        };
        let h = Harness::new(rejected(None), api, RecordingRunner::default());

        let err = h.orchestrator.run(&h.inputs()).await.unwrap_err();
        assert!(matches!(err, ActionError::Provisioning(_)));
        assert!(h.runner.ran().is_empty());
        assert_eq!(h.api.deletes(), 0);
    }

    #[tokio::test]
    async fn test_connector_failure_is_provisioning_error() {
        let h = Harness::with_connector(
            rejected(None),
            FakeFirewallApi::default(),
            RecordingRunner::default(),
            true,
        );

        let err = h.orchestrator.run(&h.inputs()).await.unwrap_err();
        assert!(matches!(err, ActionError::Provisioning(ref m) if m.contains("not found")));
        assert!(h.runner.ran().is_empty());
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_fail_run() {
        let api = FakeFirewallApi {
            fail_delete: true,
            ..Default::default()
        };
        let h = Harness::new(rejected(None), api, RecordingRunner::default());

        let report = h.orchestrator.run(&h.inputs()).await.unwrap();
        assert!(report.firewall_rule_added);
        assert!(report.cleanup_warning.unwrap().contains("ClientIPAddress_"));
        assert_eq!(h.api.deletes(), 1);
    }

    #[tokio::test]
    async fn test_user_agent_restored_after_failed_run() {
        let var = "PSQL_ACTION_TEST_UA_RUN";
        std::env::set_var(var, "before");
        let h = Harness::new(rejected(None), FakeFirewallApi::default(), RecordingRunner::default());
        let mut inputs = h.inputs();
        inputs.files_path = "/nonexistent/*.sql".into();

        let result = {
            let _guard = UserAgentGuard::install_as(var, "octo/repo", None);
            assert_ne!(std::env::var(var).unwrap(), "before");
            h.orchestrator.run(&inputs).await
        };

        assert!(result.is_err());
        assert_eq!(std::env::var(var).unwrap(), "before");
        std::env::remove_var(var);
    }
}
