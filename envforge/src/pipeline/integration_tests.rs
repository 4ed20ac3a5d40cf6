//! Scenario tests for whole provisioning runs.

#[cfg(test)]
mod tests {
    use crate::catalog::{ActionSpec, Catalog, StageDefinition};
    use crate::core::{kinds, ExitStatus, RunOutcome, StageStatus};
    use crate::health::HealthService;
    use crate::manifest::{Manifest, ManifestStore};
    use crate::pipeline::{ClassificationTable, FailureClass, FailureMode, PlannedAction, Preparation};
    use crate::platform::Platform;
    use crate::probe::ProbeVerdict;
    use crate::testing::{
        assert_attempts, assert_blocked_by, assert_last_error_contains, assert_stage_status, catalog,
        fan_out_catalog, stage, ScriptedExecutor, ScriptedProbe, TestHarness,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn network_flaky() -> ClassificationTable {
        ClassificationTable::default().with_rule("exit:6", FailureClass::Transient)
    }

    fn diamond_catalog() -> Catalog {
        catalog(vec![
            stage("fetch", &[]),
            stage("toolchain", &["fetch"]),
            stage("runtime", &["fetch"]),
            stage("solvers", &["toolchain", "runtime"]),
            stage("smoke", &["solvers"]),
        ])
    }

    async fn completed(harness: &TestHarness) -> Manifest {
        harness.run().await.manifest
    }

    #[tokio::test]
    async fn test_transient_failure_retried_to_completion() {
        let harness = TestHarness::new(fan_out_catalog().with_classification(network_flaky()))
            .with_executor(
                ScriptedExecutor::new()
                    .fail_times("b", 2, 6)
                    .with_stderr("b", "curl: (6) Could not resolve host"),
            );

        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(harness.executor.calls_for("a"), 1);
        assert_eq!(harness.executor.calls_for("b"), 3);
        assert_eq!(harness.executor.calls_for("c"), 1);
        assert_eq!(report.actions_executed, 5);
        assert_attempts(&report.manifest, "b", 3);
        assert_stage_status(&report.manifest, "b", StageStatus::Succeeded);
        assert_eq!(harness.events.events_of_type(kinds::STAGE_RETRYING).len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_blocks_dependents() {
        let harness = TestHarness::new(fan_out_catalog())
            .with_executor(ScriptedExecutor::new().fail_times("a", 1, 22).with_stderr("a", "404 Not Found"));

        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(harness.executor.call_count(), 1);
        assert_stage_status(&report.manifest, "a", StageStatus::Failed);
        assert_last_error_contains(&report.manifest, "a", "404 Not Found");
        assert_blocked_by(&report.manifest, "b", "a");
        assert_blocked_by(&report.manifest, "c", "a");

        let health = HealthService::new(harness.store.clone()).check().await;
        assert!(!health.ready);
        assert_eq!(health.failed, vec!["a"]);
        assert_eq!(health.blocked, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_every_failed_entry_has_an_error() {
        let harness = TestHarness::new(catalog(vec![
            stage("a", &[]),
            stage("b", &["a"]),
            stage("x", &[]),
            stage("y", &["x", "b"]),
        ]))
        .with_executor(ScriptedExecutor::new().fail_times("a", 1, 1))
        .with_failure_mode(FailureMode::ContinueOnError);

        let report = harness.run().await;

        for (id, entry) in &report.manifest.stages {
            assert!(entry.status.is_terminal(), "{id} is {}", entry.status);
            if entry.status != StageStatus::Succeeded {
                assert!(entry.last_error.as_deref().is_some_and(|e| !e.is_empty()), "{id}");
            }
        }
        assert_blocked_by(&report.manifest, "y", "a");
        assert_stage_status(&report.manifest, "x", StageStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_dry_run_executes_nothing() {
        let recorded = completed(&TestHarness::new(fan_out_catalog())).await;
        let harness = TestHarness::new(fan_out_catalog()).with_recorded(recorded.clone());

        let plan = harness
            .with_preparation(Preparation::Resume)
            .runner()
            .plan()
            .await
            .unwrap();

        assert_eq!(plan.to_run(), 0);
        assert_eq!(plan.to_skip(), 3);
        assert!(plan.stages().all(|s| s.action == PlannedAction::Skip));
    }

    #[tokio::test]
    async fn test_dry_run_plans_every_stage_in_waves() {
        let recorded = completed(&TestHarness::new(diamond_catalog())).await;
        let harness = TestHarness::new(diamond_catalog()).with_recorded(recorded.clone());

        let plan = harness.runner().plan().await.unwrap();

        let waves: Vec<Vec<&str>> = plan
            .waves
            .iter()
            .map(|wave| wave.iter().map(|s| s.id.as_str()).collect())
            .collect();
        assert_eq!(waves, vec![vec!["fetch"], vec!["toolchain", "runtime"], vec!["solvers"], vec!["smoke"]]);
        assert_eq!(plan.to_run(), 5);
        assert_eq!(harness.executor.call_count(), 0);
        assert_eq!(harness.store.write_count(), 0);
        assert_eq!(harness.store.load().await.unwrap(), Some(recorded));
    }

    #[tokio::test]
    async fn test_resume_after_success_runs_nothing() {
        let first = TestHarness::new(fan_out_catalog());
        let recorded = completed(&first).await;

        let harness = TestHarness::new(fan_out_catalog())
            .with_recorded(recorded.clone())
            .with_preparation(Preparation::Resume);
        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(report.actions_executed, 0);
        assert_eq!(report.run_id, recorded.run_id);
        assert_eq!(report.manifest, recorded);
        assert_eq!(harness.events.events_of_type(kinds::STAGE_SKIPPED).len(), 3);
    }

    #[tokio::test]
    async fn test_kept_success_blocked_when_rerun_ancestor_fails() {
        let stages = || catalog(vec![stage("a", &[]), stage("b", &["a"]).non_idempotent()]);
        let recorded = completed(&TestHarness::new(stages())).await;
        assert_stage_status(&recorded, "b", StageStatus::Succeeded);

        let harness = TestHarness::new(stages())
            .with_recorded(recorded)
            .with_executor(ScriptedExecutor::new().fail_times("a", 1, 1));
        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_stage_status(&report.manifest, "a", StageStatus::Failed);
        assert_blocked_by(&report.manifest, "b", "a");
        assert_eq!(harness.executor.calls_for("b"), 0);
    }

    #[tokio::test]
    async fn test_kept_success_waits_for_rerun_ancestor() {
        let stages = || {
            catalog(vec![
                stage("a", &[]),
                stage("b", &["a"]).non_idempotent(),
                stage("c", &["b"]),
            ])
        };
        let recorded = completed(&TestHarness::new(stages())).await;

        let harness = TestHarness::new(stages())
            .with_recorded(recorded)
            .with_executor(ScriptedExecutor::new().with_delay("a", Duration::from_millis(30)));
        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(harness.executor.call_order(), vec!["a".to_string(), "c".to_string()]);
        assert_stage_status(&report.manifest, "b", StageStatus::Succeeded);
        assert_eq!(harness.executor.calls_for("b"), 0);
    }

    #[tokio::test]
    async fn test_resume_blocks_success_below_unconfirmed_ancestor() {
        let recorded = completed(&TestHarness::new(fan_out_catalog())).await;

        let harness = TestHarness::new(fan_out_catalog())
            .with_recorded(recorded)
            .with_preparation(Preparation::Resume)
            .with_probe(ScriptedProbe::new().script("a", [ProbeVerdict::Unconfirmed("toolchain removed".into())]))
            .with_executor(ScriptedExecutor::new().fail_times("a", 1, 1));
        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_blocked_by(&report.manifest, "b", "a");
        assert_blocked_by(&report.manifest, "c", "a");
        assert_eq!(harness.executor.call_order(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_stage_for_other_platform_is_left_out() {
        let toml = r#"
[[stages]]
id = "toolchain"
action = { command = "true" }

[[stages]]
id = "brew"
depends_on = ["toolchain"]
platforms = ["darwin-aarch64"]
action = { command = "brew", args = ["install", "gcc"] }

[[stages]]
id = "runtime"
depends_on = ["brew"]
action = { command = "true" }
"#;
        let loaded = Catalog::parse_toml(toml, &Platform::new("linux", "x86_64")).unwrap();
        let harness = TestHarness::new(loaded);

        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Complete);
        assert!(report.manifest.entry("brew").is_none());
        assert_eq!(
            harness.executor.call_order(),
            vec!["toolchain".to_string(), "runtime".to_string()]
        );
    }

    #[tokio::test]
    async fn test_resume_retries_failed_and_blocked_stages() {
        let first = TestHarness::new(fan_out_catalog()).with_executor(ScriptedExecutor::new().fail_times("b", 1, 1));
        let recorded = completed(&first).await;
        assert_stage_status(&recorded, "b", StageStatus::Failed);

        let harness = TestHarness::new(fan_out_catalog())
            .with_recorded(recorded)
            .with_preparation(Preparation::Resume);
        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(harness.executor.call_order(), vec!["b".to_string()]);
        assert_attempts(&report.manifest, "b", 1);
    }

    #[tokio::test]
    async fn test_resume_reruns_stage_whose_effect_is_gone() {
        let recorded = completed(&TestHarness::new(fan_out_catalog())).await;

        let harness = TestHarness::new(fan_out_catalog())
            .with_recorded(recorded)
            .with_preparation(Preparation::Resume)
            .with_probe(ScriptedProbe::new().script("c", [ProbeVerdict::Unconfirmed("path missing".into())]));
        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(harness.executor.call_order(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_changed_definition_reruns_stage() {
        let recorded = completed(&TestHarness::new(fan_out_catalog())).await;
        let changed = catalog(vec![
            stage("a", &[]),
            StageDefinition::new("b", ActionSpec::new("true").with_args(["--upgrade"])).with_dependency("a"),
            stage("c", &["a"]),
        ]);

        let harness = TestHarness::new(changed)
            .with_recorded(recorded)
            .with_preparation(Preparation::Resume);
        harness.run().await;

        assert_eq!(harness.executor.call_order(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_max_retries_bound() {
        let harness = TestHarness::new(
            catalog(vec![stage("download", &[]).with_max_retries(1)]).with_classification(network_flaky()),
        )
        .with_executor(ScriptedExecutor::new().fail_times("download", 10, 6));

        let report = harness.run().await;

        assert_eq!(harness.executor.calls_for("download"), 2);
        assert_attempts(&report.manifest, "download", 2);
        assert_last_error_contains(&report.manifest, "download", "gave up after 2 attempts");
        assert_eq!(report.outcome, RunOutcome::Failed);
    }

    #[tokio::test]
    async fn test_timeout_is_retried() {
        let harness = TestHarness::new(catalog(vec![stage("build", &[])]))
            .with_executor(ScriptedExecutor::new().script("build", [ExitStatus::TimedOut]));

        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(harness.executor.calls_for("build"), 2);
    }

    #[tokio::test]
    async fn test_continue_on_error_runs_unrelated_branches() {
        let harness = TestHarness::new(catalog(vec![
            stage("a", &[]),
            stage("b", &["a"]),
            stage("x", &[]),
            stage("y", &["x"]),
        ]))
        .with_executor(ScriptedExecutor::new().fail_times("a", 1, 2))
        .with_failure_mode(FailureMode::ContinueOnError);

        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_blocked_by(&report.manifest, "b", "a");
        assert_stage_status(&report.manifest, "x", StageStatus::Succeeded);
        assert_stage_status(&report.manifest, "y", StageStatus::Succeeded);
        assert_eq!(report.actions_executed, 3);
    }

    #[tokio::test]
    async fn test_fail_fast_blocks_unstarted_stages() {
        let harness = TestHarness::new(catalog(vec![stage("a", &[]), stage("x", &[]), stage("y", &["x"])]))
            .with_executor(ScriptedExecutor::new().fail_times("a", 1, 2))
            .with_concurrency(1);

        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(harness.executor.call_count(), 1);
        assert_blocked_by(&report.manifest, "x", "a");
        assert_blocked_by(&report.manifest, "y", "a");
    }

    #[tokio::test]
    async fn test_fail_fast_lets_running_stages_finish() {
        let harness = TestHarness::new(catalog(vec![stage("a", &[]), stage("x", &[]), stage("y", &["x"])]))
            .with_executor(
                ScriptedExecutor::new()
                    .fail_times("a", 1, 2)
                    .with_delay("x", Duration::from_millis(100)),
            )
            .with_concurrency(2);

        let report = harness.run().await;

        assert_stage_status(&report.manifest, "x", StageStatus::Succeeded);
        assert_blocked_by(&report.manifest, "y", "a");
        assert_eq!(harness.executor.calls_for("y"), 0);
    }

    #[tokio::test]
    async fn test_optional_failure_gives_partial() {
        let harness = TestHarness::new(catalog(vec![
            stage("core", &[]),
            stage("extras", &[]).optional(),
            stage("docs", &["extras"]).optional(),
            stage("solvers", &["core"]),
        ]))
        .with_executor(ScriptedExecutor::new().fail_times("extras", 1, 1));

        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Partial);
        assert_eq!(report.exit_code(), 0);
        assert_blocked_by(&report.manifest, "docs", "extras");
        assert_stage_status(&report.manifest, "solvers", StageStatus::Succeeded);
        assert!(HealthService::new(harness.store.clone()).check().await.ready);
    }

    #[tokio::test]
    async fn test_concurrency_bound_respected() {
        let stages = (0..6).map(|i| stage(&format!("s{i}"), &[])).collect();
        let harness = TestHarness::new(catalog(stages))
            .with_executor(ScriptedExecutor::new().with_default_delay(Duration::from_millis(20)))
            .with_concurrency(2);

        let report = harness.run().await;

        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(harness.executor.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_ready_stages_start_in_declaration_order() {
        let harness = TestHarness::new(catalog(vec![
            stage("zeta", &[]),
            stage("alpha", &[]),
            stage("mid", &["zeta"]),
            stage("beta", &[]),
        ]))
        .with_concurrency(1);

        harness.run().await;

        assert_eq!(harness.executor.call_order(), vec!["zeta", "alpha", "mid", "beta"]);
    }

    #[tokio::test]
    async fn test_dependencies_finish_before_dependents_start() {
        let harness = TestHarness::new(catalog(vec![
            stage("toolchain", &[]),
            stage("runtime", &["toolchain"]),
            stage("extras", &["runtime"]),
            stage("solvers", &["toolchain"]),
        ]))
        .with_executor(ScriptedExecutor::new().with_default_delay(Duration::from_millis(5)))
        .with_concurrency(4);

        let report = harness.run().await;

        for (id, entry) in &report.manifest.stages {
            let stage = harness.graph.catalog().get(id).unwrap();
            for dep in &stage.depends_on {
                let dep_entry = report.manifest.entry(dep).unwrap();
                assert!(dep_entry.finished_at.unwrap() <= entry.started_at.unwrap(), "{dep} -> {id}");
            }
        }
    }

    #[tokio::test]
    async fn test_run_events_bracket_the_run() {
        let harness = TestHarness::new(fan_out_catalog());
        let report = harness.run().await;

        let events = harness.events.events();
        assert_eq!(events.first().unwrap().event_type, kinds::RUN_STARTED);
        let last = events.last().unwrap();
        assert_eq!(last.event_type, kinds::RUN_COMPLETED);
        assert_eq!(last.get("outcome").unwrap(), "complete");
        assert!(events.iter().all(|e| e.run_id == report.run_id));
        assert_eq!(harness.events.events_for_stage("b").len(), 2);
    }

    #[tokio::test]
    async fn test_store_shared_with_health_during_run() {
        let harness = TestHarness::new(fan_out_catalog())
            .with_executor(ScriptedExecutor::new().with_delay("c", Duration::from_millis(200)));
        let runner = harness.runner();
        let store = harness.store.clone();

        let run = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let during = HealthService::new(store.clone()).check().await;
        assert!(!during.ready);
        assert!(during.pending.contains(&"c".to_string()));

        run.await.unwrap().unwrap();
        assert!(HealthService::new(Arc::clone(&harness.store) as Arc<dyn ManifestStore>).check().await.ready);
    }
}
