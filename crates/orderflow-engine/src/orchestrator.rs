//! Run execution.
//!
//! Coordinates one run of a pipeline:
//! - Walks the graph in dependency waves, steps of a wave run concurrently
//! - Applies trigger rules to decide which steps start
//! - Retries transient failures and enforces step timeouts
//! - Stops starting new steps once the run is cancelled, cleanup still runs

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use orderflow_tools::{ConnectionRegistry, RunContext, StepOutput, ToolError};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::pipeline::{Node, Pipeline, TriggerRule};
use crate::state::{RunReport, RunState, StepInfo, StepState};

/// Shared cancellation flag.
///
/// Checked between steps only; a statement already running is left to
/// finish.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Executes pipeline runs against a set of connections.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    connections: Arc<ConnectionRegistry>,
    cancel: CancelHandle,
}

impl Orchestrator {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            connections,
            cancel: CancelHandle::new(),
        }
    }

    /// Share an existing cancellation flag (e.g. one wired to ctrl-c).
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Run every step of `pipeline` for one logical date.
    ///
    /// Step failures are recorded in the report; only definition problems
    /// (such as a cycle) return an error.
    pub async fn run(&self, pipeline: &Pipeline, logical_date: NaiveDate) -> EngineResult<RunReport> {
        let run_id = format!(
            "{}__{}__{}",
            pipeline.id,
            logical_date,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let waves = pipeline.waves()?;
        let order = pipeline.topological_order()?;
        let started_at = Utc::now();
        let start = Instant::now();

        let mut infos: HashMap<String, StepInfo> = HashMap::new();
        for id in &order {
            let node = pipeline
                .node(id)
                .ok_or_else(|| EngineError::UnknownNode(id.clone()))?;
            infos.insert(id.clone(), StepInfo::new(id, node.operator.kind()));
        }
        let mut outputs: HashMap<String, StepOutput> = HashMap::new();

        let base_ctx = RunContext::new(&run_id, &pipeline.id, logical_date, self.connections.clone());

        info!(
            run_id = %run_id,
            pipeline = %pipeline.id,
            logical_date = %logical_date,
            steps = order.len(),
            state = %RunState::Running,
            "Run started"
        );

        let mut cancelled = false;
        // Once cancelled, only all-done steps (cleanup) still start, and only
        // if something already ran.
        let mut finalize_only = false;
        for wave in &waves {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                finalize_only = infos.values().any(|i| i.attempts > 0);
                warn!(
                    run_id = %run_id,
                    pipeline = %pipeline.id,
                    finalize = finalize_only,
                    "Run cancelled, remaining steps skipped"
                );
            }

            let mut runnable = Vec::new();
            for id in wave {
                let upstream = pipeline.upstream_of(id)?;
                let node = pipeline
                    .node(id)
                    .ok_or_else(|| EngineError::UnknownNode(id.clone()))?;

                if cancelled && !(finalize_only && node.trigger_rule == TriggerRule::AllDone) {
                    if let Some(info) = infos.get_mut(id) {
                        info.skip();
                    }
                    continue;
                }

                let blocked = match node.trigger_rule {
                    TriggerRule::AllSuccess => upstream
                        .iter()
                        .find(|up| infos.get(*up).map(|i| i.state) != Some(StepState::Success)),
                    TriggerRule::AllDone => upstream
                        .iter()
                        .find(|up| !infos.get(*up).map(|i| i.state.is_terminal()).unwrap_or(false)),
                };

                if let Some(up) = blocked {
                    if let Some(info) = infos.get_mut(id) {
                        info.upstream_failed(up);
                    }
                    warn!(run_id = %run_id, step = %id, upstream = %up, "Upstream failed, step not started");
                    continue;
                }

                let inputs: HashMap<String, StepOutput> = upstream
                    .iter()
                    .filter_map(|up| outputs.get(up).map(|o| (up.clone(), o.clone())))
                    .collect();
                runnable.push((node, base_ctx.for_step(id, inputs)));
            }

            let results = join_all(
                runnable
                    .into_iter()
                    .map(|(node, ctx)| self.execute_step(pipeline, node, ctx)),
            )
            .await;

            for (id, info, result) in results {
                if let Ok(output) = result {
                    outputs.insert(id.clone(), output);
                }
                infos.insert(id, info);
            }
        }

        let steps: Vec<StepInfo> = order.iter().filter_map(|id| infos.remove(id)).collect();
        let (state, failure) = RunReport::conclude(&steps, cancelled);
        let duration = start.elapsed();

        tracing::info!(
            target: "orderflow.performance",
            run_id = %run_id,
            phase = "run",
            step_count = %steps.len(),
            duration_ms = %duration.as_millis(),
            "Run finished"
        );

        match &failure {
            Some(f) => error!(
                run_id = %run_id,
                pipeline = %pipeline.id,
                state = %state,
                step = %f.step,
                kind = %f.kind,
                error = %f.message,
                "Run failed"
            ),
            None => info!(run_id = %run_id, pipeline = %pipeline.id, state = %state, "Run finished"),
        }

        Ok(RunReport {
            run_id,
            pipeline_id: pipeline.id.clone(),
            logical_date,
            state,
            steps,
            outputs: outputs.into_iter().collect::<BTreeMap<_, _>>(),
            failure,
            cancelled,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Run one step to completion, retrying transient errors.
    async fn execute_step(
        &self,
        pipeline: &Pipeline,
        node: &Node,
        ctx: RunContext,
    ) -> (String, StepInfo, Result<StepOutput, ToolError>) {
        let mut info = StepInfo::new(&node.id, node.operator.kind());
        let retry = pipeline.retry_for(node);
        let max_retries = retry.as_ref().map(|r| r.max_retries).unwrap_or(0);
        let timeout = pipeline.timeout_for(node);

        info.start();
        debug!(run_id = %ctx.run_id, step = %node.id, kind = node.operator.kind(), "Step started");
        let start = Instant::now();

        let result = loop {
            info.attempts += 1;
            let attempt = match timeout {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), node.operator.execute(&ctx))
                    .await
                    .unwrap_or(Err(ToolError::Timeout(secs))),
                None => node.operator.execute(&ctx).await,
            };

            match attempt {
                Err(e) if e.is_transient() && info.attempts <= max_retries => {
                    let delay = retry
                        .as_ref()
                        .map(|r| r.delay_for(info.attempts))
                        .unwrap_or_default();
                    warn!(
                        run_id = %ctx.run_id,
                        step = %node.id,
                        attempt = info.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => break other,
            }
        };

        match &result {
            Ok(output) => {
                info.succeed();
                info!(run_id = %ctx.run_id, step = %node.id, output = %output.summary(), "Step succeeded");
            }
            Err(e) => {
                info.fail(e);
                error!(
                    run_id = %ctx.run_id,
                    step = %node.id,
                    kind = %e.kind(),
                    attempts = info.attempts,
                    error = %e,
                    "Step failed"
                );
            }
        }

        tracing::info!(
            target: "orderflow.performance",
            run_id = %ctx.run_id,
            step = %node.id,
            phase = "step",
            attempts = info.attempts,
            duration_ms = %start.elapsed().as_millis(),
            "Step finished"
        );

        (node.id.clone(), info, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TableHandle;
    use async_trait::async_trait;
    use orderflow_tools::tools::{Cleanup, SqlTransform};
    use orderflow_tools::{Operator, RetryConfig, StepConfig, Table, TableSource, Warehouse};
    use std::sync::atomic::AtomicU32;

    /// Fails with the given error a number of times, then yields a table.
    struct Flaky {
        failures: u32,
        calls: Arc<AtomicU32>,
        error: fn() -> ToolError,
        output: Table,
    }

    #[async_trait]
    impl Operator for Flaky {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        fn inputs(&self) -> Vec<TableSource> {
            Vec::new()
        }

        async fn execute(&self, ctx: &RunContext) -> Result<StepOutput, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err((self.error)());
            }
            ctx.temp_tables.register(&self.output);
            Ok(StepOutput::Table(self.output.clone()))
        }
    }

    struct Slow;

    #[async_trait]
    impl Operator for Slow {
        fn kind(&self) -> &'static str {
            "slow"
        }

        fn inputs(&self) -> Vec<TableSource> {
            Vec::new()
        }

        async fn execute(&self, _ctx: &RunContext) -> Result<StepOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StepOutput::Table(Table::named("never", "wh")))
        }
    }

    /// Cancels the run it belongs to while executing.
    struct CancelRun(CancelHandle);

    #[async_trait]
    impl Operator for CancelRun {
        fn kind(&self) -> &'static str {
            "cancel_run"
        }

        fn inputs(&self) -> Vec<TableSource> {
            Vec::new()
        }

        async fn execute(&self, _ctx: &RunContext) -> Result<StepOutput, ToolError> {
            self.0.cancel();
            Ok(StepOutput::Table(Table::named("orders", "wh")))
        }
    }

    fn setup() -> (Warehouse, Orchestrator, Pipeline) {
        let wh = Warehouse::in_memory().unwrap();
        wh.execute_batch(
            "CREATE TABLE orders (order_id INTEGER, amount INTEGER);
             INSERT INTO orders VALUES (1, 200), (2, 100);",
        )
        .unwrap();
        let mut registry = ConnectionRegistry::new();
        registry.register_warehouse("wh", wh.clone());
        let pipeline = Pipeline::builder("test")
            .start_date(NaiveDate::from_ymd_opt(2022, 1, 1).unwrap())
            .build()
            .unwrap();
        (wh, Orchestrator::new(Arc::new(registry)), pipeline)
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 1, 1).unwrap()
    }

    fn filter(p: &mut Pipeline, sql: &str) -> TableHandle {
        p.transform(SqlTransform::new("filter_orders", sql).bind("t", Table::named("orders", "wh")))
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_run_drops_temp_tables() {
        let (wh, orch, mut p) = setup();
        let filtered = filter(&mut p, "SELECT * FROM {{t}} WHERE amount > 150");
        let counted = p
            .transform(
                SqlTransform::new("count_orders", "SELECT count(*) AS n FROM {{f}}").bind("f", &filtered),
            )
            .unwrap();
        let cleanup = p.cleanup(Cleanup::all()).unwrap();
        p.set_downstream(&counted, &cleanup).unwrap();

        let report = orch.run(&p, date()).await.unwrap();
        assert_eq!(report.state, RunState::Succeeded);
        assert!(report.is_success());
        assert!(report.steps.iter().all(|s| s.state == StepState::Success));
        assert_eq!(report.step("filter_orders").unwrap().attempts, 1);

        let temp = report.output("filter_orders").unwrap().as_table().unwrap().clone();
        assert!(temp.is_temporary());
        assert!(!wh.table_exists(temp.require_name().unwrap()).unwrap());
        assert!(wh.table_exists("orders").unwrap());
    }

    #[tokio::test]
    async fn test_failure_propagates_and_cleanup_still_runs() {
        let (wh, orch, mut p) = setup();
        let good = filter(&mut p, "SELECT * FROM {{t}} WHERE amount > 150");
        let bad = p
            .transform(SqlTransform::new("broken", "SELEC * FROM {{g}}").bind("g", &good))
            .unwrap();
        let after = p
            .transform(SqlTransform::new("after_broken", "SELECT * FROM {{b}}").bind("b", &bad))
            .unwrap();
        let cleanup = p.cleanup(Cleanup::all()).unwrap();
        p.set_downstream(&after, &cleanup).unwrap();

        let report = orch.run(&p, date()).await.unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.step("filter_orders").unwrap().state, StepState::Success);
        assert_eq!(report.step("broken").unwrap().state, StepState::Failed);
        assert_eq!(report.step("after_broken").unwrap().state, StepState::UpstreamFailed);
        assert_eq!(report.step("cleanup").unwrap().state, StepState::Success);

        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step, "broken");
        assert_eq!(failure.kind, orderflow_tools::ErrorKind::QuerySyntaxError);

        let temp = report.output("filter_orders").unwrap().as_table().unwrap().clone();
        assert!(!wh.table_exists(temp.require_name().unwrap()).unwrap());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (_wh, orch, mut p) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        let id = p
            .add_step(
                "flaky",
                Flaky {
                    failures: 2,
                    calls: calls.clone(),
                    error: || ToolError::ConnectionError("reset".into()),
                    output: Table::named("orders", "wh"),
                },
                TriggerRule::AllSuccess,
            )
            .unwrap();
        p.set_step_config(
            &id,
            StepConfig {
                timeout: None,
                retry: Some(RetryConfig {
                    max_retries: 3,
                    initial_delay_ms: 1,
                    max_delay_ms: 5,
                    backoff_multiplier: 2.0,
                }),
            },
        )
        .unwrap();

        let report = orch.run(&p, date()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.step("flaky").unwrap().attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let (_wh, orch, mut p) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        let id = p
            .add_step(
                "flaky",
                Flaky {
                    failures: 10,
                    calls: calls.clone(),
                    error: || ToolError::ConnectionError("down".into()),
                    output: Table::named("orders", "wh"),
                },
                TriggerRule::AllSuccess,
            )
            .unwrap();
        p.set_step_config(
            &id,
            StepConfig {
                timeout: None,
                retry: Some(RetryConfig {
                    max_retries: 2,
                    initial_delay_ms: 1,
                    max_delay_ms: 1,
                    backoff_multiplier: 1.0,
                }),
            },
        )
        .unwrap();

        let report = orch.run(&p, date()).await.unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.step("flaky").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let (_wh, orch, mut p) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        let id = p
            .add_step(
                "flaky",
                Flaky {
                    failures: 1,
                    calls: calls.clone(),
                    error: || ToolError::ColumnNotFound("purchase_date".into()),
                    output: Table::named("orders", "wh"),
                },
                TriggerRule::AllSuccess,
            )
            .unwrap();
        p.set_step_config(
            &id,
            StepConfig {
                timeout: None,
                retry: Some(RetryConfig::with_retries(3)),
            },
        )
        .unwrap();

        let report = orch.run(&p, date()).await.unwrap();
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let (_wh, orch, mut p) = setup();
        let id = p.add_step("slow", Slow, TriggerRule::AllSuccess).unwrap();
        p.set_step_config(
            &id,
            StepConfig {
                timeout: Some(0),
                retry: None,
            },
        )
        .unwrap();

        let report = orch.run(&p, date()).await.unwrap();
        let step = report.step("slow").unwrap();
        assert_eq!(step.state, StepState::Failed);
        assert_eq!(step.error_kind, Some(orderflow_tools::ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_skipped() {
        let (_wh, orch, mut p) = setup();
        filter(&mut p, "SELECT * FROM {{t}}");
        orch.cancel_handle().cancel();

        let report = orch.run(&p, date()).await.unwrap();
        assert_eq!(report.state, RunState::Skipped);
        assert!(report.cancelled);
        assert_eq!(report.step("filter_orders").unwrap().state, StepState::Skipped);
        assert!(report.failure.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_midway_still_cleans_up() {
        let (wh, orch, mut p) = setup();
        let filtered = filter(&mut p, "SELECT * FROM {{t}} WHERE amount > 150");
        let stop = p
            .add_step("stop", CancelRun(orch.cancel_handle()), TriggerRule::AllSuccess)
            .unwrap();
        p.set_downstream(&filtered, &stop).unwrap();
        let after = p
            .transform(SqlTransform::new("after_stop", "SELECT * FROM {{f}}").bind("f", &filtered))
            .unwrap();
        p.set_downstream(&stop, &after).unwrap();
        let cleanup = p.cleanup(Cleanup::all()).unwrap();
        p.set_downstream(&after, &cleanup).unwrap();

        let report = orch.run(&p, date()).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.step("stop").unwrap().state, StepState::Success);
        assert_eq!(report.step("after_stop").unwrap().state, StepState::Skipped);
        assert_eq!(report.step("cleanup").unwrap().state, StepState::Success);

        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step, "after_stop");
        assert_eq!(failure.kind, orderflow_tools::ErrorKind::Cancelled);

        let temp = report.output("filter_orders").unwrap().as_table().unwrap().clone();
        assert!(!wh.table_exists(temp.require_name().unwrap()).unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_handle_resolves() {
        let handle = CancelHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        handle.cancel();
        task.await.unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let (_wh, orch, mut p) = setup();
        filter(&mut p, "SELECT * FROM {{t}} WHERE amount > 150");
        let report = orch.run(&p, date()).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "succeeded");
        assert_eq!(json["steps"][0]["state"], "success");
        assert_eq!(json["logical_date"], "2022-01-01");
    }
}
