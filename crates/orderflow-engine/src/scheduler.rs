//! Scheduler loop: one run per due tick, one run at a time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::orchestrator::{CancelHandle, Orchestrator};
use crate::pipeline::Pipeline;
use crate::state::{RunReport, RunState};

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    orchestrator: Orchestrator,
    last_tick: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, orchestrator: Orchestrator) -> Self {
        Self {
            pipeline,
            orchestrator,
            last_tick: None,
        }
    }

    /// Resume after a known tick; earlier ticks are never run again.
    pub fn with_last_tick(mut self, tick: DateTime<Utc>) -> Self {
        self.last_tick = Some(tick);
        self
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        self.last_tick
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.orchestrator.cancel_handle()
    }

    /// Run every tick due at `now`, oldest first, sequentially.
    pub async fn run_due(&mut self, now: DateTime<Utc>) -> EngineResult<Vec<RunReport>> {
        let due = self.pipeline.schedule.due_runs(
            self.pipeline.start_date,
            self.last_tick,
            now,
            self.pipeline.catchup,
        );

        let mut reports = Vec::with_capacity(due.len());
        for tick in due {
            if self.orchestrator.cancel_handle().is_cancelled() {
                break;
            }
            info!(
                pipeline = %self.pipeline.id,
                tick = %tick,
                state = %RunState::Scheduled,
                "Run scheduled"
            );
            let report = self.orchestrator.run(&self.pipeline, tick.date_naive()).await?;
            self.last_tick = Some(tick);
            reports.push(report);
        }
        Ok(reports)
    }

    /// Loop until cancelled or the schedule has no further ticks.
    pub async fn run_forever(&mut self) -> EngineResult<()> {
        let cancel = self.orchestrator.cancel_handle();
        info!(
            pipeline = %self.pipeline.id,
            schedule = %self.pipeline.schedule,
            catchup = self.pipeline.catchup,
            "Scheduler started"
        );

        loop {
            for report in self.run_due(Utc::now()).await? {
                if report.state != RunState::Succeeded {
                    warn!(run_id = %report.run_id, state = %report.state, "Scheduled run did not succeed");
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let from = self.last_tick.unwrap_or_else(Utc::now);
            let Some(next) = self.pipeline.schedule.next_after(from) else {
                info!(pipeline = %self.pipeline.id, "No further ticks, scheduler stopping");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            debug!(pipeline = %self.pipeline.id, next = %next, wait_secs = wait.as_secs(), "Waiting for next tick");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!(pipeline = %self.pipeline.id, "Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use orderflow_tools::tools::SqlTransform;
    use orderflow_tools::{ConnectionRegistry, Table, Warehouse};

    fn scheduler(schedule: &str, catchup: bool) -> Scheduler {
        let wh = Warehouse::in_memory().unwrap();
        wh.execute_batch("CREATE TABLE orders (order_id INTEGER, amount INTEGER);")
            .unwrap();
        let mut registry = ConnectionRegistry::new();
        registry.register_warehouse("wh", wh);

        let mut pipeline = Pipeline::builder("astro_orders")
            .start_date(NaiveDate::from_ymd_opt(2022, 1, 1).unwrap())
            .schedule(schedule)
            .catchup(catchup)
            .build()
            .unwrap();
        pipeline
            .transform(
                SqlTransform::new("filter_orders", "SELECT * FROM {{t}} WHERE amount > 150")
                    .bind("t", Table::named("orders", "wh")),
            )
            .unwrap();
        Scheduler::new(Arc::new(pipeline), Orchestrator::new(Arc::new(registry)))
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 6, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_without_catchup_runs_latest_only() {
        let mut s = scheduler("@daily", false);
        let reports = s.run_due(at(2022, 1, 4)).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].logical_date, NaiveDate::from_ymd_opt(2022, 1, 4).unwrap());
        assert!(reports[0].is_success());

        // nothing new within the same day
        assert!(s.run_due(at(2022, 1, 4)).await.unwrap().is_empty());
        assert_eq!(s.run_due(at(2022, 1, 5)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_catchup_backfills_in_order() {
        let mut s = scheduler("@daily", true);
        let reports = s.run_due(at(2022, 1, 3)).await.unwrap();
        let dates: Vec<String> = reports.iter().map(|r| r.logical_date.to_string()).collect();
        assert_eq!(dates, vec!["2022-01-01", "2022-01-02", "2022-01-03"]);
    }

    #[tokio::test]
    async fn test_cancelled_scheduler_starts_nothing() {
        let mut s = scheduler("@daily", true);
        s.cancel_handle().cancel();
        assert!(s.run_due(at(2022, 1, 3)).await.unwrap().is_empty());
        s.run_forever().await.unwrap();
    }

    #[tokio::test]
    async fn test_once_stops_after_single_run() {
        let mut s = scheduler("@once", false).with_last_tick(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap());
        s.run_forever().await.unwrap();
        assert!(s.run_due(Utc::now()).await.unwrap().is_empty());
    }
}
