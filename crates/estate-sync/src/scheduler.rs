use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::SyncConfig;
use crate::orchestrator::{RunOrchestrator, Trigger};

/// Two cron jobs that trigger a run; ticks landing on an active run are ignored.
pub async fn build_scheduler(config: &SyncConfig, orchestrator: RunOrchestrator) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let orchestrator = orchestrator.clone();
        let schedule = cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let orchestrator = orchestrator.clone();
            let schedule = schedule.clone();
            Box::pin(async move {
                match orchestrator.trigger() {
                    Trigger::Started(_) => info!(cron = %schedule, "scheduled run started"),
                    Trigger::Rejected(status) => {
                        info!(cron = %schedule, state = ?status.state, "scheduled run skipped")
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use estate_adapters::FixtureSource;
    use estate_core::{AreaBenchmark, MarketReference, ScoringParams};
    use estate_storage::SqliteStore;

    use crate::pipeline::Pipeline;

    async fn orchestrator() -> RunOrchestrator {
        let store = SqliteStore::in_memory().await.unwrap();
        let market = MarketReference::new(
            "testville",
            AreaBenchmark {
                avg_price_m2: 4_000.0,
                rental_yield_pct: 4.0,
                appreciation_rate: 0.01,
            },
        );
        RunOrchestrator::new(Pipeline::new(
            Arc::new(store),
            Arc::new(FixtureSource::new("demo", "/nonexistent/bundle.json")),
            Arc::new(market),
            Arc::new(ScoringParams::default()),
        ))
    }

    fn config(pairs: &[(&str, &str)]) -> SyncConfig {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let sched = build_scheduler(&config(&[]), orchestrator().await).await.unwrap();
        assert!(sched.is_none());
    }

    #[tokio::test]
    async fn enabled_scheduler_accepts_default_crons() {
        let sched = build_scheduler(&config(&[("ESTATE_SCHEDULER_ENABLED", "1")]), orchestrator().await)
            .await
            .unwrap();
        assert!(sched.is_some());
    }

    #[tokio::test]
    async fn invalid_cron_is_reported() {
        let cfg = config(&[("ESTATE_SCHEDULER_ENABLED", "true"), ("SYNC_CRON_1", "every morning")]);
        let err = build_scheduler(&cfg, orchestrator().await).await.err().expect("expected build_scheduler to fail");
        assert!(err.to_string().contains("every morning"));
    }
}
