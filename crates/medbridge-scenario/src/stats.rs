//! 场景执行统计
//!
//! 从执行日志即时聚合: 窗口内次数与成功率、ACK码分布、平均时长。
//! 不落库为派生状态。

use chrono::{DateTime, Utc};
use medbridge_core::models::{RunStatus, RunStepStatus};
use medbridge_core::Result;
use medbridge_store::Store;
use std::collections::HashMap;
use std::sync::Arc;

/// 聚合统计
#[derive(Debug, Clone, Default)]
pub struct ScenarioStats {
    pub total_runs: usize,
    pub success_runs: usize,
    pub partial_runs: usize,
    pub error_runs: usize,
    pub success_rate: f64,
    pub ack_distribution: HashMap<String, usize>,
    pub mean_duration_ms: Option<f64>,
}

/// 计算统计（template_key为None时聚合全部, since限定窗口起点）
pub async fn compute_stats(
    store: &Arc<dyn Store>,
    template_key: Option<&str>,
    since: Option<DateTime<Utc>>,
) -> Result<ScenarioStats> {
    let runs = store.list_runs(template_key).await?;
    let runs: Vec<_> = runs
        .into_iter()
        .filter(|r| since.map(|s| r.started_at >= s).unwrap_or(true))
        .collect();

    let mut stats = ScenarioStats {
        total_runs: runs.len(),
        ..Default::default()
    };

    let mut durations = Vec::new();
    for run in &runs {
        match run.status {
            RunStatus::Success => stats.success_runs += 1,
            RunStatus::Partial => stats.partial_runs += 1,
            RunStatus::Error => stats.error_runs += 1,
            RunStatus::Running => {}
        }
        for step in &run.steps {
            if let Some(code) = &step.ack_code {
                *stats.ack_distribution.entry(code.clone()).or_insert(0) += 1;
            }
            if step.status != RunStepStatus::Skipped {
                if let Some(ms) = step.duration_ms {
                    durations.push(ms as f64);
                }
            }
        }
    }

    if stats.total_runs > 0 {
        stats.success_rate = stats.success_runs as f64 / stats.total_runs as f64;
    }
    if !durations.is_empty() {
        stats.mean_duration_ms = Some(durations.iter().sum::<f64>() / durations.len() as f64);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use medbridge_core::models::{Protocol, RunStepLog, ScenarioRun};
    use medbridge_store::MemoryStore;
    use uuid::Uuid;

    fn run(status: RunStatus, ack: &str, duration_ms: i64, started_offset_min: i64) -> ScenarioRun {
        ScenarioRun {
            id: Uuid::new_v4(),
            template_key: "demo".to_string(),
            endpoint_id: Uuid::new_v4(),
            protocol: Protocol::Hl7v2,
            dry_run: false,
            stop_on_error: false,
            started_at: Utc::now() - Duration::minutes(started_offset_min),
            finished_at: Some(Utc::now()),
            status,
            generated_ipp: None,
            generated_nda: None,
            generated_vn: None,
            steps: vec![RunStepLog {
                order_index: 1,
                trigger: "A01".to_string(),
                status: if ack == "AA" {
                    RunStepStatus::Success
                } else {
                    RunStepStatus::Error
                },
                ack_code: Some(ack.to_string()),
                duration_ms: Some(duration_ms),
                error: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_aggregation() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.insert_run(run(RunStatus::Success, "AA", 100, 5)).await.unwrap();
        store.insert_run(run(RunStatus::Success, "AA", 300, 5)).await.unwrap();
        store.insert_run(run(RunStatus::Error, "AE", 200, 5)).await.unwrap();

        let stats = compute_stats(&store, Some("demo"), None).await.unwrap();
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.success_runs, 2);
        assert_eq!(stats.error_runs, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.ack_distribution["AA"], 2);
        assert_eq!(stats.ack_distribution["AE"], 1);
        assert_eq!(stats.mean_duration_ms, Some(200.0));
    }

    #[tokio::test]
    async fn test_window_filter() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.insert_run(run(RunStatus::Success, "AA", 100, 120)).await.unwrap();
        store.insert_run(run(RunStatus::Success, "AA", 100, 5)).await.unwrap();

        let since = Utc::now() - Duration::hours(1);
        let stats = compute_stats(&store, None, Some(since)).await.unwrap();
        assert_eq!(stats.total_runs, 1);
    }
}
