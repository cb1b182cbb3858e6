use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::graph::RunOutcome;
use crate::team::{TaskAnswer, TaskResult, TeamBlueprint};
use crate::telemetry::TelemetrySink;

pub const DEFAULT_BATCH_CONCURRENCY: usize = 4;

/// One dataset entry. Extra fields (labels, evidence, graph snippets) are
/// ignored here and read back by `evaluate`.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    pub instruction: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Completed,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub index: usize,
    pub instruction: String,
    pub answer: Option<TaskAnswer>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRecord {
    fn from_result(index: usize, instruction: String, result: TaskResult) -> Self {
        let status = if result.is_clean() {
            TaskStatus::Completed
        } else {
            TaskStatus::Degraded
        };
        Self {
            index,
            instruction,
            status,
            outcome: Some(result.report.outcome.label().to_string()),
            steps: Some(result.report.steps),
            answer: Some(result.answer),
            error: None,
        }
    }

    fn failed(index: usize, instruction: String, error: String) -> Self {
        Self {
            index,
            instruction,
            answer: None,
            status: TaskStatus::Failed,
            outcome: None,
            steps: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// RFC 3339 timestamp.
    pub generated_at: String,
    pub total: usize,
    pub completed: usize,
    pub degraded: usize,
    pub failed: usize,
    pub budget_exhausted: usize,
    pub fallback: usize,
    pub step_limited: usize,
    pub failed_indices: Vec<usize>,
    pub records: Vec<TaskRecord>,
}

pub fn load_batch_items(path: &Path) -> Result<Vec<BatchItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read batch dataset at '{}'", path.display()))?;
    let items = serde_json::from_str::<Vec<BatchItem>>(&content).with_context(|| {
        format!(
            "invalid batch dataset json at '{}'. Expected an array of objects with an 'instruction' field.",
            path.display()
        )
    })?;
    if items.is_empty() {
        return Err(anyhow::anyhow!(
            "batch dataset '{}' has no items",
            path.display()
        ));
    }
    Ok(items)
}

/// Run every item on its own graph instance, at most `concurrency` at once.
/// Every index ends up with exactly one record, in index order.
pub async fn run_batch(
    blueprint: Arc<TeamBlueprint>,
    items: Vec<BatchItem>,
    concurrency: usize,
    telemetry: &TelemetrySink,
) -> BatchReport {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    let mut pending = HashMap::new();
    let mut records = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let blueprint = Arc::clone(&blueprint);
        let permits = Arc::clone(&permits);
        let sink = telemetry.for_task(index);
        let instruction = item.instruction.clone();
        let handle = set.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(err) => return (index, Err(err.to_string())),
            };
            let result = blueprint
                .run_task(&instruction, &sink)
                .await
                .map_err(|err| err.to_string());
            (index, result)
        });
        pending.insert(handle.id(), (index, item.instruction));
    }

    while let Some(joined) = set.join_next_with_id().await {
        match joined {
            Ok((id, (index, result))) => {
                let (_, instruction) = pending.remove(&id).unwrap_or((index, String::new()));
                let record = match result {
                    Ok(result) => TaskRecord::from_result(index, instruction, result),
                    Err(error) => {
                        tracing::warn!(index, error = %error, "task failed");
                        TaskRecord::failed(index, instruction, error)
                    }
                };
                records.push(record);
            }
            Err(err) => {
                let Some((index, instruction)) = pending.remove(&err.id()) else {
                    tracing::error!(error = %err, "lost track of a batch task");
                    continue;
                };
                tracing::error!(index, error = %err, "task panicked");
                records.push(TaskRecord::failed(index, instruction, err.to_string()));
            }
        }
    }

    records.sort_by_key(|r| r.index);
    summarize(records)
}

fn summarize(records: Vec<TaskRecord>) -> BatchReport {
    let count = |status: TaskStatus| records.iter().filter(|r| r.status == status).count();
    let count_outcome = |outcome: &RunOutcome| {
        records
            .iter()
            .filter(|r| r.outcome.as_deref() == Some(outcome.label()))
            .count()
    };
    let failed_indices = records
        .iter()
        .filter(|r| r.status == TaskStatus::Failed)
        .map(|r| r.index)
        .collect();

    BatchReport {
        generated_at: Utc::now().to_rfc3339(),
        total: records.len(),
        completed: count(TaskStatus::Completed),
        degraded: count(TaskStatus::Degraded),
        failed: count(TaskStatus::Failed),
        budget_exhausted: count_outcome(&RunOutcome::BudgetExhausted {
            agent: String::new(),
        }),
        fallback: count_outcome(&RunOutcome::Fallback {
            agent: String::new(),
        }),
        step_limited: count_outcome(&RunOutcome::StepLimitReached { max_steps: 0 }),
        failed_indices,
        records,
    }
}

fn write_json(path: &Path, value: &impl Serialize, what: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create {what} directory '{}'", parent.display())
            })?;
        }
    }
    let payload = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {what} to json"))?;
    std::fs::write(path, payload)
        .with_context(|| format!("failed to write {what} to '{}'", path.display()))
}

/// Results go to `results_path` as a record array; failed indices go to
/// `failures_path` alongside the run timestamp.
pub fn write_batch_outputs(
    report: &BatchReport,
    results_path: &Path,
    failures_path: &Path,
) -> Result<()> {
    write_json(results_path, &report.records, "batch results")?;
    write_json(
        failures_path,
        &json!({
            "generated_at": report.generated_at,
            "failed_indices": report.failed_indices,
        }),
        "batch failure list",
    )
}

pub async fn run_batch_file(
    blueprint: Arc<TeamBlueprint>,
    dataset_path: &Path,
    results_path: &Path,
    failures_path: &Path,
    concurrency: usize,
    telemetry: &TelemetrySink,
) -> Result<BatchReport> {
    let items = load_batch_items(dataset_path)?;
    tracing::info!(
        items = items.len(),
        concurrency,
        dataset = %dataset_path.display(),
        "starting batch"
    );
    let report = run_batch(blueprint, items, concurrency, telemetry).await;
    write_batch_outputs(&report, results_path, failures_path)?;

    println!(
        "Batch completed: total={} completed={} degraded={} failed={} (budget_exhausted={} fallback={} step_limited={})",
        report.total,
        report.completed,
        report.degraded,
        report.failed,
        report.budget_exhausted,
        report.fallback,
        report.step_limited
    );
    println!("Results written to {}", results_path.display());
    if !report.failed_indices.is_empty() {
        println!(
            "Failed indices {:?} written to {}",
            report.failed_indices,
            failures_path.display()
        );
    }
    Ok(report)
}
