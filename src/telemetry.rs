use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Appends one JSON object per line. Clones share the file lock, so one sink
/// can be handed to every task instance of a batch.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    pub enabled: bool,
    pub path: PathBuf,
    pub run_id: String,
    pub command: String,
    pub task_index: Option<usize>,
    file_lock: Arc<Mutex<()>>,
}

#[derive(Serialize)]
struct EventRecord<'a> {
    ts_unix_ms: u128,
    event: &'a str,
    run_id: &'a str,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_index: Option<usize>,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl TelemetrySink {
    pub fn new(enabled: bool, path: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            enabled,
            path: path.into(),
            run_id: format!("run-{}-{}", unix_ms_now(), std::process::id()),
            command: command.into(),
            task_index: None,
            file_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, PathBuf::new(), "disabled")
    }

    /// Same stream, with every event tagged by dataset index.
    pub fn for_task(&self, index: usize) -> Self {
        Self {
            task_index: Some(index),
            ..self.clone()
        }
    }

    /// Write failures are logged and swallowed; telemetry never fails a task.
    pub fn emit(&self, event: &str, payload: Value) {
        if !self.enabled {
            return;
        }
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other)]),
        };
        let record = EventRecord {
            ts_unix_ms: unix_ms_now(),
            event,
            run_id: &self.run_id,
            command: &self.command,
            task_index: self.task_index,
            payload,
        };
        if let Err(err) = self.append(&record) {
            tracing::warn!(event, path = %self.path.display(), error = %err, "telemetry write failed");
        }
    }

    fn append(&self, record: &EventRecord<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("failed to encode telemetry event")?;
        line.push(b'\n');

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create '{}'", dir.display()))?;
        }
        // One write per line under the lock keeps concurrent tasks from interleaving.
        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .with_context(|| format!("failed to append to '{}'", self.path.display()))
    }
}

/// Fields the report reads back. Everything else in a line is ignored.
#[derive(Debug, Deserialize)]
struct EventLine {
    event: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    ts_unix_ms: Option<u64>,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    steps: Option<usize>,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    tool: Option<String>,
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub unique_runs: BTreeSet<String>,
    pub outcome_counts: BTreeMap<String, usize>,
    pub task_completed: usize,
    pub task_failed: usize,
    /// Sum of `steps` over completed tasks.
    pub task_steps: usize,
    pub node_invocations: usize,
    pub agent_parse_failures: usize,
    /// Budget exhaustions per agent label.
    pub exhausted_by_agent: BTreeMap<String, usize>,
    pub tool_succeeded: usize,
    pub tool_failed: usize,
    pub tool_invalid: usize,
    pub tool_denied: usize,
    pub failures_by_tool: BTreeMap<String, usize>,
    pub last_event_ts_unix_ms: Option<u64>,
}

impl TelemetrySummary {
    pub fn budget_exhaustions(&self) -> usize {
        self.exhausted_by_agent.values().sum()
    }

    pub fn mean_steps(&self) -> Option<f64> {
        (self.task_completed > 0).then(|| self.task_steps as f64 / self.task_completed as f64)
    }

    fn record(&mut self, line: EventLine) {
        if let Some(run_id) = line.run_id.filter(|id| !id.is_empty()) {
            self.unique_runs.insert(run_id);
        }
        if let Some(ts) = line.ts_unix_ms {
            self.last_event_ts_unix_ms = self.last_event_ts_unix_ms.max(Some(ts));
        }

        match line.event.as_str() {
            "task.completed" => {
                self.task_completed += 1;
                self.task_steps += line.steps.unwrap_or_default();
                if let Some(outcome) = line.outcome {
                    *self.outcome_counts.entry(outcome).or_default() += 1;
                }
            }
            "task.failed" => self.task_failed += 1,
            "node.invoked" => self.node_invocations += 1,
            "agent.parse_failed" => self.agent_parse_failures += 1,
            "agent.budget_exhausted" => {
                let agent = line.agent.unwrap_or_else(|| "unknown".to_string());
                *self.exhausted_by_agent.entry(agent).or_default() += 1;
            }
            "tool.succeeded" => self.tool_succeeded += 1,
            "tool.failed" => {
                self.tool_failed += 1;
                let tool = line.tool.unwrap_or_else(|| "unknown".to_string());
                *self.failures_by_tool.entry(tool).or_default() += 1;
            }
            "tool.invalid" => self.tool_invalid += 1,
            "tool.denied" => self.tool_denied += 1,
            _ => {}
        }
    }
}

/// Summarize the newest `limit` lines of a telemetry stream.
pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary {
        total_lines: lines.len(),
        ..TelemetrySummary::default()
    };

    for line in lines.iter().rev().take(limit.max(1)) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<EventLine>(line) {
            Ok(parsed) => {
                summary.parsed_events += 1;
                summary.record(parsed);
            }
            Err(_) => summary.parse_errors += 1,
        }
    }

    summary
}

fn print_counts(title: &str, counts: &BTreeMap<String, usize>) {
    if counts.is_empty() {
        return;
    }
    let mut rows = counts.iter().collect::<Vec<_>>();
    rows.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    println!("{title}:");
    for (name, count) in rows {
        println!("- {name}: {count}");
    }
}

pub fn run_telemetry_report(path: PathBuf, limit: usize) -> Result<()> {
    if !path.exists() {
        println!("No telemetry file found at '{}'.", path.display());
        return Ok(());
    }

    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    let lines = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;
    let summary = summarize_telemetry_lines(lines, limit);

    println!("Telemetry report for {}", path.display());
    println!(
        "Events: {} of {} lines (parse_errors={}), runs={}",
        summary.parsed_events,
        summary.total_lines,
        summary.parse_errors,
        summary.unique_runs.len()
    );
    match summary.mean_steps() {
        Some(mean) => println!(
            "Tasks: completed={} failed={} mean_steps={mean:.1}",
            summary.task_completed, summary.task_failed
        ),
        None => println!(
            "Tasks: completed={} failed={}",
            summary.task_completed, summary.task_failed
        ),
    }
    println!(
        "Nodes: invocations={} parse_failures={} budget_exhaustions={}",
        summary.node_invocations,
        summary.agent_parse_failures,
        summary.budget_exhaustions()
    );
    println!(
        "Tools: succeeded={} failed={} invalid={} denied={}",
        summary.tool_succeeded, summary.tool_failed, summary.tool_invalid, summary.tool_denied
    );
    print_counts("Outcomes", &summary.outcome_counts);
    print_counts("Exhausted agents", &summary.exhausted_by_agent);
    print_counts("Failing tools", &summary.failures_by_tool);

    if let Some(ts) = summary.last_event_ts_unix_ms {
        println!("Last event ts_unix_ms: {ts}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_domain_events_and_skips_garbage() {
        let lines = vec![
            r#"{"event":"node.invoked","run_id":"r1","ts_unix_ms":5}"#.to_string(),
            r#"{"event":"agent.budget_exhausted","run_id":"r1","agent":"kg_agent"}"#.to_string(),
            r#"{"event":"tool.failed","run_id":"r1","tool":"query_node"}"#.to_string(),
            r#"{"event":"tool.denied","run_id":"r1","tool":"query_node"}"#.to_string(),
            "not json".to_string(),
            String::new(),
            r#"{"event":"task.completed","run_id":"r2","outcome":"completed","steps":4,"ts_unix_ms":9}"#
                .to_string(),
        ];
        let summary = summarize_telemetry_lines(lines, 100);

        assert_eq!(summary.total_lines, 7);
        assert_eq!(summary.parsed_events, 5);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.unique_runs.len(), 2);
        assert_eq!(summary.exhausted_by_agent.get("kg_agent"), Some(&1));
        assert_eq!(summary.failures_by_tool.get("query_node"), Some(&1));
        assert_eq!(summary.tool_denied, 1);
        assert_eq!(summary.mean_steps(), Some(4.0));
        assert_eq!(summary.last_event_ts_unix_ms, Some(9));
    }

    #[test]
    fn limit_keeps_newest_lines() {
        let lines = (0..10)
            .map(|i| format!(r#"{{"event":"node.invoked","ts_unix_ms":{i}}}"#))
            .collect::<Vec<_>>();
        let summary = summarize_telemetry_lines(lines, 3);
        assert_eq!(summary.node_invocations, 3);
        assert_eq!(summary.last_event_ts_unix_ms, Some(9));
    }

    #[test]
    fn disabled_sink_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = TelemetrySink::new(false, &path, "run");
        sink.emit("task.started", serde_json::json!({ "instruction_chars": 3 }));
        assert!(!path.exists());
    }
}
