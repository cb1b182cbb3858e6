use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::team::{Conclusion, TaskAnswer, Verdict, extract_answer};
use crate::telemetry::{TelemetrySink, unix_ms_now};

pub const DEFAULT_EVAL_OUTPUT_PATH: &str = ".teamcheck/evals/latest.json";

/// A record from a batch results file. Only the fields scoring needs.
#[derive(Debug, Deserialize)]
pub struct ResultEntry {
    pub instruction: String,
    #[serde(default)]
    pub answer: Value,
}

#[derive(Debug, Deserialize)]
pub struct GoldenEntry {
    pub instruction: String,
    pub label: String,
}

#[derive(Debug, Serialize)]
pub struct EvalCaseReport {
    pub index: usize,
    pub expected: Option<String>,
    pub predicted: Option<String>,
    pub exact_match: bool,
    pub executable: bool,
    /// The answer was raw text and the verdict had to be pulled out of it.
    pub normalized: bool,
}

#[derive(Debug, Serialize)]
pub struct EvalRunReport {
    pub generated_at_unix_ms: u128,
    pub total_cases: usize,
    pub matched_cases: usize,
    pub exact_matches: usize,
    pub executable_cases: usize,
    pub em_rate: f64,
    pub executability: f64,
    pub fail_under: f64,
    pub passed_threshold: bool,
    pub case_reports: Vec<EvalCaseReport>,
}

fn load_json_array<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<Vec<T>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} at '{}'", path.display()))?;
    serde_json::from_str::<Vec<T>>(&content)
        .with_context(|| format!("invalid {what} json at '{}'", path.display()))
}

pub fn load_results(path: &Path) -> Result<Vec<ResultEntry>> {
    let results = load_json_array::<ResultEntry>(path, "results file")?;
    if results.is_empty() {
        return Err(anyhow::anyhow!(
            "results file '{}' has no entries",
            path.display()
        ));
    }
    Ok(results)
}

pub fn load_golden(path: &Path) -> Result<Vec<GoldenEntry>> {
    load_json_array::<GoldenEntry>(path, "golden answer file")
}

/// Value of `"key": "..."` (either quote style) in free text.
fn quoted_field<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    for quote in ['"', '\''] {
        let needle = format!("{quote}{key}{quote}");
        let mut search_from = 0;
        while let Some(pos) = text[search_from..].find(&needle) {
            let after_key = search_from + pos + needle.len();
            search_from = after_key;
            let rest = text[after_key..].trim_start();
            let Some(rest) = rest.strip_prefix(':') else {
                continue;
            };
            let rest = rest.trim_start();
            let Some(open) = rest.chars().next().filter(|c| *c == '"' || *c == '\'') else {
                continue;
            };
            let body = &rest[open.len_utf8()..];
            if let Some(end) = body.find(['"', '\'']) {
                return Some(&body[..end]);
            }
        }
    }
    None
}

/// Structured answer from whatever the results file holds. Returns the
/// conclusion and whether raw text had to be scraped to get it.
pub fn normalize_answer(answer: &Value) -> (Option<Conclusion>, bool) {
    match answer {
        Value::Null => (None, false),
        Value::String(text) => match extract_answer(text) {
            TaskAnswer::Conclusion(conclusion) => (Some(conclusion), true),
            TaskAnswer::Raw(text) => {
                let verdict = quoted_field(&text, "conclusion").and_then(Verdict::parse);
                let reason = quoted_field(&text, "reason");
                match (verdict, reason) {
                    (Some(verdict), Some(reason)) => (
                        Some(Conclusion {
                            conclusion: Some(verdict),
                            reason: reason.to_string(),
                        }),
                        true,
                    ),
                    _ => (None, false),
                }
            }
        },
        other => match extract_answer(&other.to_string()) {
            TaskAnswer::Conclusion(conclusion) => (Some(conclusion), false),
            TaskAnswer::Raw(_) => (None, false),
        },
    }
}

pub fn round_metric(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

pub fn score_results(
    results: &[ResultEntry],
    golden: &[GoldenEntry],
    fail_under: f64,
) -> EvalRunReport {
    let labels = golden
        .iter()
        .map(|g| (g.instruction.trim(), g.label.trim().to_ascii_lowercase()))
        .collect::<HashMap<_, _>>();

    let mut case_reports = Vec::with_capacity(results.len());
    let mut matched_cases = 0usize;
    let mut exact_matches = 0usize;
    let mut executable_cases = 0usize;

    for (index, entry) in results.iter().enumerate() {
        let expected = labels.get(entry.instruction.trim()).cloned();
        let (conclusion, normalized) = normalize_answer(&entry.answer);
        let predicted = conclusion
            .and_then(|c| c.conclusion)
            .map(|v| v.label().to_string());

        let executable = predicted.is_some();
        let exact_match = match (&expected, &predicted) {
            (Some(expected), Some(predicted)) => expected == predicted,
            _ => false,
        };
        if expected.is_some() {
            matched_cases += 1;
        } else {
            tracing::debug!(index, "no golden label for instruction");
        }
        if exact_match {
            exact_matches += 1;
        }
        if executable {
            executable_cases += 1;
        }

        case_reports.push(EvalCaseReport {
            index,
            expected,
            predicted,
            exact_match,
            executable,
            normalized,
        });
    }

    let total_cases = results.len();
    let rate = |n: usize| {
        if total_cases == 0 {
            0.0
        } else {
            n as f64 / total_cases as f64
        }
    };
    let em_rate = rate(exact_matches);
    let fail_under = fail_under.clamp(0.0, 1.0);

    EvalRunReport {
        generated_at_unix_ms: unix_ms_now(),
        total_cases,
        matched_cases,
        exact_matches,
        executable_cases,
        em_rate: round_metric(em_rate),
        executability: round_metric(rate(executable_cases)),
        fail_under: round_metric(fail_under),
        passed_threshold: em_rate >= fail_under,
        case_reports,
    }
}

pub fn write_eval_report(path: &Path, report: &EvalRunReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create eval report directory '{}'",
                    parent.display()
                )
            })?;
        }
    }

    let payload =
        serde_json::to_string_pretty(report).context("failed to serialize eval report to json")?;
    std::fs::write(path, payload)
        .with_context(|| format!("failed to write eval report to '{}'", path.display()))
}

pub fn run_evaluation(
    results_path: &Path,
    golden_path: &Path,
    output_path: &Path,
    fail_under: f64,
    telemetry: &TelemetrySink,
) -> Result<EvalRunReport> {
    let results = load_results(results_path)?;
    let golden = load_golden(golden_path)?;
    let report = score_results(&results, &golden, fail_under);

    write_eval_report(output_path, &report)?;
    telemetry.emit(
        "eval.completed",
        json!({
            "total_cases": report.total_cases,
            "em_rate": report.em_rate,
            "executability": report.executability,
            "passed_threshold": report.passed_threshold,
            "output_path": output_path.display().to_string(),
        }),
    );

    println!(
        "Eval completed: cases={} matched={} EM={:.3} executability={:.3}",
        report.total_cases, report.matched_cases, report.em_rate, report.executability
    );
    println!("Report written to {}", output_path.display());

    if !report.passed_threshold {
        return Err(anyhow::anyhow!(
            "EM rate {:.3} is below threshold {:.3}",
            report.em_rate,
            report.fail_under
        ));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrapes_quoted_fields_from_loose_text() {
        let text = "Answer: {'conclusion': 'refute', 'reason': 'name mismatch' and more";
        assert_eq!(quoted_field(text, "conclusion"), Some("refute"));
        assert_eq!(quoted_field(text, "reason"), Some("name mismatch"));
        assert_eq!(quoted_field(text, "label"), None);
    }

    #[test]
    fn normalizes_string_and_object_answers() {
        let (object, scraped) =
            normalize_answer(&json!({"conclusion": "support", "reason": "matches"}));
        assert_eq!(object.and_then(|c| c.conclusion), Some(Verdict::Support));
        assert!(!scraped);

        let (text, scraped) =
            normalize_answer(&json!("The team says {'conclusion': 'refute', 'reason': 'x'}"));
        assert_eq!(text.and_then(|c| c.conclusion), Some(Verdict::Refute));
        assert!(scraped);

        assert_eq!(normalize_answer(&Value::Null), (None, false));
        assert_eq!(normalize_answer(&json!("no idea")).0, None);
    }

    #[test]
    fn scores_exact_match_and_executability() {
        let results = vec![
            ResultEntry {
                instruction: "q1".into(),
                answer: json!({"conclusion": "support", "reason": "ok"}),
            },
            ResultEntry {
                instruction: "q2".into(),
                answer: json!({"conclusion": "support", "reason": "wrong"}),
            },
            ResultEntry {
                instruction: "q3".into(),
                answer: json!({"conclusion": null, "reason": "budget exhausted"}),
            },
            ResultEntry {
                instruction: "q4".into(),
                answer: Value::Null,
            },
        ];
        let golden = vec![
            GoldenEntry {
                instruction: "q1".into(),
                label: "support".into(),
            },
            GoldenEntry {
                instruction: "q2".into(),
                label: "Refute".into(),
            },
            GoldenEntry {
                instruction: "q3".into(),
                label: "refute".into(),
            },
        ];

        let report = score_results(&results, &golden, 0.5);
        assert_eq!(report.total_cases, 4);
        assert_eq!(report.matched_cases, 3);
        assert_eq!(report.exact_matches, 1);
        assert_eq!(report.executable_cases, 2);
        assert_eq!(report.em_rate, 0.25);
        assert_eq!(report.executability, 0.5);
        assert!(!report.passed_threshold);
        assert!(report.case_reports[0].exact_match);
        assert_eq!(report.case_reports[3].expected, None);
    }
}
