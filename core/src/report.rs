use comfy_table::{presets::ASCII_FULL, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::runtime::{Outcome, StepResult, SuiteRun};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counts {
    pub pass: usize,
    pub fail: usize,
    pub skip: usize,
    pub error: usize,
}

impl Counts {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Pass => self.pass += 1,
            Outcome::Fail => self.fail += 1,
            Outcome::Skip => self.skip += 1,
            Outcome::Error => self.error += 1,
        }
    }

    fn absorb(&mut self, other: Counts) {
        self.pass += other.pass;
        self.fail += other.fail;
        self.skip += other.skip;
        self.error += other.error;
    }

    pub fn total(&self) -> usize {
        self.pass + self.fail + self.skip + self.error
    }

    pub fn pass_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.pass as f64 / total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SuiteReport {
    pub name: String,
    pub counts: Counts,
    pub results: Vec<StepResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriticalIssue {
    pub suite: String,
    pub step: String,
    pub outcome: Outcome,
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub generated_at: String,
    pub suites: BTreeMap<String, SuiteReport>,
}

/// Consumes step results in the order they were recorded and folds them into
/// a [`Report`].
#[derive(Debug, Default)]
pub struct Aggregator {
    suites: BTreeMap<String, SuiteReport>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, result: StepResult) {
        let suite = self
            .suites
            .entry(result.suite.clone())
            .or_insert_with(|| SuiteReport {
                name: result.suite.clone(),
                ..SuiteReport::default()
            });
        suite.counts.record(result.outcome);
        suite.results.push(result);
    }

    pub fn record_run(&mut self, run: &SuiteRun) {
        // an empty suite still shows up in the report
        self.suites
            .entry(run.suite.clone())
            .or_insert_with(|| SuiteReport {
                name: run.suite.clone(),
                ..SuiteReport::default()
            });
        for result in &run.results {
            self.record(result.clone());
        }
    }

    pub fn finish(self) -> Report {
        Report {
            generated_at: now_rfc3339(),
            suites: self.suites,
        }
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Report {
    pub fn from_runs(runs: &[SuiteRun]) -> Self {
        let mut aggregator = Aggregator::new();
        for run in runs {
            aggregator.record_run(run);
        }
        aggregator.finish()
    }

    pub fn totals(&self) -> Counts {
        let mut totals = Counts::default();
        for suite in self.suites.values() {
            totals.absorb(suite.counts);
        }
        totals
    }

    pub fn pass_rate(&self) -> f64 {
        self.totals().pass_rate()
    }

    /// Critical steps that did not pass, however high the pass rate is.
    pub fn critical_issues(&self) -> Vec<CriticalIssue> {
        self.suites
            .values()
            .flat_map(|suite| suite.results.iter())
            .filter(|result| result.critical && result.outcome != Outcome::Pass)
            .map(|result| CriticalIssue {
                suite: result.suite.clone(),
                step: result.step.clone(),
                outcome: result.outcome,
                diagnostic: result.diagnostic.clone(),
            })
            .collect()
    }

    pub fn has_critical_issues(&self) -> bool {
        self.suites
            .values()
            .flat_map(|suite| suite.results.iter())
            .any(|result| result.critical && result.outcome != Outcome::Pass)
    }

    /// Combines two reports. Suites are keyed by name, so merge order does not
    /// change any count; records of a suite present in both keep their own
    /// order, `self` first.
    pub fn merge(mut self, other: Report) -> Report {
        for (name, incoming) in other.suites {
            match self.suites.get_mut(&name) {
                Some(existing) => {
                    existing.counts.absorb(incoming.counts);
                    existing.results.extend(incoming.results);
                }
                None => {
                    self.suites.insert(name, incoming);
                }
            }
        }
        if other.generated_at > self.generated_at {
            self.generated_at = other.generated_at;
        }
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait Renderer {
    fn render(&self, report: &Report) -> Result<String, RenderError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Console,
    Markdown,
    Json,
}

impl ReportFormat {
    pub fn renderer(self) -> Box<dyn Renderer> {
        match self {
            ReportFormat::Console => Box::new(ConsoleRenderer),
            ReportFormat::Markdown => Box::new(MarkdownRenderer),
            ReportFormat::Json => Box::new(JsonRenderer),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleRenderer;

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRenderer;

const SUMMARY_COLUMNS: [&str; 7] = ["Suite", "Pass", "Fail", "Skip", "Error", "Total", "Pass rate"];

fn summary_rows(report: &Report) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = report
        .suites
        .values()
        .map(|suite| counts_row(&suite.name, &suite.counts))
        .collect();
    rows.push(counts_row("TOTAL", &report.totals()));
    rows
}

fn counts_row(label: &str, counts: &Counts) -> Vec<String> {
    vec![
        label.to_string(),
        counts.pass.to_string(),
        counts.fail.to_string(),
        counts.skip.to_string(),
        counts.error.to_string(),
        counts.total().to_string(),
        format!("{:.1}%", counts.pass_rate()),
    ]
}

impl Renderer for ConsoleRenderer {
    fn render(&self, report: &Report) -> Result<String, RenderError> {
        let mut out = String::new();
        out.push_str(&format!("flowprobe report ({})\n\n", report.generated_at));

        for suite in report.suites.values() {
            out.push_str(&format!("Suite {}:\n", suite.name));
            if suite.results.is_empty() {
                out.push_str("  (no steps)\n");
            }
            for result in &suite.results {
                let status = result
                    .status
                    .map(|status| format!(" -> {status}"))
                    .unwrap_or_default();
                let critical = if result.critical { " [critical]" } else { "" };
                out.push_str(&format!(
                    "  [{}] {} {}{} ({}ms){}\n",
                    result.outcome, result.step, result.action, status, result.latency_ms, critical
                ));
                if let Some(message) = &result.diagnostic {
                    for line in message.lines() {
                        out.push_str(&format!("      {line}\n"));
                    }
                }
            }
            out.push('\n');
        }

        let mut table = Table::new();
        table.load_preset(ASCII_FULL);
        table.set_header(SUMMARY_COLUMNS.to_vec());
        for row in summary_rows(report) {
            table.add_row(row);
        }
        out.push_str(&table.to_string());
        out.push('\n');

        out.push_str(&format!("\nPass rate: {:.1}%\n", report.pass_rate()));
        let issues = report.critical_issues();
        if issues.is_empty() {
            out.push_str("Critical issues: none\n");
        } else {
            out.push_str(&format!("Critical issues ({}):\n", issues.len()));
            for issue in issues {
                out.push_str(&format!(
                    "  - {}/{} [{}] {}\n",
                    issue.suite,
                    issue.step,
                    issue.outcome,
                    issue.diagnostic.unwrap_or_default()
                ));
            }
        }
        Ok(out)
    }
}

impl Renderer for MarkdownRenderer {
    fn render(&self, report: &Report) -> Result<String, RenderError> {
        let mut md = String::new();
        md.push_str("# flowprobe report\n\n");
        md.push_str(&format!("_Generated at {}_\n\n", report.generated_at));
        md.push_str(&format!("**Pass rate:** {:.1}%\n\n", report.pass_rate()));

        md.push_str("## Summary\n\n");
        md.push_str(&markdown_table(&SUMMARY_COLUMNS, &summary_rows(report)));
        md.push('\n');

        md.push_str("## Critical issues\n\n");
        let issues = report.critical_issues();
        if issues.is_empty() {
            md.push_str("None.\n\n");
        } else {
            for issue in issues {
                md.push_str(&format!(
                    "- **{}/{}** ({}): {}\n",
                    issue.suite,
                    issue.step,
                    issue.outcome,
                    sanitize_markdown_cell(&issue.diagnostic.unwrap_or_default())
                ));
            }
            md.push('\n');
        }

        for suite in report.suites.values() {
            md.push_str(&format!("## {}\n\n", suite.name));
            if suite.results.is_empty() {
                md.push_str("No steps were recorded.\n\n");
                continue;
            }
            let rows: Vec<Vec<String>> = suite
                .results
                .iter()
                .map(|result| {
                    vec![
                        result.step.clone(),
                        result.action.clone(),
                        result.outcome.to_string(),
                        result.status.map(|s| s.to_string()).unwrap_or_default(),
                        format!("{}ms", result.latency_ms),
                        result.diagnostic.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            md.push_str(&markdown_table(
                &["Step", "Action", "Outcome", "Status", "Latency", "Diagnostic"],
                &rows,
            ));
            md.push('\n');
        }

        Ok(md)
    }
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    generated_at: &'a str,
    totals: Counts,
    pass_rate: f64,
    critical_issues: Vec<CriticalIssue>,
    suites: Vec<&'a SuiteReport>,
}

impl Renderer for JsonRenderer {
    fn render(&self, report: &Report) -> Result<String, RenderError> {
        let document = JsonDocument {
            generated_at: &report.generated_at,
            totals: report.totals(),
            pass_rate: report.pass_rate(),
            critical_issues: report.critical_issues(),
            suites: report.suites.values().collect(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }
}

fn markdown_table(columns: &[&str], rows: &[Vec<String>]) -> String {
    let mut md = String::new();
    md.push('|');
    for column in columns {
        md.push(' ');
        md.push_str(&sanitize_markdown_cell(column));
        md.push_str(" |");
    }
    md.push('\n');

    md.push('|');
    for _ in columns {
        md.push_str(" --- |");
    }
    md.push('\n');

    for row in rows {
        md.push('|');
        for value in row {
            md.push(' ');
            md.push_str(&sanitize_markdown_cell(value));
            md.push_str(" |");
        }
        md.push('\n');
    }

    md
}

fn sanitize_markdown_cell(value: &str) -> String {
    let replaced = value.replace('\n', "<br>");
    replaced.replace('|', "\\|")
}
