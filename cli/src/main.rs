use anyhow::{anyhow, Context as _};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use flowprobe_core::{
    validate_suite, Diagnostic, DiagnosticLevel, Orchestrator, Report, ReportFormat,
    ReqwestTransport, RunConfig, Suite, SuiteDefinition, SuiteFile,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "Run stateful API workflow suites against a live service")]
struct FlowprobeCli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate suite files, then print their execution plan
    Plan {
        /// Suite files (YAML or JSON)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Output JSON instead of a human-readable summary
        #[arg(long)]
        json: bool,
    },
    /// Execute suites against the target and report outcomes
    Run {
        /// Suite files (YAML or JSON)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Base URL of the service under test
        #[arg(long)]
        base_url: Option<String>,
        /// Run configuration file (YAML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Set a template variable (format: key=value). Repeat for multiple.
        #[arg(long = "var", value_parser = parse_key_val, value_name = "KEY=VALUE", action = ArgAction::Append)]
        vars: Vec<(String, String)>,
        /// Set a secret (format: key=value). Repeat for multiple.
        #[arg(long = "secret", value_parser = parse_key_val, value_name = "KEY=VALUE", action = ArgAction::Append)]
        secrets: Vec<(String, String)>,
        /// Run consecutive independent steps concurrently
        #[arg(long)]
        parallel: bool,
        /// Run suites concurrently, each with its own session
        #[arg(long)]
        concurrent_suites: bool,
        /// Mark a step critical (`step` or `suite/step`). Repeat for multiple.
        #[arg(long = "critical", value_name = "STEP", action = ArgAction::Append)]
        critical: Vec<String>,
        /// Report format
        #[arg(long, value_enum, default_value_t = Format::Console)]
        format: Format,
        /// Shorthand for --format json
        #[arg(long)]
        json: bool,
        /// Write the report to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Console,
    Markdown,
    Json,
}

impl From<Format> for ReportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Console => ReportFormat::Console,
            Format::Markdown => ReportFormat::Markdown,
            Format::Json => ReportFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = FlowprobeCli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Plan { inputs, json } => {
            let definitions = load_definitions(&inputs)?;
            let has_errors = output_plan(&definitions, json)?;
            if has_errors {
                anyhow::bail!("validation failed");
            }
        }
        Command::Run {
            inputs,
            base_url,
            config,
            vars,
            secrets,
            parallel,
            concurrent_suites,
            critical,
            format,
            json,
            output,
        } => {
            let mut run_config = load_config(config.as_deref())?;
            if let Some(base_url) = base_url {
                run_config.base_url = base_url;
            }
            if run_config.base_url.trim().is_empty() {
                anyhow::bail!("no base url: pass --base-url or set base_url in the config file");
            }
            run_config.variables.extend(vars);
            run_config.secrets.extend(secrets);
            run_config.parallel |= parallel;
            run_config.concurrent_suites |= concurrent_suites;
            run_config.critical_steps.extend(critical);

            let suites = build_suites(load_definitions(&inputs)?)?;
            let transport = ReqwestTransport::new()?;
            let orchestrator = Orchestrator::new(run_config, Arc::new(transport))?;

            let cancel = orchestrator.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling remaining steps");
                    cancel.cancel();
                }
            });

            info!(
                suites = suites.len(),
                base_url = %orchestrator.config().base_url,
                "starting run"
            );
            let runs = orchestrator.run_all(&suites).await;
            let report = Report::from_runs(&runs);

            let format = if json { Format::Json } else { format };
            let rendered = ReportFormat::from(format).renderer().render(&report)?;
            match output {
                Some(path) => {
                    fs::write(&path, rendered)
                        .with_context(|| format!("failed to write report to {}", path.display()))?;
                    println!("Report written to {}", path.display());
                }
                None => print!("{rendered}"),
            }

            let issues = report.critical_issues();
            if !issues.is_empty() {
                anyhow::bail!("{} critical issue(s) detected", issues.len());
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// YAML is read into a JSON value first so enum fields such as
/// `expect: { must_fail: 400 }` follow the same representation in both formats.
fn parse_document<T: DeserializeOwned>(path: &Path, content: &str) -> anyhow::Result<T> {
    let value: serde_json::Value = if is_json(path) {
        serde_json::from_str(content)?
    } else {
        serde_yaml::from_str(content)?
    };
    Ok(serde_json::from_value(value)?)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RunConfig> {
    let Some(path) = path else {
        return Ok(RunConfig::new(""));
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_document(path, &content).with_context(|| format!("invalid config {}", path.display()))
}

fn load_definitions(inputs: &[PathBuf]) -> anyhow::Result<Vec<SuiteDefinition>> {
    let mut definitions = Vec::new();
    for input in inputs {
        let canonical = fs::canonicalize(input)
            .with_context(|| format!("suite file {} not found", input.display()))?;
        let content = fs::read_to_string(&canonical)?;
        let file: SuiteFile = parse_document(&canonical, &content)
            .map_err(|err| anyhow!("{}: {err}", input.display()))?;
        let base_dir = canonical.parent().unwrap_or_else(|| Path::new(""));
        for mut definition in file.suites {
            definition.rebase_files(base_dir);
            definitions.push(definition);
        }
    }
    Ok(definitions)
}

fn build_suites(definitions: Vec<SuiteDefinition>) -> anyhow::Result<Vec<Suite>> {
    let mut suites = Vec::with_capacity(definitions.len());
    let mut failed = false;
    for definition in definitions {
        match Suite::new(definition) {
            Ok(suite) => suites.push(suite),
            Err(err) => {
                eprintln!("Suite '{}' is invalid:", err.suite);
                print_diagnostics(&err.diagnostics);
                failed = true;
            }
        }
    }
    if failed {
        anyhow::bail!("validation failed");
    }
    Ok(suites)
}

fn output_plan(definitions: &[SuiteDefinition], json: bool) -> anyhow::Result<bool> {
    let diagnostics: Vec<Vec<Diagnostic>> = definitions.iter().map(validate_suite).collect();
    let has_errors = diagnostics.iter().flatten().any(Diagnostic::is_error);

    if json {
        let suites: Vec<_> = definitions
            .iter()
            .zip(&diagnostics)
            .map(|(definition, found)| {
                json!({
                    "summary": definition.summary(),
                    "diagnostics": found,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json!({ "suites": suites }))?);
    } else {
        for (definition, found) in definitions.iter().zip(&diagnostics) {
            print_diagnostics(found);
            println!("{}", definition.summary());
        }
    }

    Ok(has_errors)
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }

    println!("Diagnostics:");
    for diagnostic in diagnostics {
        let level = match diagnostic.level {
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Warning => "warn",
        };
        match &diagnostic.location {
            Some(location) => println!("  - [{level}] {location}: {}", diagnostic.message),
            None => println!("  - [{level}] {}", diagnostic.message),
        }
    }
    println!();
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 || parts[0].trim().is_empty() {
        return Err(format!("expected KEY=VALUE, got '{s}'"));
    }
    Ok((parts[0].trim().to_string(), parts[1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_val_splits_on_first_equals() {
        assert_eq!(
            parse_key_val("token=a=b"),
            Ok(("token".to_string(), "a=b".to_string()))
        );
        assert!(parse_key_val("=value").is_err());
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn yaml_config_uses_json_enum_representation() {
        let content = "base_url: http://localhost:3000\nauth:\n  policy: abort\nretry:\n  max_retries: 0\n";
        let config: RunConfig =
            parse_document(Path::new("run.yaml"), content).expect("config parses");
        assert_eq!(config.base_url, "http://localhost:3000");
        assert_eq!(config.auth.policy, flowprobe_core::AuthPolicy::Abort);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.retry.backoff_ms, 250);
    }

    #[test]
    fn bundled_suites_load_and_validate() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../suites/interview_platform.yaml");
        let definitions = load_definitions(&[path]).expect("bundled suites parse");
        assert!(!definitions.is_empty());
        for definition in &definitions {
            let errors: Vec<_> = validate_suite(definition)
                .into_iter()
                .filter(Diagnostic::is_error)
                .collect();
            assert!(errors.is_empty(), "{}: {errors:?}", definition.name);
        }

        let step_ids = |suite: &str| -> Vec<String> {
            definitions
                .iter()
                .find(|definition| definition.name == suite)
                .map(|definition| definition.steps.iter().map(|step| step.id.clone()).collect())
                .unwrap_or_default()
        };
        assert!(step_ids("smoke").contains(&"auth_providers".to_string()));
        assert!(step_ids("unauthenticated").contains(&"ats_analysis_anonymous".to_string()));
        assert_eq!(
            step_ids("resume_analysis"),
            vec!["register", "login", "ats_analysis", "analysis_history"]
        );
    }
}
