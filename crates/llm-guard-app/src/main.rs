//! LLM Guard - content safety checks for language model traffic.
//!
//! Thin command line front end over `llm-guard-core`:
//! - `check` runs the full pipeline and prints the verdict
//! - `redact` replaces PII with placeholders
//! - `injection` prints the prompt-injection assessment
//! - `rules` lists the custom rules loaded from the config
//!
//! Results go to stdout as JSON; logs go to stderr and optionally a file.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use llm_guard_core::{DetectorKind, GuardConfig, SafetyGuard};
use serde_json::json;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// LLM Guard - local content safety checks for LLM input and output
#[derive(Parser, Debug)]
#[command(name = "llm-guard", version, about)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Also write logs to daily files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every enabled detector and print the verdict
    Check {
        /// Text to check (reads stdin when omitted)
        text: Option<String>,

        /// Include redacted text in the output
        #[arg(long)]
        redact: bool,

        /// Only run these detectors (toxicity, pii, injection)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },
    /// Replace PII with [LABEL] placeholders
    Redact {
        /// Text to redact (reads stdin when omitted)
        text: Option<String>,

        /// Replacement for one label, e.g. --label SSN=***
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },
    /// Assess text for prompt injection
    Injection {
        /// Text to assess (reads stdin when omitted)
        text: Option<String>,
    },
    /// List the configured custom rules
    Rules,
}

/// Initialize logging. Console output goes to stderr so stdout stays JSON.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("llm_guard={},warn", args.log_level)));

    if let Some(log_dir) = &args.log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("llm-guard")
                .filename_suffix("log")
                .build(log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        tracing::warn!("File logging unavailable, using console only");
        return None;
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GuardConfig> {
    match path {
        Some(path) => GuardConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(GuardConfig::default()),
    }
}

/// Returns the argument, or all of stdin when it is missing.
fn input_text(text: Option<String>) -> anyhow::Result<String> {
    match text {
        Some(text) => Ok(text),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read text from stdin")?;
            Ok(buf.trim_end_matches(['\r', '\n']).to_string())
        }
    }
}

fn parse_kinds(names: &[String]) -> anyhow::Result<Vec<DetectorKind>> {
    names
        .iter()
        .map(|name| {
            DetectorKind::all()
                .iter()
                .copied()
                .find(|kind| kind.name() == name.trim().to_ascii_lowercase())
                .with_context(|| format!("Unknown detector: {name}"))
        })
        .collect()
}

fn parse_label(arg: &str) -> Result<(String, String), String> {
    let (label, replacement) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected LABEL=REPLACEMENT, got {arg:?}"))?;
    Ok((label.trim().to_ascii_uppercase(), replacement.to_string()))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args);

    let mut config = load_config(args.config.as_deref())?;
    if let Command::Check { redact: true, .. } = args.command {
        config.redact_on_check = true;
    }
    let guard = SafetyGuard::new(config).context("Failed to build guard")?;
    tracing::debug!(rules = guard.rules().len(), "Guard ready");

    match args.command {
        Command::Check { text, only, .. } => {
            let text = input_text(text)?;
            let result = if only.is_empty() {
                guard.check(&text).await
            } else {
                guard.check_with(&text, &parse_kinds(&only)?).await
            };
            print_json(&result)?;
        }
        Command::Redact { text, labels } => {
            let text = input_text(text)?;
            let labels: BTreeMap<String, String> = labels.into_iter().collect();
            print_json(&json!({ "redacted_text": guard.redact_pii_with(&text, &labels) }))?;
        }
        Command::Injection { text } => {
            let text = input_text(text)?;
            let assessment = guard.assess_injection(&text);
            print_json(&json!({
                "is_injection": assessment.is_injection,
                "confidence": assessment.confidence,
                "techniques": assessment
                    .techniques
                    .iter()
                    .map(|t| t.description())
                    .collect::<Vec<_>>(),
            }))?;
        }
        Command::Rules => {
            print_json(&guard.export_config().rules)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_subcommands() {
        let args = Args::parse_from([
            "llm-guard",
            "check",
            "hello",
            "--redact",
            "--only",
            "pii,toxicity",
        ]);
        match args.command {
            Command::Check { text, redact, only } => {
                assert_eq!(text.as_deref(), Some("hello"));
                assert!(redact);
                assert_eq!(only, vec!["pii", "toxicity"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let args = Args::parse_from(["llm-guard", "redact", "x", "--config", "guard.json"]);
        assert_eq!(args.config, Some(PathBuf::from("guard.json")));
    }

    #[test]
    fn redact_accepts_label_overrides() {
        let args = Args::parse_from(["llm-guard", "redact", "x", "--label", "ssn=***"]);
        match args.command {
            Command::Redact { labels, .. } => {
                assert_eq!(labels, vec![("SSN".to_string(), "***".to_string())]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(parse_label("missing-separator").is_err());
    }

    #[test]
    fn parse_kinds_accepts_names() {
        let kinds = parse_kinds(&["PII".to_string(), " injection".to_string()]).unwrap();
        assert_eq!(kinds, vec![DetectorKind::Pii, DetectorKind::Injection]);
        assert!(parse_kinds(&["nope".to_string()]).is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.json");
        std::fs::write(&path, r#"{"redact_on_check": true}"#).unwrap();
        assert!(load_config(Some(path.as_path())).unwrap().redact_on_check);
        assert!(load_config(Some(dir.path().join("missing.json").as_path())).is_err());
        assert_eq!(load_config(None).unwrap(), GuardConfig::default());
    }
}
