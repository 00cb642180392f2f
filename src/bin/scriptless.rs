//! Scriptless runner CLI - execute a request collection once per test-data row.

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use scriptless::{
    load_collection, load_rows, PropagationRule, RunConfig, RunResult, Status,
};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Scriptless runner - data-driven API request chains.
#[derive(Parser, Debug)]
#[command(name = "scriptless", version, about)]
struct Cli {
    /// Collection file (JSON, YAML or Postman export).
    #[arg(short = 'c', long = "collection")]
    collection: PathBuf,

    /// Test data file: an array of flat row objects.
    #[arg(short = 'd', long = "data")]
    data: PathBuf,

    /// Run configuration file.
    #[arg(long = "config", env = "SCRIPTLESS_CONFIG")]
    config: Option<PathBuf>,

    /// Base URL joined onto relative request URLs.
    #[arg(short = 'b', long = "base-url", env = "SCRIPTLESS_BASE_URL")]
    base_url: Option<String>,

    /// Timeout in seconds per request.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Number of rows run at once.
    #[arg(long = "concurrency")]
    concurrency: Option<usize>,

    /// Send requests through a forwarding service.
    #[arg(long = "forward-url", env = "SCRIPTLESS_FORWARD_URL")]
    forward_url: Option<String>,

    /// Column holding the test case identifier.
    #[arg(long = "id-column")]
    id_column: Option<String>,

    /// Carry a response field into a header of later requests (FIELD=HEADER).
    #[arg(long = "propagate", value_parser = PropagationRule::parse)]
    propagate: Option<PropagationRule>,

    /// Also resolve response placeholders in header values.
    #[arg(long = "response-headers")]
    response_headers: bool,

    /// Directory to save the run report.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .try_init();
}

fn build_config(args: &Cli) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };

    if let Some(base_url) = &args.base_url {
        config.base_url = Some(base_url.clone());
    }
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(forward_url) = &args.forward_url {
        config.forward_url = Some(forward_url.clone());
    }
    if let Some(id_column) = &args.id_column {
        config.id_column = id_column.clone();
    }
    if let Some(rule) = &args.propagate {
        config.propagate = Some(rule.clone());
    }
    if args.response_headers {
        config.response_headers = true;
    }

    if config.concurrency == 0 {
        return Err(anyhow!("concurrency must be at least 1"));
    }
    Ok(config)
}

fn status_marker(status: Status) -> &'static str {
    match status {
        Status::Passed => "\x1b[32mPASS\x1b[0m",
        Status::Failed => "\x1b[31mFAIL\x1b[0m",
        Status::NotRun => "\x1b[33mSKIP\x1b[0m",
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(500) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

fn print_run_result(result: &RunResult, verbose: bool) {
    for row in &result.rows {
        info!(
            "{} test case: {} ({} ms)",
            status_marker(row.status),
            row.id,
            row.duration_ms
        );

        for log in &row.logs {
            let step_status = match log.status {
                Status::Passed => "\x1b[32m✓\x1b[0m",
                _ => "\x1b[31m✗\x1b[0m",
            };
            info!(
                "  {}. {} {} {} ({} ms)",
                log.position, step_status, log.method, log.name, log.duration_ms
            );

            if let Some(error) = &log.error {
                error!("     \x1b[31mError: {}\x1b[0m", truncate(error));
            }
            for warning in &log.warnings {
                warn!("     {}", warning);
            }

            if verbose {
                debug!("     Request: {} {}", log.method, log.modified_url);
                if let Some(body) = &log.body {
                    debug!("     Request body: {}", truncate(body));
                }
                if let Some(response) = &log.response {
                    if let Some(status) = response.status {
                        debug!("     Response: Status {}", status);
                    }
                    debug!("     Response body: {}", truncate(&response.body.to_string()));
                }
            }
        }

        if row.status == Status::NotRun {
            if let Some(error) = &row.error {
                warn!("  {}", error);
            }
        }
    }

    let summary = result.summary;
    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Not run: {}\n  Duration: {} ms",
        summary.total, summary.passed, summary.failed, summary.not_run, result.duration_ms
    );
}

fn render_text_report(result: &RunResult) -> String {
    let mut content = String::new();
    content.push_str(&format!(
        "Collection: {}\n",
        result.collection.as_deref().unwrap_or("<unnamed>")
    ));
    content.push_str(&format!("Started: {}\n", result.started_at));
    content.push_str(&format!("Duration: {} ms\n", result.duration_ms));
    content.push_str(&format!(
        "Total: {}  Passed: {}  Failed: {}  Not run: {}\n\n",
        result.summary.total,
        result.summary.passed,
        result.summary.failed,
        result.summary.not_run
    ));

    for row in &result.rows {
        content.push_str(&format!("{} ({})\n", row.id, row.status));
        if let Some(error) = &row.error {
            content.push_str(&format!("  Error: {error}\n"));
        }
        for log in &row.logs {
            content.push_str(&format!(
                "  {}. {} {} ({})\n",
                log.position, log.method, log.name, log.status
            ));
            content.push_str(&format!("     URL: {}\n", log.modified_url));
            if let Some(error) = &log.error {
                content.push_str(&format!("     Error: {error}\n"));
            }
            content.push_str(&format!("     Duration: {} ms\n", log.duration_ms));
        }
        content.push('\n');
    }
    content
}

fn save_run_report(
    result: &RunResult,
    report_dir: &Path,
    format: ReportFormat,
) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = result
        .collection
        .as_deref()
        .unwrap_or("run")
        .replace([' ', '/'], "_");

    let (extension, content) = match format {
        ReportFormat::Json => ("json", serde_json::to_string_pretty(result)?),
        ReportFormat::Yaml => ("yaml", result.to_yaml()?),
        ReportFormat::Text => ("txt", render_text_report(result)),
    };

    let file_path = report_dir.join(format!("{sanitized_name}-{timestamp}.{extension}"));
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let config = build_config(&args)?;
    let collection = load_collection(&args.collection)?;
    let rows = load_rows(&args.data)?;

    if collection.is_empty() {
        return Err(anyhow!(
            "Collection {} has no requests",
            args.collection.display()
        ));
    }

    let orchestrator = config.orchestrator();
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight requests");
            cancel.cancel();
        }
    });

    let result = orchestrator.run(&collection, &rows).await;
    print_run_result(&result, args.verbose);

    if let Some(dir) = &args.report_dir {
        match save_run_report(&result, dir, args.report_format) {
            Ok(path) => info!("Report saved: {}", path.display()),
            Err(e) => error!("Failed to save report: {}", e),
        }
    }

    if !result.success() {
        exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_is_a_no_op() {
        init_tracing(false);
        init_tracing(true);
        assert!(tracing::dispatcher::has_been_set());
    }

    #[test]
    fn test_flags_override_config() {
        let args = Cli::parse_from([
            "scriptless",
            "-c",
            "collection.json",
            "-d",
            "rows.json",
            "--timeout",
            "9",
            "--propagate",
            "operationToken=Operation-Token",
            "--response-headers",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.timeout, 9);
        assert!(config.response_headers);
        assert_eq!(config.propagate.unwrap().header, "Operation-Token");
        assert_eq!(config.concurrency, 1);

        let args = Cli::parse_from([
            "scriptless", "-c", "c.json", "-d", "d.json", "--concurrency", "0",
        ]);
        assert!(build_config(&args).is_err());
    }
}
