//! `hostprobe` CLI
//!
//! Runs the probe catalog (or the probes from config) against the local host
//! through one persistent shell and prints the collected output as JSON.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use hostprobe_core::config::load_config;
use hostprobe_core::tracing_init::init_tracing;
use hostprobe_core::{Config, DeadlinePolicy, ProbeSpec, ShellDialect};
use hostprobe_exec::{
    BatchReport, BatchScheduler, ChannelConfig, EphemeralRunner, LocalExecutor, RetryPolicy,
    RetryingInvoker, SchedulerConfig, ShellChannel, build_tasks, default_probes,
};

/// Exit code when the global deadline fails the batch.
const EXIT_DEADLINE: u8 = 2;
/// Exit code when the batch was interrupted.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "hostprobe")]
#[command(version, about = "hostprobe - collect host telemetry through a multiplexed shell")]
struct Args {
    /// Directory whose `.hostprobe/settings.json` is layered over the global config
    #[arg(long, env = "HOSTPROBE_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Maximum probes running at once
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Per-probe timeout in milliseconds
    #[arg(long)]
    task_timeout_ms: Option<u64>,

    /// Deadline for the whole batch in milliseconds
    #[arg(long)]
    global_deadline_ms: Option<u64>,

    /// What to do when the global deadline passes (abandon, fail, wait)
    #[arg(long)]
    deadline_policy: Option<DeadlinePolicy>,

    /// Retries after an empty result
    #[arg(long)]
    max_retries: Option<u32>,

    /// Delay between retries in milliseconds
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Shell dialect (posix, powershell)
    #[arg(long)]
    shell: Option<ShellDialect>,

    /// Shell binary to spawn
    #[arg(long)]
    shell_program: Option<PathBuf>,

    /// Spawn one shell per probe instead of a persistent shell.
    #[arg(long, env = "HOSTPROBE_EPHEMERAL")]
    ephemeral: bool,

    /// Only run the named probe (repeatable).
    #[arg(long = "probe", value_name = "NAME")]
    probes: Vec<String>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "HOSTPROBE_LOG_JSON")]
    log_json: bool,

    /// Pretty-print the JSON document.
    #[arg(long)]
    pretty: bool,
}

impl Args {
    /// Flags win over every config layer.
    fn apply_to(&self, config: &mut Config) {
        if let Some(n) = self.max_concurrency {
            config.scheduler.max_concurrency = n;
        }
        if let Some(ms) = self.task_timeout_ms {
            config.scheduler.task_timeout_ms = ms;
        }
        if let Some(ms) = self.global_deadline_ms {
            config.scheduler.global_deadline_ms = ms;
        }
        if let Some(policy) = self.deadline_policy {
            config.scheduler.deadline_policy = policy;
        }
        if let Some(n) = self.max_retries {
            config.retry.max_retries = n;
        }
        if let Some(ms) = self.retry_delay_ms {
            config.retry.delay_ms = ms;
        }
        if let Some(dialect) = self.shell {
            config.shell.dialect = dialect;
        }
        if let Some(program) = &self.shell_program {
            config.shell.program = Some(program.clone());
        }
        if self.ephemeral {
            config.shell.persistent = false;
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

/// Probes from config, or the built-in catalog, narrowed to `only` when given.
fn select_probes(config: &Config, only: &[String]) -> anyhow::Result<Vec<ProbeSpec>> {
    let probes = if config.probes.is_empty() {
        default_probes(config.shell.dialect)
    } else {
        config.probes.clone()
    };
    if only.is_empty() {
        return Ok(probes);
    }

    if let Some(unknown) = only.iter().find(|name| !probes.iter().any(|p| &p.name == *name)) {
        let known: Vec<&str> = probes.iter().map(|p| p.name.as_str()).collect();
        anyhow::bail!("Unknown probe '{unknown}' (available: {})", known.join(", "));
    }
    Ok(probes
        .into_iter()
        .filter(|p| only.contains(&p.name))
        .collect())
}

/// `{"results": {key: text|null}, "summary": {...}}`
fn render(report: BatchReport<String>) -> serde_json::Value {
    let summary = report.summary();
    serde_json::json!({
        "results": report.into_map(),
        "summary": summary,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let mut config = load_config(args.project_dir.as_deref())?;
    args.apply_to(&mut config);
    config.validate()?;

    init_tracing(&config.logging);

    let probes = select_probes(&config, &args.probes)?;
    info!(
        probes = probes.len(),
        dialect = ?config.shell.dialect,
        persistent = config.shell.persistent,
        "Starting hostprobe"
    );

    let channel_config = ChannelConfig::from(&config.shell);
    let channel = Arc::new(ShellChannel::new(channel_config.clone()));
    if config.shell.persistent {
        if let Err(e) = channel.start().await {
            warn!(error = %e, "Persistent shell unavailable; using one shell per probe");
        }
    }
    let executor = Arc::new(LocalExecutor::new(
        Arc::clone(&channel),
        EphemeralRunner::from_config(&channel_config),
    ));

    let invoker = RetryingInvoker::new(RetryPolicy::from(&config.retry));
    let scheduler = BatchScheduler::new(SchedulerConfig::from(&config.scheduler));

    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; abandoning unfinished probes");
            cancel.cancel();
        }
    });

    let outcome = scheduler.run(build_tasks(&probes, &executor, invoker)).await;
    channel.stop().await?;

    let (report, mut code) = match outcome {
        Ok(report) => (report, ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "Batch failed");
            (e.into_report(), ExitCode::from(EXIT_DEADLINE))
        }
    };
    if report.cancelled {
        code = ExitCode::from(EXIT_INTERRUPTED);
    }

    let document = render(report);
    let mut out = io::stdout().lock();
    if args.pretty {
        serde_json::to_writer_pretty(&mut out, &document)?;
    } else {
        serde_json::to_writer(&mut out, &document)?;
    }
    writeln!(out)?;

    Ok(code)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("hostprobe").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_config() {
        let args = parse(&[
            "--max-concurrency",
            "3",
            "--task-timeout-ms",
            "750",
            "--deadline-policy",
            "fail",
            "--shell",
            "pwsh",
            "--ephemeral",
            "--log-level",
            "debug",
        ]);
        let mut config = Config::default();
        args.apply_to(&mut config);

        assert_eq!(config.scheduler.max_concurrency, 3);
        assert_eq!(config.scheduler.task_timeout_ms, 750);
        assert_eq!(config.scheduler.deadline_policy, DeadlinePolicy::Fail);
        assert_eq!(config.shell.dialect, ShellDialect::PowerShell);
        assert!(!config.shell.persistent);
        assert_eq!(config.logging.level, "debug");
        config.validate().unwrap();
    }

    #[test]
    fn no_flags_leave_config_untouched() {
        let mut config = Config::default();
        parse(&[]).apply_to(&mut config);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn bad_policy_is_rejected() {
        assert!(
            Args::try_parse_from(["hostprobe", "--deadline-policy", "explode"]).is_err()
        );
    }

    #[test]
    fn default_catalog_when_config_has_no_probes() {
        let probes = select_probes(&Config::default(), &[]).unwrap();
        assert_eq!(probes.len(), default_probes(ShellDialect::Posix).len());
    }

    #[test]
    fn probe_filter_keeps_named_probes() {
        let only = vec!["kernel".to_string(), "hostname".to_string()];
        let probes = select_probes(&Config::default(), &only).unwrap();
        let names: Vec<&str> = probes.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["hostname", "kernel"]);
    }

    #[test]
    fn unknown_probe_is_an_error() {
        let err = select_probes(&Config::default(), &["gpu".to_string()]).unwrap_err();
        assert!(err.to_string().contains("Unknown probe 'gpu'"));
    }

    #[test]
    fn configured_probes_replace_catalog() {
        let config = Config {
            probes: vec![ProbeSpec::new("custom", "echo hi")],
            ..Config::default()
        };
        let probes = select_probes(&config, &[]).unwrap();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].name, "custom");
    }

    #[tokio::test]
    async fn rendered_document_has_results_and_summary() {
        let tasks = build_tasks(
            &[ProbeSpec::new("greeting", "echo hi")],
            &Arc::new(Canned),
            RetryingInvoker::default(),
        );
        let report = BatchScheduler::new(SchedulerConfig::default())
            .run(tasks)
            .await
            .unwrap();

        let doc = render(report);
        assert_eq!(doc["results"]["greeting"], "hi\n");
        assert_eq!(doc["summary"]["succeeded"][0], "greeting");
        assert_eq!(doc["summary"]["deadline_exceeded"], false);
    }

    struct Canned;

    impl hostprobe_exec::CommandRunner for Canned {
        async fn run(&self, _command: &str) -> Result<String, hostprobe_exec::ExecError> {
            Ok("hi\n".to_string())
        }
    }
}
