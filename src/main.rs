//! iprocess - worker process demo and tooling.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use iprocess::demo::Calculator;
use iprocess::logging::{self, LogConfig};
use iprocess::{Worker, WorkerConfig};
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::json;
use std::time::Duration;
use tracing::Level;

use cli::{Cli, Commands, DemoArgs};

/// How long the demo worker lives if nobody stops it.
const DEMO_LIFETIME: Duration = Duration::from_secs(30);

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Demo(args) => cmd_demo(args),
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::default()
        .with_level(Level::WARN)
        .with_format(cli.log_format.into());
    match cli.verbose {
        0 => {}
        1 => config = config.with_filter("iprocess=debug"),
        _ => config = config.with_filter("iprocess=trace"),
    }
    logging::init(config.with_env_overrides());
}

/// Start a calculator worker, exercise it and print a JSON report.
fn cmd_demo(args: &DemoArgs) -> Result<()> {
    let config = WorkerConfig::default()
        .with_env_overrides()
        .threads(args.threads)
        .poll_interval(Duration::from_millis(args.poll_ms));

    let mut calculator = Calculator::new(DEMO_LIFETIME);
    if args.fail {
        calculator = calculator.failing();
    }
    let worker = Worker::new(calculator, config).context("Failed to create worker")?;
    worker.start().context("Failed to start worker")?;

    let mut results = Vec::new();
    for i in 0..args.calls {
        let sum = worker
            .call("add", vec![json!(i), json!(i)])
            .with_context(|| format!("add({i}, {i}) failed"))?;
        results.push(sum);
    }
    let count = worker.property("count")?;
    let interfaces = worker.interfaces()?;

    worker.call("stop", vec![])?;
    let termination = worker
        .join(Duration::from_secs(10))?
        .context("Worker did not exit after stop")?;

    let report = json!({
        "pid": worker.pid(),
        "results": results,
        "count": count,
        "interfaces": interfaces,
        "termination": termination.to_string(),
        "keepalive": worker.keepalive()?,
        "snapshot": worker.snapshot().as_deref(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
