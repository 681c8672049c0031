//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use iprocess::logging::LogFormat;

/// Run objects in worker processes and call into them.
#[derive(Parser, Debug)]
#[command(name = "iprocess")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format.
    #[arg(long, value_enum, env = "IPROCESS_LOG_FORMAT", default_value_t = LogFormatArg::Compact, global = true)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a calculator worker, call it, and print what happened as JSON.
    Demo(DemoArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the demo command.
#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Number of request loops in the worker.
    #[arg(short, long, env = "IPROCESS_THREADS", default_value_t = 2)]
    pub threads: usize,

    /// Number of `add` calls to make.
    #[arg(short, long, default_value_t = 3)]
    pub calls: u32,

    /// Make the worker's main routine fail.
    #[arg(long)]
    pub fail: bool,

    /// Liveness poll interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub poll_ms: u64,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(self.shell, &mut Cli::command(), "iprocess", &mut std::io::stdout());
    }
}

/// Log format as a CLI value.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_demo_defaults() {
        let cli = Cli::try_parse_from(["iprocess", "demo"]).unwrap();
        let Commands::Demo(args) = cli.command else {
            panic!("expected demo command");
        };
        assert_eq!(args.calls, 3);
        assert!(!args.fail);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_demo_flags() {
        let cli = Cli::try_parse_from(["iprocess", "demo", "--calls", "5", "--fail", "-t", "4", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Demo(args) = cli.command else {
            panic!("expected demo command");
        };
        assert_eq!(args.calls, 5);
        assert_eq!(args.threads, 4);
        assert!(args.fail);
    }
}
