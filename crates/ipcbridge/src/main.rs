mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "ipcbridge", version, about = "Remote method bridge CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_subcommand() {
        let cli = Cli::try_parse_from(["ipcbridge", "manifest", "api.json"])
            .expect("manifest args should parse");
        assert!(matches!(cli.command, Command::Manifest(_)));
    }

    #[test]
    fn parses_demo_with_timeout() {
        let cli = Cli::try_parse_from(["ipcbridge", "--format", "json", "demo", "--timeout", "250ms"])
            .expect("demo args should parse");
        match cli.command {
            Command::Demo(args) => assert_eq!(args.timeout, "250ms"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn manifest_requires_a_file() {
        let err = Cli::try_parse_from(["ipcbridge", "manifest"])
            .expect_err("missing file should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
