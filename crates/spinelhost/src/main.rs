mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "spinelhost", version, about = "Talk spinel to a radio co-processor")]
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
    match cmd::run(cli.command, format) {
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
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "spinelhost",
            "send",
            "spinel+hdlc+uart:///dev/ttyACM0",
            "--hex",
            "8102",
            "--wait",
        ])
        .expect("send args should parse");

        match cli.command {
            Command::Send(args) => {
                assert!(args.wait);
                assert_eq!(args.wait_timeout, "2s");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn send_requires_payload() {
        let err = Cli::try_parse_from(["spinelhost", "send", "spinel+hdlc+uart:///dev/ttyACM0"])
            .expect_err("missing --hex should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn parses_listen_with_global_format() {
        let cli = Cli::try_parse_from([
            "spinelhost",
            "listen",
            "spinel+cpc://cpcd_0?iid=1",
            "--count",
            "3",
            "--format",
            "json",
        ])
        .expect("listen args should parse");

        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.command, Command::Listen(ref args) if args.count == Some(3)));
    }
}
