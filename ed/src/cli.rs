//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::link::get_socket_path;

/// EDDI - event distribution daemon
#[derive(Parser)]
#[command(
    name = "eddi",
    about = "Event distribution daemon: mailboxes, filters and a socket hub for typed text events",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    pub foreground: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the hub that relays frames between processes
    Serve {
        /// Hub socket path
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Run a dispatcher connected to the hub and print the events it receives
    Run {
        /// Hub socket path
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Filter file applied by the dispatcher
        #[arg(short, long)]
        filter: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Send events to the hub
    Send {
        /// Hub socket path
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Events in wire form; read from stdin when none are given
        events: Vec<String>,
    },

    /// Parse events and print them in canonical form
    Parse {
        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: OutputFormat,

        /// Events in wire form; read from stdin when none are given
        events: Vec<String>,
    },

    /// Compile a filter file and report its rules
    Check {
        /// Filter file
        file: PathBuf,

        /// Fail on any malformed rule instead of skipping it
        #[arg(long)]
        strict: bool,
    },

    /// Run events through a filter file and print the outcomes
    Filter {
        /// Filter file
        file: PathBuf,

        /// Use the [out] section instead of [in]
        #[arg(long)]
        out: bool,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: OutputFormat,

        /// Events in wire form; read from stdin when none are given
        events: Vec<String>,
    },
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eddi")
        .join("logs")
        .join("eddi.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Generate the after_help text with the default paths
pub fn generate_after_help() -> String {
    let mut help = String::new();
    help.push_str(&format!("Hub socket: {}\n", get_socket_path().display()));
    help.push_str(&format!("Logs are written to: {}\n", get_log_path().display()));
    help
}

/// Output format for commands that print events
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => {
                debug!("OutputFormat::from_str: matched Text");
                Ok(Self::Text)
            }
            "json" => {
                debug!("OutputFormat::from_str: matched Json");
                Ok(Self::Json)
            }
            _ => {
                debug!(%s, "OutputFormat::from_str: unknown format");
                Err(format!("Unknown format: {}. Use: text or json", s))
            }
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("plain".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert!("table".parse::<OutputFormat>().is_err());
        assert_eq!(OutputFormat::Json.to_string(), "json");
    }

    #[test]
    fn test_parse_send_command() {
        let cli = Cli::try_parse_from(["eddi", "-l", "debug", "send", "--socket", "/tmp/x.sock", "* ping::{}"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Send { socket, events } => {
                assert_eq!(socket, Some(PathBuf::from("/tmp/x.sock")));
                assert_eq!(events, vec!["* ping::{}".to_string()]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_log_path_under_eddi() {
        assert!(get_log_path().ends_with("eddi/logs/eddi.log"));
    }
}
