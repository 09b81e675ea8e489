//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Run as worker process (internal use)
    #[arg(long, hide = true)]
    pub worker: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run tasks through a worker pool and print their final state
    Run {
        /// Registered task type
        #[arg(long, value_name = "TYPE")]
        task_type: String,

        /// JSON options for the task (example: --options-json='{"millis":500}')
        #[arg(long, value_name = "JSON", default_value = "{}")]
        options_json: String,

        /// Number of task instances to submit
        #[arg(long, value_name = "N", default_value_t = 1)]
        count: usize,
    },

    /// Supervise a service task until interrupted
    Service {
        /// Registered service task type
        #[arg(long, value_name = "TYPE")]
        task_type: String,

        /// JSON options for the service
        #[arg(long, value_name = "JSON", default_value = "{}")]
        options_json: String,

        /// Service identifier
        #[arg(long, value_name = "ID")]
        id: Option<String>,
    },

    /// List the task types this binary can run
    Tasks,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Generate a sample configuration file
    Generate {
        /// Output file path
        #[arg(long, value_name = "PATH")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration in use
    Show {
        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::parse_from(["foreman", "run", "--task-type", "sleep", "--count", "2"]);
        match cli.command {
            Some(Commands::Run {
                task_type,
                options_json,
                count,
            }) => {
                assert_eq!(task_type, "sleep");
                assert_eq!(options_json, "{}");
                assert_eq!(count, 2);
            }
            _ => panic!("expected run command"),
        }
        assert!(!cli.worker);
    }

    #[test]
    fn test_worker_flag() {
        let cli = Cli::parse_from(["foreman", "--worker"]);
        assert!(cli.worker);
        assert!(cli.command.is_none());
    }
}
