//! CLI argument parsing for insntrace

use std::path::PathBuf;

use clap::Parser;

use crate::config::TracerConfig;

#[derive(Parser, Debug)]
#[command(name = "insntrace")]
#[command(version)]
#[command(
    about = "Instruction-level execution tracer writing replayable binary traces",
    long_about = None
)]
pub struct Cli {
    /// Directory under which the trace root `<app>-<pid>` is created
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Load tracer settings from a TOML file (flags override it)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Buffer capacity in records, applied to every stream
    #[arg(long = "buffer-records", value_name = "N")]
    pub buffer_records: Option<usize>,

    /// Maximum instructions recorded per translated block
    #[arg(long = "max-block-insns", value_name = "N")]
    pub max_block_insns: Option<usize>,

    /// Do not copy /proc/<pid>/maps into each session
    #[arg(long = "no-proc-map")]
    pub no_proc_map: bool,

    /// Dump registers and pointed-to memory after every instruction (needs --debug)
    #[arg(long = "log-registers")]
    pub log_registers: bool,

    /// Do not trace child processes
    #[arg(long = "no-follow-forks")]
    pub no_follow_forks: bool,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Command to trace (everything after --)
    #[arg(last = true)]
    pub command: Option<Vec<String>>,
}

impl Cli {
    /// Apply command-line overrides on top of `config`
    pub fn apply(&self, mut config: TracerConfig) -> TracerConfig {
        if let Some(dir) = &self.output_dir {
            config = config.with_output_dir(dir.clone());
        }
        if let Some(records) = self.buffer_records {
            config = config.with_buffer_records(records);
        }
        if let Some(limit) = self.max_block_insns {
            config.max_block_instructions = limit;
        }
        if self.no_proc_map {
            config.capture_proc_map = false;
        }
        if self.log_registers {
            config.log_registers = true;
        }
        if self.no_follow_forks {
            config.follow_forks = false;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_command() {
        let cli = Cli::parse_from(["insntrace", "--", "echo", "hello"]);
        assert!(cli.command.is_some());
        let cmd = cli.command.unwrap();
        assert_eq!(cmd[0], "echo");
        assert_eq!(cmd[1], "hello");
    }

    #[test]
    fn test_cli_empty_without_command() {
        let cli = Cli::parse_from(["insntrace"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_defaults_leave_config_untouched() {
        let cli = Cli::parse_from(["insntrace", "--", "true"]);
        let config = cli.apply(TracerConfig::default());
        assert_eq!(config, TracerConfig::default());
    }

    #[test]
    fn test_cli_buffer_records_overrides_every_stream() {
        let cli = Cli::parse_from(["insntrace", "--buffer-records", "64", "--", "true"]);
        let config = cli.apply(TracerConfig::default());
        assert_eq!(config.insn_buffer_records, 64);
        assert_eq!(config.regfile_buffer_records, 64);
        assert_eq!(config.memref_buffer_records, 64);
        assert_eq!(config.memfile_buffer_records, 64);
    }

    #[test]
    fn test_cli_switches() {
        let cli = Cli::parse_from([
            "insntrace",
            "-o",
            "/tmp/traces",
            "--max-block-insns",
            "32",
            "--no-proc-map",
            "--log-registers",
            "--no-follow-forks",
            "--",
            "ls",
        ]);
        let config = cli.apply(TracerConfig::default());
        assert_eq!(config.output_dir, PathBuf::from("/tmp/traces"));
        assert_eq!(config.max_block_instructions, 32);
        assert!(!config.capture_proc_map);
        assert!(config.log_registers);
        assert!(!config.follow_forks);
    }

    #[test]
    fn test_cli_debug_default_false() {
        let cli = Cli::parse_from(["insntrace", "--", "true"]);
        assert!(!cli.debug);
    }
}
