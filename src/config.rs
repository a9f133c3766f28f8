//! Tracer configuration
//!
//! Defaults match the buffer sizes the trace format was designed around:
//! 8192 records per stream per thread and at most 128 instructions recorded
//! per translated block. A TOML file may override any subset of fields.
//!
//! ```toml
//! output_dir = "/tmp/traces"
//! regfile_buffer_records = 1024
//! log_registers = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TraceError};

/// Configuration for a tracing run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Directory the trace root is created in
    pub output_dir: PathBuf,

    /// Per-thread buffer capacity, in records, of `insn.trace`
    pub insn_buffer_records: usize,

    /// Per-thread buffer capacity, in records, of `regfile.trace`
    pub regfile_buffer_records: usize,

    /// Per-thread buffer capacity, in records, of `memrefs.trace`
    pub memref_buffer_records: usize,

    /// Per-thread buffer capacity, in records, of `memfile.trace`
    pub memfile_buffer_records: usize,

    /// Instructions recorded in `insn.bytemap` per translated block
    pub max_block_instructions: usize,

    /// Copy `/proc/<pid>/maps` into each session
    pub capture_proc_map: bool,

    /// Dump registers and the memory they point to after every instruction
    pub log_registers: bool,

    /// Trace child processes
    pub follow_forks: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            insn_buffer_records: 8192,
            regfile_buffer_records: 8192,
            memref_buffer_records: 8192,
            memfile_buffer_records: 8192,
            max_block_instructions: 128,
            capture_proc_map: true,
            log_registers: false,
            follow_forks: true,
        }
    }
}

impl TracerConfig {
    /// Load a configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| TraceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set every stream's buffer to `records` records
    pub fn with_buffer_records(mut self, records: usize) -> Self {
        self.insn_buffer_records = records;
        self.regfile_buffer_records = records;
        self.memref_buffer_records = records;
        self.memfile_buffer_records = records;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Reject sizes that cannot hold a single record
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("insn_buffer_records", self.insn_buffer_records),
            ("regfile_buffer_records", self.regfile_buffer_records),
            ("memref_buffer_records", self.memref_buffer_records),
            ("memfile_buffer_records", self.memfile_buffer_records),
            ("max_block_instructions", self.max_block_instructions),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(TraceError::Config(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TracerConfig::default();
        assert_eq!(config.insn_buffer_records, 8192);
        assert_eq!(config.max_block_instructions, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TracerConfig::from_toml_str(
            r#"
            output_dir = "/tmp/traces"
            regfile_buffer_records = 16
            log_registers = true
            "#,
        )
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/traces"));
        assert_eq!(config.regfile_buffer_records, 16);
        assert_eq!(config.memfile_buffer_records, 8192);
        assert!(config.log_registers);
        assert!(config.capture_proc_map);
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let err = TracerConfig::from_toml_str("memfile_buffer_records = 0").unwrap_err();
        assert!(err.to_string().contains("memfile_buffer_records"));
    }

    #[test]
    fn test_unknown_types_rejected() {
        let err = TracerConfig::from_toml_str("log_registers = \"yes\"").unwrap_err();
        assert!(matches!(err, TraceError::Config(_)));
    }

    #[test]
    fn test_with_buffer_records_sets_all_streams() {
        let config = TracerConfig::default().with_buffer_records(4);
        assert_eq!(config.insn_buffer_records, 4);
        assert_eq!(config.regfile_buffer_records, 4);
        assert_eq!(config.memref_buffer_records, 4);
        assert_eq!(config.memfile_buffer_records, 4);
    }
}
