//! Error types for trace capture and persistence
//!
//! Every fallible library operation returns [`Result`]. Conditions the
//! tracer cannot continue from (a trace directory that cannot be created, a
//! register file that cannot be read) are ordinary variants here; the host
//! driver decides to abort instrumentation when it sees them.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::records::Stream;

/// Errors that can occur while capturing or persisting a trace
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Unable to create trace directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unable to open trace file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {stream} records: {source}")]
    Write {
        stream: Stream,
        #[source]
        source: io::Error,
    },

    #[error("Channel capacity of {capacity} bytes cannot hold a single {record_size}-byte record")]
    CapacityTooSmall { capacity: usize, record_size: usize },

    #[error("Instruction at {pc:#x} is {length} bytes, the byte map holds at most {max}")]
    InstructionTooLong { pc: u64, length: usize, max: usize },

    #[error("Failed to capture register state: {0}")]
    RegisterCapture(String),

    #[error("Trace root is not initialized (no main thread has started)")]
    NotInitialized,

    #[error("Malformed trace file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for trace operations
pub type Result<T> = std::result::Result<T, TraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_names_stream() {
        let err = TraceError::Write {
            stream: Stream::MemFile,
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        };
        let msg = err.to_string();
        assert!(msg.contains("memfile.trace"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_instruction_too_long_formats_hex_pc() {
        let err = TraceError::InstructionTooLong {
            pc: 0x401000,
            length: 17,
            max: 16,
        };
        assert!(err.to_string().contains("0x401000"));
    }
}
