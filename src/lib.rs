//! insntrace - instruction-level execution tracer
//!
//! Captures one record per executed instruction (PC, register snapshot,
//! memory accesses) into per-thread buffers and flushes them into flat binary
//! trace files, one session directory per traced process. The capture core
//! is host-agnostic: a host reports instructions, blocks, lifecycle events
//! and signals through [`lifecycle::TracerContext`]. The bundled host in
//! [`tracer`] single-steps a command with ptrace.

pub mod capture;
pub mod channel;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod reader;
pub mod records;
pub mod regfile;
pub mod session;
pub mod signal;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod tracer;

pub use channel::{Channel, ChannelStats, FlushSink};
pub use config::TracerConfig;
pub use error::{Result, TraceError};
pub use host::{
    BlockInstruction, InstructionInfo, MachineContext, MemOperand, MemoryProbe, TaskIds,
};
pub use lifecycle::{ExitReport, ThreadTrace, TracerContext};
pub use records::{Arch, Direction, Record, Stream};
pub use regfile::RegisterFile;
