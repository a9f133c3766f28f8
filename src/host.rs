//! Interface to the host that drives the tracer
//!
//! The tracer does not execute or decode the traced program itself. A host
//! (the ptrace driver in [`crate::tracer`], or a test harness) observes the
//! program, decodes instructions, and calls the event handlers on
//! [`crate::lifecycle::TracerContext`] with the types below.

use crate::error::Result;

/// Identity of the task an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskIds {
    /// Process (thread group) id
    pub pid: u32,
    /// Thread id
    pub tid: u32,
    /// Parent process id
    pub ppid: u32,
}

impl TaskIds {
    /// Ids of a process's main thread
    pub fn main_thread(pid: u32, ppid: u32) -> Self {
        Self {
            pid,
            tid: pid,
            ppid,
        }
    }
}

/// One memory operand of an instruction about to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemOperand {
    /// Effective address
    pub addr: u64,
    /// Access size in bytes
    pub size: u32,
    /// Value at `addr` before the instruction executes
    pub value: u64,
}

/// An executed instruction, as reported by the host
///
/// `reads` are the memory source operands and `writes` the memory
/// destination operands. An operand that is both read and written appears
/// in both lists.
#[derive(Debug, Clone, Copy)]
pub struct InstructionInfo<'a> {
    pub pc: u64,
    pub length: u32,
    pub reads: &'a [MemOperand],
    pub writes: &'a [MemOperand],
}

impl InstructionInfo<'_> {
    pub fn mem_count(&self) -> usize {
        self.reads.len() + self.writes.len()
    }
}

/// One instruction of a newly translated block
#[derive(Debug, Clone, Copy)]
pub struct BlockInstruction<'a> {
    pub pc: u64,
    pub bytes: &'a [u8],
}

/// Fault-free access to the traced program's memory
pub trait MemoryProbe {
    /// Read up to `buf.len()` bytes at `addr`
    ///
    /// Returns the number of bytes read, or `None` if the address is not
    /// readable.
    fn probe(&self, addr: u64, buf: &mut [u8]) -> Option<usize>;

    /// Read a little-endian `u64`, failing unless all 8 bytes are readable
    fn probe_u64(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        match self.probe(addr, &mut buf) {
            Some(8) => Some(u64::from_le_bytes(buf)),
            _ => None,
        }
    }
}

/// Register and memory access for the task executing an instruction
pub trait MachineContext<R>: MemoryProbe {
    /// Fill `regs` with the task's current register file
    fn capture_registers(&mut self, regs: &mut R) -> Result<()>;
}
