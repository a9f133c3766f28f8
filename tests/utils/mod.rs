// Shared helpers for the capture pipeline tests
//
// A scripted machine stands in for the instrumentation host: it hands out
// register values and answers memory probes from a fixed table.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use insntrace::config::TracerConfig;
use insntrace::host::{InstructionInfo, MachineContext, MemOperand, MemoryProbe};
use insntrace::lifecycle::{ThreadTrace, TracerContext};
use insntrace::regfile::Amd64RegFile;

/// Fake host machine with a tiny word-addressed memory
#[derive(Debug, Default)]
pub struct ScriptedMachine {
    pub memory: HashMap<u64, u64>,
    pub rax: u64,
    pub captures: usize,
}

impl MemoryProbe for ScriptedMachine {
    fn probe(&self, addr: u64, buf: &mut [u8]) -> Option<usize> {
        let word = self.memory.get(&addr)?.to_le_bytes();
        let n = buf.len().min(8);
        buf[..n].copy_from_slice(&word[..n]);
        Some(n)
    }
}

impl MachineContext<Amd64RegFile> for ScriptedMachine {
    fn capture_registers(&mut self, regs: &mut Amd64RegFile) -> insntrace::Result<()> {
        self.captures += 1;
        regs.gpr.rax = self.rax;
        regs.gpr.rsp = 0x7ffd_0000;
        Ok(())
    }
}

/// Tracer context writing under `output_dir` with small buffers
pub fn small_context(output_dir: &Path, app: &str, records: usize) -> TracerContext<Amd64RegFile> {
    let config = TracerConfig {
        capture_proc_map: false,
        ..TracerConfig::default()
            .with_output_dir(output_dir)
            .with_buffer_records(records)
    };
    TracerContext::new(config, app).unwrap()
}

/// Capture a run of register-only instructions at consecutive 4-byte PCs
pub fn run_straight_line(
    ctx: &TracerContext<Amd64RegFile>,
    thread: &mut ThreadTrace<Amd64RegFile>,
    machine: &mut ScriptedMachine,
    first_pc: u64,
    count: usize,
) -> Vec<u64> {
    let pcs: Vec<u64> = (0..count as u64).map(|i| first_pc + 4 * i).collect();
    for &pc in &pcs {
        let insn = InstructionInfo {
            pc,
            length: 4,
            reads: &[],
            writes: &[],
        };
        ctx.on_instruction(thread, &insn, machine).unwrap();
    }
    pcs
}

pub fn operand(addr: u64, value: u64) -> MemOperand {
    MemOperand {
        addr,
        size: 8,
        value,
    }
}
