//! Per-instruction and per-block capture handlers
//!
//! The host calls [`TracerContext::on_instruction`] once per executed
//! instruction. Records are pushed in a fixed order so that a reader can
//! pair the streams up again:
//!
//! 1. one `MemFile` per memory source operand (read)
//! 2. one `MemFile` per memory destination operand (write)
//! 3. one `MemRef` holding the count of 1 and 2
//! 4. one instruction reference
//! 5. one register snapshot, its PC set to `pc + length`
//!
//! The PC in the snapshot is the fall-through address, not the real next
//! instruction after a taken branch.
//!
//! [`TracerContext::on_block`] records raw instruction bytes once per newly
//! translated block and writes them straight to the shared byte map.

use std::sync::Arc;

use crate::diagnostics;
use crate::error::{Result, TraceError};
use crate::host::{BlockInstruction, InstructionInfo, MachineContext};
use crate::lifecycle::{write_error, ThreadTrace, TracerContext};
use crate::records::{BytesMap, Direction, MemFile, MemRef, Stream, MAX_RAW_BYTES};
use crate::regfile::RegisterFile;
use crate::session::lock;

impl<R: RegisterFile> TracerContext<R> {
    /// Capture one executed instruction into the thread's channels
    ///
    /// Registers are captured before anything is buffered, so a capture
    /// failure (which is fatal) leaves no trace of the instruction. When
    /// the instruction does not fit in every channel, all of the thread's
    /// channels are flushed together first.
    pub fn on_instruction<M>(
        &self,
        thread: &mut ThreadTrace<R>,
        insn: &InstructionInfo<'_>,
        machine: &mut M,
    ) -> Result<()>
    where
        M: MachineContext<R>,
    {
        let mut regs = R::zeroed();
        machine.capture_registers(&mut regs)?;
        regs.set_pc(insn.pc.wrapping_add(u64::from(insn.length)));

        if self.config.log_registers {
            tracing::debug!(
                "{:#x}\n{}",
                insn.pc,
                diagnostics::dump_registers(&regs, &*machine)
            );
        }

        let mem_count = insn.mem_count();
        if mem_count > thread.memfile.capacity() {
            // The details alone overflow the buffer: write the whole
            // instruction while holding the group lock
            let session = Arc::clone(&thread.session);
            let _group = session.group_lock();
            thread.flush_channels()?;
            push_instruction(thread, insn, &regs)?;
            thread.flush_channels()?;
        } else {
            if !thread.has_room(mem_count) {
                thread.flush_all()?;
            }
            push_instruction(thread, insn, &regs)?;
        }

        thread.instructions += 1;
        Ok(())
    }

    /// Record the raw bytes of a newly translated block
    ///
    /// At most `max_block_instructions` entries are written. Returns the
    /// number of entries written.
    pub fn on_block(&self, block: &[BlockInstruction<'_>]) -> Result<usize> {
        let limit = block.len().min(self.config.max_block_instructions);
        let mut entries = Vec::with_capacity(limit);
        for insn in &block[..limit] {
            let entry = BytesMap::new(insn.pc, insn.bytes).ok_or(TraceError::InstructionTooLong {
                pc: insn.pc,
                length: insn.bytes.len(),
                max: MAX_RAW_BYTES,
            })?;
            tracing::trace!("{:#x}: {}", insn.pc, hex::encode(insn.bytes));
            entries.push(entry);
        }

        let shared = lock(&self.shared);
        let root = shared.root.as_ref().ok_or(TraceError::NotInitialized)?;
        root.write_bytes_map(&entries)?;
        Ok(entries.len())
    }
}

fn push_instruction<R: RegisterFile>(
    thread: &mut ThreadTrace<R>,
    insn: &InstructionInfo<'_>,
    regs: &R,
) -> Result<()> {
    let accesses = insn
        .reads
        .iter()
        .map(|op| (op, Direction::Read))
        .chain(insn.writes.iter().map(|op| (op, Direction::Write)));
    for (op, direction) in accesses {
        thread
            .memfile
            .push(MemFile::new(insn.pc, op.addr, op.size, op.value, direction))
            .map_err(write_error(Stream::MemFile))?;
    }

    thread
        .memrefs
        .push(MemRef {
            length: insn.mem_count() as u64,
        })
        .map_err(write_error(Stream::MemRefs))?;

    thread
        .insn
        .push(R::insn_ref(insn.pc))
        .map_err(write_error(Stream::Insn))?;

    *thread
        .regfile
        .next_slot()
        .map_err(write_error(Stream::Regfile))? = *regs;
    Ok(())
}
