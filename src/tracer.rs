//! Instruction tracing using ptrace
//!
//! Hosts the capture pipeline on top of single-stepping: every traced task is
//! stepped one instruction at a time. Before a step the instruction at the PC
//! is decoded and its memory operands are resolved and probed; after the step
//! the register file is read and the whole instruction is handed to
//! [`TracerContext::on_instruction`].

use std::collections::{HashMap, HashSet};
use std::io::IoSliceMut;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use iced_x86::{
    Decoder, DecoderOptions, FlowControl, Instruction, InstructionInfoFactory, OpAccess, Register,
};
use libc::user_regs_struct;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};

use crate::config::TracerConfig;
use crate::host::{
    BlockInstruction, InstructionInfo, MachineContext, MemOperand, MemoryProbe, TaskIds,
};
use crate::lifecycle::{ThreadTrace, TracerContext};
use crate::records::MAX_RAW_BYTES;
use crate::regfile::{Amd64Gpr, Amd64RegFile};

/// Trace a command, returning the traced program's exit code
pub fn trace_command(command: &[String], config: TracerConfig) -> Result<i32> {
    if command.is_empty() {
        anyhow::bail!("Command array is empty");
    }

    let program = &command[0];
    let args = &command[1..];
    let app_name = Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.clone());
    let ctx = TracerContext::<Amd64RegFile>::new(config, app_name)?;

    // Fork: parent will trace, child will exec
    match unsafe { fork() }.context("Failed to fork")? {
        ForkResult::Parent { child } => trace_child(&ctx, child),
        ForkResult::Child => {
            ptrace::traceme().context("Failed to PTRACE_TRACEME")?;

            let err = Command::new(program).args(args).exec();

            // If we get here, exec failed
            eprintln!("Failed to exec {}: {}", program, err);
            std::process::exit(1);
        }
    }
}

fn trace_child(ctx: &TracerContext<Amd64RegFile>, child: Pid) -> Result<i32> {
    // Wait for the SIGTRAP of the initial exec
    if let WaitStatus::Exited(_, code) = waitpid(child, None).context("Failed to wait for child")? {
        anyhow::bail!("Traced command exited before tracing started (code {})", code);
    }

    let mut options = ptrace::Options::PTRACE_O_EXITKILL
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEEXEC;
    if ctx.config().follow_forks {
        options |= ptrace::Options::PTRACE_O_TRACEFORK | ptrace::Options::PTRACE_O_TRACEVFORK;
    }
    ptrace::setoptions(child, options).context("Failed to set ptrace options")?;

    let trace = ctx.thread_init(TaskIds::main_thread(raw(child), raw(getpid())))?;
    let mut driver = Driver::new(ctx);
    driver.start(child, child, trace);
    driver.step_stop(child)?;
    driver.run(child)
}

fn raw(pid: Pid) -> u32 {
    pid.as_raw() as u32
}

/// Resume a task for one instruction, tolerating tasks that vanished
fn resume(pid: Pid, signal: Option<Signal>) -> Result<()> {
    match ptrace::step(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to single-step {}", pid)),
    }
}

/// Thread group id of a task, from /proc/<pid>/status
fn thread_group_of(pid: Pid) -> Option<Pid> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|tgid| tgid.trim().parse().ok())
        .map(Pid::from_raw)
}

/// A stopped task: its registers and its address space
struct Tracee {
    pid: Pid,
    regs: user_regs_struct,
}

impl MemoryProbe for Tracee {
    fn probe(&self, addr: u64, buf: &mut [u8]) -> Option<usize> {
        let len = buf.len();
        let mut local_iov = [IoSliceMut::new(buf)];
        let remote_iov = [RemoteIoVec {
            base: addr as usize,
            len,
        }];
        match process_vm_readv(self.pid, &mut local_iov, &remote_iov) {
            Ok(read) if read > 0 => Some(read),
            _ => None,
        }
    }
}

impl MachineContext<Amd64RegFile> for Tracee {
    fn capture_registers(&mut self, regs: &mut Amd64RegFile) -> crate::error::Result<()> {
        let r = &self.regs;
        regs.gpr = Amd64Gpr {
            rdi: r.rdi,
            rsi: r.rsi,
            rsp: r.rsp,
            rbp: r.rbp,
            rbx: r.rbx,
            rdx: r.rdx,
            rcx: r.rcx,
            rax: r.rax,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rflags: r.eflags,
            rip: r.rip,
        };

        #[cfg(any(feature = "simd", feature = "fxsave"))]
        {
            let area = read_fxsave(self.pid)?;
            // Only the XMM halves are visible through the FXSAVE area
            #[cfg(feature = "simd")]
            {
                let xmm = area[XMM_OFFSET..].chunks_exact(16);
                for (slot, lane) in regs.simd.iter_mut().zip(xmm) {
                    slot.fill(0);
                    slot[..16].copy_from_slice(lane);
                }
            }
            #[cfg(feature = "fxsave")]
            {
                regs.fxsave = area;
            }
        }
        Ok(())
    }
}

#[cfg(feature = "simd")]
const XMM_OFFSET: usize = 160;

#[cfg(any(feature = "simd", feature = "fxsave"))]
fn read_fxsave(pid: Pid) -> crate::error::Result<[u8; crate::regfile::FXSAVE_SIZE]> {
    let mut area = [0u8; crate::regfile::FXSAVE_SIZE];
    // SAFETY: PTRACE_GETFPREGS writes one 512-byte user_fpregs_struct to `area`
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETFPREGS,
            pid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            area.as_mut_ptr().cast::<libc::c_void>(),
        )
    };
    if rc == -1 {
        return Err(crate::error::TraceError::RegisterCapture(format!(
            "PTRACE_GETFPREGS on {}: {}",
            pid,
            std::io::Error::last_os_error()
        )));
    }
    Ok(area)
}

/// Value of `reg` as used in an effective address
fn register_value(regs: &user_regs_struct, reg: Register) -> Option<u64> {
    let value = match reg {
        Register::ES | Register::CS | Register::SS | Register::DS => return Some(0),
        Register::FS => return Some(regs.fs_base),
        Register::GS => return Some(regs.gs_base),
        _ => match reg.full_register() {
            Register::RAX => regs.rax,
            Register::RCX => regs.rcx,
            Register::RDX => regs.rdx,
            Register::RBX => regs.rbx,
            Register::RSP => regs.rsp,
            Register::RBP => regs.rbp,
            Register::RSI => regs.rsi,
            Register::RDI => regs.rdi,
            Register::R8 => regs.r8,
            Register::R9 => regs.r9,
            Register::R10 => regs.r10,
            Register::R11 => regs.r11,
            Register::R12 => regs.r12,
            Register::R13 => regs.r13,
            Register::R14 => regs.r14,
            Register::R15 => regs.r15,
            Register::RIP => regs.rip,
            // Vector indices (VSIB) are not resolved
            _ => return None,
        },
    };
    Some(if reg.is_gpr32() || reg == Register::EIP {
        value & 0xffff_ffff
    } else if reg.is_gpr16() {
        value & 0xffff
    } else {
        value
    })
}

/// Little-endian value of the first (up to) 8 bytes at `addr`, 0 if unreadable
fn operand_value<P: MemoryProbe + ?Sized>(probe: &P, addr: u64, size: usize) -> u64 {
    let width = size.min(8);
    if width == 0 {
        return 0;
    }
    let mut word = [0u8; 8];
    match probe.probe(addr, &mut word[..width]) {
        Some(read) if read == width => u64::from_le_bytes(word),
        _ => 0,
    }
}

fn decode_at<P: MemoryProbe + ?Sized>(
    probe: &P,
    pc: u64,
) -> Option<(Instruction, [u8; MAX_RAW_BYTES])> {
    let mut buf = [0u8; MAX_RAW_BYTES];
    let read = probe.probe(pc, &mut buf)?;
    let mut decoder = Decoder::with_ip(64, &buf[..read], pc, DecoderOptions::NONE);
    let instr = decoder.decode();
    (!instr.is_invalid()).then_some((instr, buf))
}

/// Decode the straight-line block starting at `start`
fn decode_block<P: MemoryProbe + ?Sized>(
    probe: &P,
    start: u64,
    limit: usize,
) -> Vec<(u64, Vec<u8>)> {
    let mut block = Vec::new();
    let mut pc = start;
    while block.len() < limit {
        let Some((instr, bytes)) = decode_at(probe, pc) else {
            break;
        };
        block.push((pc, bytes[..instr.len()].to_vec()));
        if instr.flow_control() != FlowControl::Next {
            break;
        }
        pc = instr.next_ip();
    }
    block
}

/// An instruction decoded before its step, recorded after it
#[derive(Debug, Clone, PartialEq)]
struct Pending {
    pc: u64,
    length: u32,
    reads: Vec<MemOperand>,
    writes: Vec<MemOperand>,
}

impl Pending {
    fn info(&self) -> InstructionInfo<'_> {
        InstructionInfo {
            pc: self.pc,
            length: self.length,
            reads: &self.reads,
            writes: &self.writes,
        }
    }
}

fn decode_pending<P: MemoryProbe + ?Sized>(
    factory: &mut InstructionInfoFactory,
    probe: &P,
    regs: &user_regs_struct,
) -> Option<Pending> {
    let pc = regs.rip;
    let (instr, _) = decode_at(probe, pc)?;
    let mut pending = Pending {
        pc,
        length: instr.len() as u32,
        reads: Vec::new(),
        writes: Vec::new(),
    };

    for mem in factory.info(&instr).used_memory() {
        let (read, write) = match mem.access() {
            OpAccess::Read | OpAccess::CondRead => (true, false),
            OpAccess::Write | OpAccess::CondWrite => (false, true),
            OpAccess::ReadWrite | OpAccess::ReadCondWrite => (true, true),
            _ => continue,
        };
        let Some(addr) = mem.virtual_address(0, |reg, _, _| register_value(regs, reg)) else {
            continue;
        };
        let size = mem.memory_size().size();
        let op = MemOperand {
            addr,
            size: size as u32,
            value: operand_value(probe, addr, size),
        };
        if read {
            pending.reads.push(op);
        }
        if write {
            pending.writes.push(op);
        }
    }
    Some(pending)
}

/// Kind of SIGTRAP stop, from its `si_code`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrapKind {
    /// A completed single step (`TRAP_TRACE`, or `TRAP_BRKPT` after a syscall)
    Step,
    /// The kernel set up a signal handler frame; nothing executed
    HandlerEntry,
    /// SIGTRAP sent by a process (`SI_USER`, `SI_TKILL`, `SI_QUEUE`)
    Sent,
}

fn trap_kind(si_code: i32) -> TrapKind {
    if si_code == libc::SIGTRAP {
        TrapKind::HandlerEntry
    } else if si_code <= 0 {
        TrapKind::Sent
    } else {
        TrapKind::Step
    }
}

/// What became of the pending instruction by the time of a stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// It ran: record it
    Executed,
    /// A signal handler was entered before it ran; it runs again after
    /// sigreturn and is recorded then
    Interrupted,
    /// It has not run yet and will run on the next step
    NotYetRun,
}

/// Outcome at a SIGTRAP stop
fn trap_outcome(kind: TrapKind, pending_pc: u64, rip: u64) -> Outcome {
    match kind {
        TrapKind::Step => Outcome::Executed,
        TrapKind::HandlerEntry => Outcome::Interrupted,
        TrapKind::Sent if rip == pending_pc => Outcome::NotYetRun,
        TrapKind::Sent => Outcome::Executed,
    }
}

/// Outcome at a signal-delivery stop
///
/// An ignored signal is discarded on resume and the step then runs the
/// instruction, so one that has not run yet stays pending.
fn signal_outcome(pending_pc: u64, rip: u64) -> Outcome {
    if rip == pending_pc {
        Outcome::NotYetRun
    } else {
        Outcome::Executed
    }
}

struct Task {
    tgid: Pid,
    trace: ThreadTrace<Amd64RegFile>,
    pending: Option<Pending>,
}

struct Driver<'a> {
    ctx: &'a TracerContext<Amd64RegFile>,
    factory: InstructionInfoFactory,
    tasks: HashMap<Pid, Task>,
    /// Live tasks per thread group
    threads: HashMap<Pid, usize>,
    /// PCs already written to the byte map, per thread group
    blocks: HashMap<Pid, HashSet<u64>>,
    /// New tasks whose first stop arrived before their creation event
    early_stops: HashSet<Pid>,
    /// New tasks whose first stop is still to come
    awaiting: HashSet<Pid>,
}

impl<'a> Driver<'a> {
    fn new(ctx: &'a TracerContext<Amd64RegFile>) -> Self {
        Self {
            ctx,
            factory: InstructionInfoFactory::new(),
            tasks: HashMap::new(),
            threads: HashMap::new(),
            blocks: HashMap::new(),
            early_stops: HashSet::new(),
            awaiting: HashSet::new(),
        }
    }

    fn start(&mut self, pid: Pid, tgid: Pid, trace: ThreadTrace<Amd64RegFile>) {
        self.tasks.insert(
            pid,
            Task {
                tgid,
                trace,
                pending: None,
            },
        );
        *self.threads.entry(tgid).or_insert(0) += 1;
    }

    fn run(&mut self, root: Pid) -> Result<i32> {
        let mut exit_code = 0;
        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(e).context("Failed to waitpid"),
            };

            match status {
                WaitStatus::Stopped(pid, Signal::SIGSTOP) if self.awaiting.remove(&pid) => {
                    self.step_stop(pid)?;
                }
                WaitStatus::Stopped(pid, _) if !self.tasks.contains_key(&pid) => {
                    self.early_stops.insert(pid);
                }
                WaitStatus::Stopped(pid, Signal::SIGTRAP) => self.step_stop(pid)?,
                WaitStatus::Stopped(pid, signal) => self.signal_stop(pid, signal)?,
                WaitStatus::PtraceEvent(pid, _, event) => self.event_stop(pid, event)?,
                WaitStatus::Exited(pid, code) => {
                    if pid == root {
                        exit_code = code;
                    }
                    self.task_exit(pid)?;
                }
                WaitStatus::Signaled(pid, signal, _) => {
                    if pid == root {
                        eprintln!("[insntrace: Child killed by signal: {:?}]", signal);
                        exit_code = 128 + signal as i32;
                    }
                    self.task_exit(pid)?;
                }
                _ => {}
            }
        }

        let leftover: Vec<Pid> = self.tasks.keys().copied().collect();
        for pid in leftover {
            self.task_exit(pid)?;
        }
        Ok(exit_code)
    }

    /// A task finished a step (or is about to take its first one)
    fn step_stop(&mut self, pid: Pid) -> Result<()> {
        if !self.tasks.contains_key(&pid) {
            return resume(pid, None);
        }
        let regs = match ptrace::getregs(pid) {
            Ok(regs) => regs,
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("Failed to get registers of {}", pid)),
        };
        let kind = match ptrace::getsiginfo(pid) {
            Ok(info) => trap_kind(info.si_code),
            Err(_) => TrapKind::Step,
        };

        let pending = self.tasks.get_mut(&pid).and_then(|task| task.pending.take());
        if let Some(done) = pending {
            match trap_outcome(kind, done.pc, regs.rip) {
                Outcome::Executed => self.record(pid, regs, &done)?,
                Outcome::Interrupted => {
                    tracing::trace!(pid = pid.as_raw(), "handler entered before {:#x}", done.pc);
                }
                Outcome::NotYetRun => {
                    if let Some(task) = self.tasks.get_mut(&pid) {
                        task.pending = Some(done);
                    }
                    return resume(pid, None);
                }
            }
        }

        self.arm(pid, regs)?;
        resume(pid, None)
    }

    /// A signal is about to be delivered to a task
    fn signal_stop(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        // Group-stop reports no siginfo; job control is not emulated
        let stop_signal = matches!(
            signal,
            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
        );
        if stop_signal && ptrace::getsiginfo(pid).is_err() {
            return resume(pid, None);
        }
        if !self.tasks.contains_key(&pid) {
            return resume(pid, Some(signal));
        }

        if let Ok(regs) = ptrace::getregs(pid) {
            let pending = self.tasks.get_mut(&pid).and_then(|task| task.pending.take());
            match pending {
                Some(done) if signal_outcome(done.pc, regs.rip) == Outcome::NotYetRun => {
                    if let Some(task) = self.tasks.get_mut(&pid) {
                        task.pending = Some(done);
                    }
                }
                Some(done) => {
                    self.record(pid, regs, &done)?;
                    self.arm(pid, regs)?;
                }
                None => self.arm(pid, regs)?,
            }
        }

        if let Some(task) = self.tasks.get_mut(&pid) {
            if let Some(records) = self.ctx.on_signal(&mut task.trace, signal) {
                tracing::debug!(pid = pid.as_raw(), records, "emergency flush");
            }
        }
        resume(pid, Some(signal))
    }

    /// Hand a finished instruction to the capture pipeline
    ///
    /// A capture failure is fatal: the task's buffered records are dropped
    /// and the error ends tracing.
    fn record(&mut self, pid: Pid, regs: user_regs_struct, done: &Pending) -> Result<()> {
        let Some(task) = self.tasks.get_mut(&pid) else {
            return Ok(());
        };
        let mut tracee = Tracee { pid, regs };
        let Err(e) = self
            .ctx
            .on_instruction(&mut task.trace, &done.info(), &mut tracee)
        else {
            return Ok(());
        };

        if let Some(task) = self.tasks.remove(&pid) {
            let lost = self.ctx.thread_abort(task.trace);
            tracing::warn!(pid = pid.as_raw(), lost, "aborted trace after capture failure");
        }
        Err(e).with_context(|| format!("Failed to capture instruction at {:#x}", done.pc))
    }

    /// Decode the instruction the task is about to run, recording its block
    /// if it starts new code
    fn arm(&mut self, pid: Pid, regs: user_regs_struct) -> Result<()> {
        let Some(task) = self.tasks.get_mut(&pid) else {
            return Ok(());
        };
        let tracee = Tracee { pid, regs };

        let covered = self.blocks.entry(task.tgid).or_default();
        if covered.insert(regs.rip) {
            let block = decode_block(&tracee, regs.rip, self.ctx.config().max_block_instructions);
            covered.extend(block.iter().map(|(pc, _)| *pc));
            if !block.is_empty() {
                let insns: Vec<BlockInstruction<'_>> = block
                    .iter()
                    .map(|(pc, bytes)| BlockInstruction { pc: *pc, bytes })
                    .collect();
                self.ctx
                    .on_block(&insns)
                    .context("Failed to record block bytes")?;
            }
        }

        task.pending = decode_pending(&mut self.factory, &tracee, &regs);
        if task.pending.is_none() {
            tracing::trace!(pid = pid.as_raw(), "undecodable instruction at {:#x}", regs.rip);
        }
        Ok(())
    }

    fn event_stop(&mut self, pid: Pid, event: i32) -> Result<()> {
        let creates_task = event == ptrace::Event::PTRACE_EVENT_FORK as i32
            || event == ptrace::Event::PTRACE_EVENT_VFORK as i32
            || event == ptrace::Event::PTRACE_EVENT_CLONE as i32;

        if creates_task {
            let child = ptrace::getevent(pid).context("Failed to get new task id")?;
            self.new_task(pid, Pid::from_raw(child as i32))?;
        } else if event == ptrace::Event::PTRACE_EVENT_EXEC as i32 {
            if let Some(task) = self.tasks.get(&pid) {
                self.blocks.remove(&task.tgid);
                self.ctx.on_exec(&task.trace);
            }
        }
        resume(pid, None)
    }

    fn new_task(&mut self, parent: Pid, child: Pid) -> Result<()> {
        let (parent_tgid, parent_ppid) = match self.tasks.get(&parent) {
            Some(task) => (task.tgid, task.trace.ids().ppid),
            None => (parent, 0),
        };
        let tgid = thread_group_of(child).unwrap_or(child);

        let trace = if tgid == child {
            if let Some(covered) = self.blocks.get(&parent_tgid).cloned() {
                self.blocks.insert(child, covered);
            }
            self.ctx
                .fork_init(None, TaskIds::main_thread(raw(child), raw(parent_tgid)))
                .with_context(|| format!("Failed to start trace of child {}", child))?
        } else {
            let ids = TaskIds {
                pid: raw(tgid),
                tid: raw(child),
                ppid: parent_ppid,
            };
            self.ctx
                .thread_init(ids)
                .with_context(|| format!("Failed to start trace of thread {}", child))?
        };
        self.start(child, tgid, trace);

        if self.early_stops.remove(&child) {
            self.step_stop(child)?;
        } else {
            self.awaiting.insert(child);
        }
        Ok(())
    }

    fn task_exit(&mut self, pid: Pid) -> Result<()> {
        self.awaiting.remove(&pid);
        self.early_stops.remove(&pid);
        let Some(task) = self.tasks.remove(&pid) else {
            return Ok(());
        };
        self.ctx
            .thread_exit(task.trace)
            .with_context(|| format!("Failed to close trace of {}", pid))?;

        let live = self.threads.entry(task.tgid).or_insert(1);
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.threads.remove(&task.tgid);
            self.blocks.remove(&task.tgid);
            self.ctx.process_exit(raw(task.tgid));
        }
        Ok(())
    }
}
