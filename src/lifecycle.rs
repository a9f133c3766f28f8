//! Trace session lifecycle across threads, forks and exits
//!
//! [`TracerContext`] is the one object holding state shared by every traced
//! thread: the trace root, the live sessions, and per-process instruction
//! totals. All of it sits behind a single mutex that is only taken on rare
//! events (thread start and exit, fork, block translation, fatal signals).
//! Per-instruction capture touches only the thread's own [`ThreadTrace`].
//!
//! Sessions are scoped to a process: every thread of process `pid` shares
//! the session in `<root>/<pid>/`. A thread always writes its four channels
//! together under the session's group lock, so each stream file receives
//! the same threads' chunks in the same order and a reader can still pair
//! `memrefs.trace` with `memfile.trace`. The session's files close when its
//! last thread exits.
//!
//! ```text
//! thread_init ──▶ (first call) create root, insn.bytemap, process_tree.txt
//!             └─▶ get or create session <root>/<pid>, fresh channels
//! fork_init   ──▶ append "<ppid>-<pid>", discard inherited channels,
//!                 new session for the child pid, fresh channels
//! on_exec     ──▶ re-capture the session's memory map
//! thread_exit ──▶ flush + close channels, add count to the process total
//! thread_abort ─▶ drop pending records after a fatal capture error
//! process_exit ─▶ report the process total
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use crate::channel::{Channel, ChannelStats};
use crate::config::TracerConfig;
use crate::error::{Result, TraceError};
use crate::host::TaskIds;
use crate::records::{MemFile, MemRef, Metadata, Record, Stream, FORMAT_VERSION};
use crate::regfile::RegisterFile;
use crate::session::{lock, StreamWriter, TraceRoot, TraceSession};

/// State shared by all traced threads
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    pub(crate) root: Option<TraceRoot>,
    sessions: HashMap<u32, Weak<TraceSession>>,
    instructions: HashMap<u32, u64>,
}

/// Owner of all process-wide tracer state
#[derive(Debug)]
pub struct TracerContext<R: RegisterFile> {
    pub(crate) config: TracerConfig,
    app_name: String,
    pub(crate) shared: Mutex<SharedState>,
    _layout: PhantomData<fn() -> R>,
}

/// Per-thread capture state: the thread's channels and its session
pub struct ThreadTrace<R: RegisterFile> {
    ids: TaskIds,
    pub(crate) session: Arc<TraceSession>,
    pub(crate) insn: Channel<R::InsnRef, StreamWriter>,
    pub(crate) regfile: Channel<R, StreamWriter>,
    pub(crate) memrefs: Channel<MemRef, StreamWriter>,
    pub(crate) memfile: Channel<MemFile, StreamWriter>,
    pub(crate) instructions: u64,
}

impl<R: RegisterFile> fmt::Debug for ThreadTrace<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadTrace")
            .field("ids", &self.ids)
            .field("session", &self.session.dir())
            .field("instructions", &self.instructions)
            .finish()
    }
}

pub(crate) fn write_error(stream: Stream) -> impl FnOnce(std::io::Error) -> TraceError {
    move |source| TraceError::Write { stream, source }
}

impl<R: RegisterFile> ThreadTrace<R> {
    pub fn ids(&self) -> TaskIds {
        self.ids
    }

    pub fn session(&self) -> &TraceSession {
        &self.session
    }

    /// Instructions captured by this thread so far
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    /// Statistics of the channel feeding `stream`
    pub fn channel_stats(&self, stream: Stream) -> Option<ChannelStats> {
        match stream {
            Stream::Insn => Some(self.insn.stats()),
            Stream::Regfile => Some(self.regfile.stats()),
            Stream::MemRefs => Some(self.memrefs.stats()),
            Stream::MemFile => Some(self.memfile.stats()),
            Stream::Metafile | Stream::BytesMap => None,
        }
    }

    /// The thread state a forked child starts with
    ///
    /// The copy holds the parent's pending records but never writes them;
    /// pass it to [`TracerContext::fork_init`].
    pub fn inherited(&self) -> Self {
        Self {
            ids: self.ids,
            session: Arc::clone(&self.session),
            insn: self.insn.inherited(),
            regfile: self.regfile.inherited(),
            memrefs: self.memrefs.inherited(),
            memfile: self.memfile.inherited(),
            instructions: self.instructions,
        }
    }

    /// Whether one more instruction with `mem_count` memory operands fits
    /// in every channel
    pub(crate) fn has_room(&self, mem_count: usize) -> bool {
        self.insn.has_room(1)
            && self.regfile.has_room(1)
            && self.memrefs.has_room(1)
            && self.memfile.has_room(mem_count)
    }

    /// Flush every channel, returning the number of records written
    pub fn flush_all(&mut self) -> Result<usize> {
        let session = Arc::clone(&self.session);
        let _group = session.group_lock();
        self.flush_channels()
    }

    /// Flush every channel; the caller holds the session's group lock
    pub(crate) fn flush_channels(&mut self) -> Result<usize> {
        let memfile = self.memfile.flush().map_err(write_error(Stream::MemFile))?;
        let memrefs = self.memrefs.flush().map_err(write_error(Stream::MemRefs))?;
        let insn = self.insn.flush().map_err(write_error(Stream::Insn))?;
        let regfile = self.regfile.flush().map_err(write_error(Stream::Regfile))?;
        Ok(memfile / MemFile::SIZE
            + memrefs / MemRef::SIZE
            + insn / <R::InsnRef as Record>::SIZE
            + regfile / R::SIZE)
    }

    /// Flush and release every channel
    ///
    /// Records left behind by a failed write are dropped, not retried.
    pub(crate) fn close(mut self) -> Result<()> {
        let session = Arc::clone(&self.session);
        let _group = session.group_lock();
        let flushed = self.flush_channels();
        self.discard();
        flushed.map(|_| ())
    }

    /// Release every channel without writing its pending records
    pub(crate) fn discard(self) {
        let Self {
            insn,
            regfile,
            memrefs,
            memfile,
            ..
        } = self;
        insn.discard();
        regfile.discard();
        memrefs.discard();
        memfile.discard();
    }
}

/// Instruction total reported when a process exits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub pid: u32,
    pub is_root: bool,
    pub instructions: u64,
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = if self.is_root { "Parent" } else { "Child" };
        write!(
            f,
            "{} process (PID:{}) exits. Total number of instructions seen: {}",
            role, self.pid, self.instructions
        )
    }
}

impl<R: RegisterFile> TracerContext<R> {
    pub fn new(config: TracerConfig, app_name: impl Into<String>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            app_name: app_name.into(),
            shared: Mutex::new(SharedState::default()),
            _layout: PhantomData,
        })
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Directory of the trace root, once the main thread has started
    pub fn root_dir(&self) -> Option<PathBuf> {
        lock(&self.shared).root.as_ref().map(|r| r.dir().to_path_buf())
    }

    /// Instructions accounted to `pid` by exited threads
    pub fn process_instructions(&self, pid: u32) -> u64 {
        lock(&self.shared)
            .instructions
            .get(&pid)
            .copied()
            .unwrap_or(0)
    }

    /// A thread started executing
    ///
    /// The first call creates the trace root; every call joins (or opens)
    /// the session of `ids.pid` and gets fresh channels.
    pub fn thread_init(&self, ids: TaskIds) -> Result<ThreadTrace<R>> {
        let session = {
            let mut shared = lock(&self.shared);
            if shared.root.is_none() {
                let root = TraceRoot::create(
                    &self.config.output_dir,
                    &self.app_name,
                    ids.pid,
                    ids.ppid,
                )?;
                println!("[insntrace: {}]", self.banner(root.dir()));
                shared.root = Some(root);
            }
            self.session_for(&mut shared, ids.pid)?
        };
        tracing::debug!(pid = ids.pid, tid = ids.tid, "thread init");
        self.open_channels(session, ids)
    }

    /// A process forked
    ///
    /// `inherited` is the parent's thread state as copied into the child,
    /// if the host has one; its buffered records belong to the parent and
    /// are dropped unwritten.
    pub fn fork_init(
        &self,
        inherited: Option<ThreadTrace<R>>,
        ids: TaskIds,
    ) -> Result<ThreadTrace<R>> {
        if let Some(stale) = inherited {
            stale.discard();
        }

        let session = {
            let mut shared = lock(&self.shared);
            shared
                .root
                .as_ref()
                .ok_or(TraceError::NotInitialized)?
                .append_lineage(ids.ppid, ids.pid)?;
            shared.sessions.remove(&ids.pid);
            self.session_for(&mut shared, ids.pid)?
        };
        println!(
            "[insntrace: Application process forks, {} -> {}]",
            ids.ppid, ids.pid
        );
        self.open_channels(session, ids)
    }

    /// The traced process replaced its image
    ///
    /// Refreshes the session's memory map, which no longer describes the
    /// process.
    pub fn on_exec(&self, thread: &ThreadTrace<R>) {
        if !self.config.capture_proc_map {
            return;
        }
        if let Err(e) = thread.session.refresh_proc_map() {
            tracing::warn!(
                "Could not refresh memory map of {}: {}",
                thread.ids.pid,
                e
            );
        }
    }

    /// Stop tracing a thread after a fatal capture error
    ///
    /// Its pending records are dropped unwritten, so no partially captured
    /// instruction reaches the trace files. Returns the number of
    /// instructions lost.
    pub fn thread_abort(&self, thread: ThreadTrace<R>) -> u64 {
        let pending = thread.insn.pending() as u64;
        let pid = thread.ids.pid;
        let kept = thread.instructions.saturating_sub(pending);
        thread.discard();

        *lock(&self.shared).instructions.entry(pid).or_insert(0) += kept;
        tracing::warn!(pid, pending, "discarded buffered records of aborted thread");
        pending
    }

    /// A thread exited
    ///
    /// Flushes its channels and adds its instruction count to its process.
    pub fn thread_exit(&self, thread: ThreadTrace<R>) -> Result<u64> {
        let pid = thread.ids.pid;
        let count = thread.instructions;
        let closed = thread.close();

        *lock(&self.shared).instructions.entry(pid).or_insert(0) += count;
        tracing::debug!(pid, count, "thread exit");
        closed.map(|_| count)
    }

    /// A process exited; prints and returns its instruction total
    pub fn process_exit(&self, pid: u32) -> ExitReport {
        let report = {
            let mut shared = lock(&self.shared);
            shared.sessions.remove(&pid);
            ExitReport {
                pid,
                is_root: shared.root.as_ref().is_some_and(|r| r.root_pid() == pid),
                instructions: shared.instructions.get(&pid).copied().unwrap_or(0),
            }
        };
        println!("[insntrace: {}]", report);
        report
    }

    /// Startup line printed when the main thread starts
    pub fn banner(&self, root: &Path) -> String {
        format!(
            "Main thread starts. {} tracer, binary being traced: {}, SIMD slots: {}, \
             format version: {}, tracing into {}",
            R::ARCH,
            self.app_name,
            R::SIMD_SLOTS,
            FORMAT_VERSION,
            root.display()
        )
    }

    fn session_for(&self, shared: &mut SharedState, pid: u32) -> Result<Arc<TraceSession>> {
        if let Some(session) = shared.sessions.get(&pid).and_then(Weak::upgrade) {
            return Ok(session);
        }

        let root = shared.root.as_ref().ok_or(TraceError::NotInitialized)?;
        let session = TraceSession::create(root.session_dir(pid), pid)?;
        if session.is_fresh() {
            session.write_metadata(&Metadata::new(
                R::ARCH,
                FORMAT_VERSION,
                R::SIZE,
                R::FEATURES,
            ))?;
        }
        if self.config.capture_proc_map {
            if let Err(e) = session.capture_proc_map() {
                tracing::warn!("Could not capture memory map of {}: {}", pid, e);
            }
        }
        println!("[insntrace: Created a new trace for {}]", pid);

        let session = Arc::new(session);
        shared.sessions.insert(pid, Arc::downgrade(&session));
        Ok(session)
    }

    fn open_channels(&self, session: Arc<TraceSession>, ids: TaskIds) -> Result<ThreadTrace<R>> {
        let c = &self.config;
        Ok(ThreadTrace {
            ids,
            insn: Channel::with_records(c.insn_buffer_records, session.insn.clone())?,
            regfile: Channel::with_records(c.regfile_buffer_records, session.regfile.clone())?,
            memrefs: Channel::with_records(c.memref_buffer_records, session.memrefs.clone())?,
            memfile: Channel::with_records(c.memfile_buffer_records, session.memfile.clone())?,
            session,
            instructions: 0,
        })
    }
}
