//! Trace directories and their open files
//!
//! A trace root is created once per traced program:
//!
//! ```text
//! <output_dir>/<app_name>-<pid>[_<secs>-<nanos>]/
//!   <pid>/            one TraceSession per traced process
//!     insn.trace
//!     regfile.trace
//!     memrefs.trace
//!     memfile.trace
//!     metafile
//!     proc_map
//!   insn.bytemap      shared by the whole process tree
//!   process_tree.txt  "<parent_pid>-<child_pid>" per traced process
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::channel::FlushSink;
use crate::error::{Result, TraceError};
use crate::records::{BytesMap, Metadata, Stream};

/// Name of the process lineage log in the trace root
pub const PROCESS_TREE_FILE: &str = "process_tree.txt";

/// Name of the captured memory map in a session directory
pub const PROC_MAP_FILE: &str = "proc_map";

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TraceError::OpenFile {
            path: path.to_path_buf(),
            source,
        })
}

fn share_with_children(path: &Path) {
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o666)) {
        tracing::warn!("Could not relax permissions on {}: {}", path.display(), e);
    }
}

/// A trace file shared by every channel that flushes into it
#[derive(Debug, Clone)]
pub struct StreamWriter {
    stream: Stream,
    file: Arc<Mutex<File>>,
}

impl StreamWriter {
    fn open(dir: &Path, stream: Stream) -> Result<Self> {
        let file = open_append(&dir.join(stream.file_name()))?;
        Ok(Self {
            stream,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    /// Write bytes under the file lock
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        lock(&self.file)
            .write_all(bytes)
            .map_err(|source| TraceError::Write {
                stream: self.stream,
                source,
            })
    }

    /// Push written data through to the storage device
    pub fn sync(&self) -> Result<()> {
        lock(&self.file)
            .sync_data()
            .map_err(|source| TraceError::Write {
                stream: self.stream,
                source,
            })
    }
}

impl FlushSink for StreamWriter {
    fn flush_records(&mut self, bytes: &[u8]) -> io::Result<()> {
        lock(&self.file).write_all(bytes)
    }
}

/// The open files of one traced process
#[derive(Debug)]
pub struct TraceSession {
    pid: u32,
    dir: PathBuf,
    pub(crate) insn: StreamWriter,
    pub(crate) regfile: StreamWriter,
    pub(crate) memrefs: StreamWriter,
    pub(crate) memfile: StreamWriter,
    metafile: StreamWriter,
    fresh: bool,
    /// Held while one thread writes its channels, so that the stream files
    /// receive that thread's chunks at the same record boundaries
    group: Mutex<()>,
}

impl TraceSession {
    /// Create `dir` and open the session's stream files in it
    pub fn create(dir: impl Into<PathBuf>, pid: u32) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| TraceError::CreateDirectory {
            path: dir.clone(),
            source,
        })?;

        let metafile = StreamWriter::open(&dir, Stream::Metafile)?;
        let fresh = lock(&metafile.file).metadata()?.len() == 0;

        Ok(Self {
            pid,
            insn: StreamWriter::open(&dir, Stream::Insn)?,
            regfile: StreamWriter::open(&dir, Stream::Regfile)?,
            memrefs: StreamWriter::open(&dir, Stream::MemRefs)?,
            memfile: StreamWriter::open(&dir, Stream::MemFile)?,
            metafile,
            fresh,
            group: Mutex::new(()),
            dir,
        })
    }

    /// Whether the session directory had no metadata when it was opened
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writer for one of the per-process streams
    ///
    /// `None` for [`Stream::BytesMap`], which belongs to the trace root.
    pub fn writer(&self, stream: Stream) -> Option<&StreamWriter> {
        match stream {
            Stream::Insn => Some(&self.insn),
            Stream::Regfile => Some(&self.regfile),
            Stream::MemRefs => Some(&self.memrefs),
            Stream::MemFile => Some(&self.memfile),
            Stream::Metafile => Some(&self.metafile),
            Stream::BytesMap => None,
        }
    }

    /// Serialize a group flush of one thread's channels
    pub(crate) fn group_lock(&self) -> MutexGuard<'_, ()> {
        lock(&self.group)
    }

    /// Stamp the trace format identity
    pub fn write_metadata(&self, metadata: &Metadata) -> Result<()> {
        self.metafile.write(bytemuck::bytes_of(metadata))
    }

    /// Copy `/proc/<pid>/maps` into the session, unless already captured
    ///
    /// Returns whether a copy was made.
    pub fn capture_proc_map(&self) -> Result<bool> {
        let dest = self.dir.join(PROC_MAP_FILE);
        if dest.exists() {
            return Ok(false);
        }
        fs::copy(format!("/proc/{}/maps", self.pid), &dest)?;
        Ok(true)
    }

    /// Replace the captured memory map with the current one
    ///
    /// Used after the process image changes (exec).
    pub fn refresh_proc_map(&self) -> Result<()> {
        fs::copy(
            format!("/proc/{}/maps", self.pid),
            self.dir.join(PROC_MAP_FILE),
        )?;
        Ok(())
    }

    /// Sync every stream file of the session
    pub fn sync_all(&self) -> Result<()> {
        for writer in [
            &self.insn,
            &self.regfile,
            &self.memrefs,
            &self.memfile,
            &self.metafile,
        ] {
            writer.sync()?;
        }
        Ok(())
    }
}

/// Directory suffix used when `<app>-<pid>` already exists
fn timestamp_suffix() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}-{}", now.as_secs(), now.subsec_nanos() % 1_000_000)
}

/// Create a fresh trace root directory for `app_name`/`pid`
///
/// Never reuses an existing directory: on collision a timestamp suffix is
/// appended, and if that also fails the error is returned.
pub fn create_trace_root_dir(output_dir: &Path, app_name: &str, pid: u32) -> Result<PathBuf> {
    let base = format!("{}-{}", app_name, pid);
    let first = output_dir.join(&base);
    match fs::create_dir(&first) {
        Ok(()) => return Ok(first),
        Err(e) => tracing::debug!("{} unavailable ({}), adding timestamp", first.display(), e),
    }

    let stamped = output_dir.join(format!("{}_{}", base, timestamp_suffix()));
    fs::create_dir(&stamped).map_err(|source| TraceError::CreateDirectory {
        path: stamped.clone(),
        source,
    })?;
    Ok(stamped)
}

/// Files shared by every process of one traced program
#[derive(Debug)]
pub struct TraceRoot {
    dir: PathBuf,
    root_pid: u32,
    bytes_map: StreamWriter,
}

impl TraceRoot {
    /// Create the root directory, the byte map and the lineage log
    ///
    /// The lineage log starts with the `<parent>-<root>` line.
    pub fn create(
        output_dir: &Path,
        app_name: &str,
        root_pid: u32,
        parent_pid: u32,
    ) -> Result<Self> {
        let dir = create_trace_root_dir(output_dir, app_name, root_pid)?;

        let bytes_map = StreamWriter::open(&dir, Stream::BytesMap)?;
        share_with_children(&dir.join(Stream::BytesMap.file_name()));

        let tree_path = dir.join(PROCESS_TREE_FILE);
        let mut tree = File::create(&tree_path).map_err(|source| TraceError::OpenFile {
            path: tree_path.clone(),
            source,
        })?;
        writeln!(tree, "{}-{}", parent_pid, root_pid)?;
        share_with_children(&tree_path);

        Ok(Self {
            dir,
            root_pid,
            bytes_map,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root_pid(&self) -> u32 {
        self.root_pid
    }

    /// Directory holding the session of `pid`
    pub fn session_dir(&self, pid: u32) -> PathBuf {
        self.dir.join(pid.to_string())
    }

    /// Append a `<parent>-<child>` line to the lineage log
    pub fn append_lineage(&self, parent_pid: u32, child_pid: u32) -> Result<()> {
        let path = self.dir.join(PROCESS_TREE_FILE);
        let mut tree = open_append(&path)?;
        writeln!(tree, "{}-{}", parent_pid, child_pid)?;
        Ok(())
    }

    pub fn write_bytes_map(&self, entries: &[BytesMap]) -> Result<()> {
        self.bytes_map.write(bytemuck::cast_slice(entries))
    }

    pub fn sync(&self) -> Result<()> {
        self.bytes_map.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Arch, Record, FORMAT_VERSION};
    use tempfile::TempDir;

    #[test]
    fn test_session_creates_all_stream_files() {
        let tmp = TempDir::new().unwrap();
        let session = TraceSession::create(tmp.path().join("1234"), 1234).unwrap();
        for stream in [
            Stream::Insn,
            Stream::Regfile,
            Stream::MemRefs,
            Stream::MemFile,
            Stream::Metafile,
        ] {
            assert!(session.dir().join(stream.file_name()).exists(), "{}", stream);
        }
        assert_eq!(session.pid(), 1234);
        assert!(session.is_fresh());
        assert!(session.writer(Stream::BytesMap).is_none());
        assert_eq!(
            session.writer(Stream::MemRefs).map(StreamWriter::stream),
            Some(Stream::MemRefs)
        );
    }

    #[test]
    fn test_reopened_session_is_not_fresh() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("9");
        let first = TraceSession::create(&dir, 9).unwrap();
        first
            .write_metadata(&Metadata::new(Arch::Amd64, FORMAT_VERSION, 144, 0))
            .unwrap();
        drop(first);
        assert!(!TraceSession::create(&dir, 9).unwrap().is_fresh());
    }

    #[test]
    fn test_metadata_is_first_bytes_of_metafile() {
        let tmp = TempDir::new().unwrap();
        let session = TraceSession::create(tmp.path().join("7"), 7).unwrap();
        let meta = Metadata::new(Arch::Amd64, FORMAT_VERSION, 144, 0);
        session.write_metadata(&meta).unwrap();

        let bytes = fs::read(session.dir().join("metafile")).unwrap();
        assert_eq!(&bytes[..Metadata::SIZE], bytemuck::bytes_of(&meta));
    }

    #[test]
    fn test_root_dir_collision_gets_timestamp() {
        let tmp = TempDir::new().unwrap();
        let first = create_trace_root_dir(tmp.path(), "app", 42).unwrap();
        let second = create_trace_root_dir(tmp.path(), "app", 42).unwrap();
        assert_eq!(first.file_name().unwrap(), "app-42");
        assert_ne!(first, second);
        assert!(second
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("app-42_"));
    }

    #[test]
    fn test_root_dir_in_missing_parent_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("does/not/exist");
        let err = create_trace_root_dir(&missing, "app", 1).unwrap_err();
        assert!(matches!(err, TraceError::CreateDirectory { .. }));
    }

    #[test]
    fn test_lineage_log_appends() {
        let tmp = TempDir::new().unwrap();
        let root = TraceRoot::create(tmp.path(), "app", 100, 1).unwrap();
        root.append_lineage(100, 101).unwrap();

        let log = fs::read_to_string(root.dir().join(PROCESS_TREE_FILE)).unwrap();
        assert_eq!(log, "1-100\n100-101\n");
        assert_eq!(root.session_dir(101), root.dir().join("101"));
    }

    #[test]
    fn test_proc_map_capture_is_skipped_when_present() {
        let tmp = TempDir::new().unwrap();
        let session = TraceSession::create(tmp.path().join("s"), std::process::id()).unwrap();
        fs::write(session.dir().join(PROC_MAP_FILE), "existing").unwrap();
        assert!(!session.capture_proc_map().unwrap());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_refresh_replaces_stale_proc_map() {
        let tmp = TempDir::new().unwrap();
        let session = TraceSession::create(tmp.path().join("s"), std::process::id()).unwrap();
        fs::write(session.dir().join(PROC_MAP_FILE), "before exec").unwrap();

        session.refresh_proc_map().unwrap();
        let map = fs::read_to_string(session.dir().join(PROC_MAP_FILE)).unwrap();
        assert_ne!(map, "before exec");
        assert!(!map.is_empty());
    }
}
