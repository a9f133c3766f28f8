//! Reading trace files back
//!
//! The reader side of the on-disk format: typed access to each stream and
//! the lineage log. It validates framing (whole records, matching register
//! layout) but does not interpret the trace.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TraceError};
use crate::records::{BytesMap, Metadata, Record, Stream};
use crate::regfile::RegisterFile;
use crate::session::PROCESS_TREE_FILE;

fn malformed(path: &Path, reason: impl Into<String>) -> TraceError {
    TraceError::Malformed {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Read a flat record file
pub fn read_records<T: Record>(path: &Path) -> Result<Vec<T>> {
    let bytes = fs::read(path)?;
    if bytes.len() % T::SIZE != 0 {
        return Err(malformed(
            path,
            format!(
                "{} bytes is not a whole number of {}-byte records",
                bytes.len(),
                T::SIZE
            ),
        ));
    }
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}

/// Read one stream of a session directory
pub fn read_stream<T: Record>(session_dir: &Path, stream: Stream) -> Result<Vec<T>> {
    read_records(&session_dir.join(stream.file_name()))
}

/// Read the metadata record of a session directory
pub fn read_metadata(session_dir: &Path) -> Result<Metadata> {
    let path = session_dir.join(Stream::Metafile.file_name());
    let bytes = fs::read(&path)?;
    if bytes.len() < Metadata::SIZE {
        return Err(malformed(&path, "missing metadata record"));
    }
    Ok(bytemuck::pod_read_unaligned(&bytes[..Metadata::SIZE]))
}

/// Read the register snapshots of a session, checking the layout first
pub fn read_regfiles<R: RegisterFile>(session_dir: &Path) -> Result<Vec<R>> {
    let meta = read_metadata(session_dir)?;
    let meta_path = session_dir.join(Stream::Metafile.file_name());
    if meta.arch() != Some(R::ARCH) {
        return Err(malformed(
            &meta_path,
            format!("trace arch id {} is not {}", meta.arch, R::ARCH),
        ));
    }
    if meta.regfile_size as usize != R::SIZE || meta.features != R::FEATURES {
        return Err(malformed(
            &meta_path,
            format!(
                "register snapshot is {} bytes (features {:#x}), expected {} ({:#x})",
                meta.regfile_size,
                meta.features,
                R::SIZE,
                R::FEATURES
            ),
        ));
    }
    read_stream(session_dir, Stream::Regfile)
}

/// Read the shared byte map of a trace root
pub fn read_bytes_map(root_dir: &Path) -> Result<Vec<BytesMap>> {
    read_records(&root_dir.join(Stream::BytesMap.file_name()))
}

/// Parse the lineage log into `(parent, child)` pairs
pub fn read_process_tree(root_dir: &Path) -> Result<Vec<(u32, u32)>> {
    let path = root_dir.join(PROCESS_TREE_FILE);
    let text = fs::read_to_string(&path)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (parent, child) = line
                .trim()
                .split_once('-')
                .ok_or_else(|| malformed(&path, format!("bad lineage line {:?}", line)))?;
            let parse = |s: &str| {
                s.parse::<u32>()
                    .map_err(|e| malformed(&path, format!("bad pid {:?}: {}", s, e)))
            };
            Ok((parse(parent)?, parse(child)?))
        })
        .collect()
}

/// Session directories of a trace root, sorted by pid
pub fn session_dirs(root_dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut sessions = Vec::new();
    for entry in fs::read_dir(root_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            sessions.push((pid, entry.path()));
        }
    }
    sessions.sort();
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Arch, InsnRef, FORMAT_VERSION};
    use crate::regfile::{Amd64RegFile, X86RegFile};
    use tempfile::TempDir;

    #[test]
    fn test_partial_record_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("insn.trace");
        fs::write(&path, [0u8; 12]).unwrap();
        let err = read_records::<InsnRef>(&path).unwrap_err();
        assert!(matches!(err, TraceError::Malformed { .. }));
    }

    #[test]
    fn test_regfile_layout_mismatch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let meta = Metadata::new(Arch::Amd64, FORMAT_VERSION, Amd64RegFile::SIZE, 0);
        fs::write(tmp.path().join("metafile"), bytemuck::bytes_of(&meta)).unwrap();
        fs::write(tmp.path().join("regfile.trace"), []).unwrap();

        let err = read_regfiles::<X86RegFile>(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("not X86"));
    }

    #[test]
    fn test_process_tree_parsing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(PROCESS_TREE_FILE), "1-100\n100-101\n\n").unwrap();
        assert_eq!(
            read_process_tree(tmp.path()).unwrap(),
            vec![(1, 100), (100, 101)]
        );

        fs::write(tmp.path().join(PROCESS_TREE_FILE), "1:100\n").unwrap();
        assert!(read_process_tree(tmp.path()).is_err());
    }

    #[test]
    fn test_session_dirs_skips_non_pid_entries() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("200")).unwrap();
        fs::create_dir(tmp.path().join("100")).unwrap();
        fs::create_dir(tmp.path().join("notes")).unwrap();
        fs::write(tmp.path().join("300"), "file").unwrap();

        let pids: Vec<u32> = session_dirs(tmp.path())
            .unwrap()
            .into_iter()
            .map(|(pid, _)| pid)
            .collect();
        assert_eq!(pids, vec![100, 200]);
    }
}
