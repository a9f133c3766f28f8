//! Fixed-layout trace records
//!
//! Every stream in a trace directory is a flat sequence of one of the record
//! types below, written back to back with no delimiters or headers. The
//! layouts are `#[repr(C)]` without implicit padding so that the bytes on
//! disk are exactly the in-memory representation (little-endian on every
//! supported target).
//!
//! ```text
//! <app>-<pid>/
//!   <pid>/insn.trace      InsnRef / InsnRef32   (one per executed instruction)
//!   <pid>/regfile.trace   RegisterFile layout   (one per executed instruction)
//!   <pid>/memrefs.trace   MemRef                (one per executed instruction)
//!   <pid>/memfile.trace   MemFile               (one per memory operand)
//!   <pid>/metafile        Metadata              (once)
//!   insn.bytemap          BytesMap              (one per translated instruction)
//! ```

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// Version stamped into every metafile
pub const FORMAT_VERSION: u32 = 2;

/// Maximum encoded instruction length kept in a [`BytesMap`]
pub const MAX_RAW_BYTES: usize = 16;

/// A value type that can be written verbatim into a trace stream
pub trait Record: Pod {
    /// Size of one record on disk
    const SIZE: usize = std::mem::size_of::<Self>();
}

/// The record streams of a trace, named after their file on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Insn,
    Regfile,
    MemRefs,
    MemFile,
    Metafile,
    BytesMap,
}

impl Stream {
    /// File name of the stream inside a trace directory
    pub fn file_name(self) -> &'static str {
        match self {
            Stream::Insn => "insn.trace",
            Stream::Regfile => "regfile.trace",
            Stream::MemRefs => "memrefs.trace",
            Stream::MemFile => "memfile.trace",
            Stream::Metafile => "metafile",
            Stream::BytesMap => "insn.bytemap",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Architecture identifier stored in the metadata record
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86 = 0,
    Amd64 = 1,
    AArch32 = 2,
    AArch64 = 3,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86 => "X86",
            Arch::Amd64 => "AMD64",
            Arch::AArch32 => "AArch32",
            Arch::AArch64 => "AArch64",
        }
    }
}

impl TryFrom<u32> for Arch {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Arch::X86),
            1 => Ok(Arch::Amd64),
            2 => Ok(Arch::AArch32),
            3 => Ok(Arch::AArch64),
            other => Err(other),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Program counter of one executed instruction (64-bit targets)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct InsnRef {
    pub pc: u64,
}

impl Record for InsnRef {}

/// Program counter of one executed instruction (32-bit targets)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct InsnRef32 {
    pub pc: u32,
}

impl Record for InsnRef32 {}

/// Number of memory operands touched by one executed instruction
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MemRef {
    pub length: u64,
}

impl Record for MemRef {}

/// Direction of a memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    /// Encoding used in [`MemFile::status`]
    pub fn status(self) -> u32 {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }

    pub fn from_status(status: u32) -> Option<Self> {
        match status {
            0 => Some(Direction::Read),
            1 => Some(Direction::Write),
            _ => None,
        }
    }
}

/// One memory operand access
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MemFile {
    /// Effective address
    pub addr: u64,
    /// Value at `addr` observed before the instruction executed
    pub value: u64,
    /// Access size in bytes
    pub size: u32,
    /// 0 = read, 1 = write
    pub status: u32,
    /// Program counter of the owning instruction
    pub pc: u64,
}

impl Record for MemFile {}

impl MemFile {
    pub fn new(pc: u64, addr: u64, size: u32, value: u64, direction: Direction) -> Self {
        Self {
            addr,
            value,
            size,
            status: direction.status(),
            pc,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        Direction::from_status(self.status)
    }
}

/// Raw encoding of one translated instruction
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BytesMap {
    pub pc: u64,
    pub size: u32,
    pub rawbytes: [u8; MAX_RAW_BYTES],
    pad: [u8; 4],
}

impl Record for BytesMap {}

impl BytesMap {
    /// Build a byte map entry, or `None` if `bytes` exceeds [`MAX_RAW_BYTES`]
    pub fn new(pc: u64, bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_RAW_BYTES {
            return None;
        }
        let mut rawbytes = [0u8; MAX_RAW_BYTES];
        rawbytes[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            pc,
            size: bytes.len() as u32,
            rawbytes,
            pad: [0; 4],
        })
    }

    /// The encoded bytes, without the zero fill
    pub fn bytes(&self) -> &[u8] {
        let len = (self.size as usize).min(MAX_RAW_BYTES);
        &self.rawbytes[..len]
    }
}

/// Register layout extensions enabled in the build
pub mod features {
    pub const SIMD: u32 = 1 << 0;
    pub const FXSAVE: u32 = 1 << 1;
}

/// Trace format identity, the first bytes of every metafile
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Metadata {
    pub arch: u32,
    pub version: u32,
    /// Size of one register snapshot in `regfile.trace`
    pub regfile_size: u32,
    /// Bitset of [`features`]
    pub features: u32,
}

impl Record for Metadata {}

impl Metadata {
    pub fn new(arch: Arch, version: u32, regfile_size: usize, features: u32) -> Self {
        Self {
            arch: arch as u32,
            version,
            regfile_size: regfile_size as u32,
            features,
        }
    }

    pub fn arch(&self) -> Option<Arch> {
        Arch::try_from(self.arch).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes_match_disk_format() {
        assert_eq!(InsnRef::SIZE, 8);
        assert_eq!(InsnRef32::SIZE, 4);
        assert_eq!(MemRef::SIZE, 8);
        assert_eq!(MemFile::SIZE, 32);
        assert_eq!(BytesMap::SIZE, 32);
        assert_eq!(Metadata::SIZE, 16);
    }

    #[test]
    fn test_memfile_field_offsets() {
        let rec = MemFile::new(0x1111, 0x2222, 4, 0x3333, Direction::Write);
        let bytes = bytemuck::bytes_of(&rec);
        assert_eq!(&bytes[0..8], &0x2222u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x3333u64.to_le_bytes());
        assert_eq!(&bytes[16..20], &4u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &1u32.to_le_bytes());
        assert_eq!(&bytes[24..32], &0x1111u64.to_le_bytes());
    }

    #[test]
    fn test_bytes_map_rejects_overlong_encoding() {
        assert!(BytesMap::new(0, &[0x90; 17]).is_none());
        let entry = BytesMap::new(0x400000, &[0x48, 0x89, 0xe5]).unwrap();
        assert_eq!(entry.size, 3);
        assert_eq!(entry.bytes(), &[0x48, 0x89, 0xe5]);
        assert!(entry.rawbytes[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_direction_status_encoding() {
        assert_eq!(Direction::Read.status(), 0);
        assert_eq!(Direction::Write.status(), 1);
        assert_eq!(Direction::from_status(2), None);
    }

    #[test]
    fn test_arch_round_trips_through_metadata() {
        let meta = Metadata::new(Arch::AArch64, FORMAT_VERSION, 792, 0);
        assert_eq!(meta.arch(), Some(Arch::AArch64));
        assert_eq!(Arch::try_from(9), Err(9));
    }
}
