//! Architecture-specific register snapshot layouts
//!
//! The layout of `regfile.trace` depends on the architecture the trace was
//! captured on and, for AMD64, on the `simd` and `fxsave` cargo features.
//! Each supported layout is a concrete [`RegisterFile`] type; the tracer is
//! generic over it, so the layout is fixed when the tracer is instantiated
//! and recorded in the session metadata.
//!
//! AArch32 has no layout. Tracing it is unsupported.

use bytemuck::{Pod, Zeroable};

use crate::records::{features, Arch, InsnRef, InsnRef32, Record};

/// A register as shown by the diagnostic dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedRegister {
    pub name: &'static str,
    pub value: u64,
    /// Whether the value may be dereferenced for the memory dump
    pub is_pointer: bool,
}

impl NamedRegister {
    fn pointer(name: &'static str, value: u64) -> Self {
        Self {
            name,
            value,
            is_pointer: true,
        }
    }

    fn scalar(name: &'static str, value: u64) -> Self {
        Self {
            name,
            value,
            is_pointer: false,
        }
    }
}

/// One register snapshot record
pub trait RegisterFile: Record {
    /// Architecture written into the metadata record
    const ARCH: Arch;

    /// Layout extensions compiled into this snapshot (see [`features`])
    const FEATURES: u32 = 0;

    /// Vector registers stored per snapshot
    const SIMD_SLOTS: usize = 0;

    /// Record type of `insn.trace` for this architecture
    type InsnRef: Record;

    fn insn_ref(pc: u64) -> Self::InsnRef;

    /// Program counter field of the snapshot
    fn pc(&self) -> u64;

    /// Overwrite the program counter field
    fn set_pc(&mut self, pc: u64);

    /// General purpose registers, in dump order
    fn named_registers(&self) -> Vec<NamedRegister>;
}

/// AMD64 general purpose registers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct Amd64Gpr {
    pub rdi: u64,
    pub rsi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rip: u64,
}

/// Number of YMM slots stored with the `simd` feature
pub const AMD64_SIMD_SLOTS: usize = 16;

/// Size of the FXSAVE area stored with the `fxsave` feature
pub const FXSAVE_SIZE: usize = 512;

/// AMD64 register snapshot
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Amd64RegFile {
    pub gpr: Amd64Gpr,
    #[cfg(feature = "simd")]
    pub simd: [[u8; 32]; AMD64_SIMD_SLOTS],
    #[cfg(feature = "fxsave")]
    pub fxsave: [u8; FXSAVE_SIZE],
}

impl Record for Amd64RegFile {}

const AMD64_FEATURES: u32 = {
    let mut bits = 0;
    if cfg!(feature = "simd") {
        bits |= features::SIMD;
    }
    if cfg!(feature = "fxsave") {
        bits |= features::FXSAVE;
    }
    bits
};

impl RegisterFile for Amd64RegFile {
    const ARCH: Arch = Arch::Amd64;
    const FEATURES: u32 = AMD64_FEATURES;
    const SIMD_SLOTS: usize = if cfg!(feature = "simd") {
        AMD64_SIMD_SLOTS
    } else {
        0
    };
    type InsnRef = InsnRef;

    fn insn_ref(pc: u64) -> InsnRef {
        InsnRef { pc }
    }

    fn pc(&self) -> u64 {
        self.gpr.rip
    }

    fn set_pc(&mut self, pc: u64) {
        self.gpr.rip = pc;
    }

    fn named_registers(&self) -> Vec<NamedRegister> {
        let g = &self.gpr;
        vec![
            NamedRegister::pointer("rdi", g.rdi),
            NamedRegister::pointer("rsi", g.rsi),
            NamedRegister::pointer("rsp", g.rsp),
            NamedRegister::pointer("rbp", g.rbp),
            NamedRegister::pointer("rbx", g.rbx),
            NamedRegister::pointer("rdx", g.rdx),
            NamedRegister::pointer("rcx", g.rcx),
            NamedRegister::pointer("rax", g.rax),
            NamedRegister::pointer("r8", g.r8),
            NamedRegister::pointer("r9", g.r9),
            NamedRegister::pointer("r10", g.r10),
            NamedRegister::pointer("r11", g.r11),
            NamedRegister::pointer("r12", g.r12),
            NamedRegister::pointer("r13", g.r13),
            NamedRegister::pointer("r14", g.r14),
            NamedRegister::pointer("r15", g.r15),
            NamedRegister::scalar("rflags", g.rflags),
            NamedRegister::scalar("rip", g.rip),
        ]
    }
}

/// 32-bit x86 register snapshot
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct X86RegFile {
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub eflags: u32,
    pub eip: u32,
}

impl Record for X86RegFile {}

impl RegisterFile for X86RegFile {
    const ARCH: Arch = Arch::X86;
    type InsnRef = InsnRef32;

    fn insn_ref(pc: u64) -> InsnRef32 {
        InsnRef32 { pc: pc as u32 }
    }

    fn pc(&self) -> u64 {
        u64::from(self.eip)
    }

    fn set_pc(&mut self, pc: u64) {
        self.eip = pc as u32;
    }

    fn named_registers(&self) -> Vec<NamedRegister> {
        vec![
            NamedRegister::pointer("eax", self.eax.into()),
            NamedRegister::pointer("ecx", self.ecx.into()),
            NamedRegister::pointer("edx", self.edx.into()),
            NamedRegister::pointer("ebx", self.ebx.into()),
            NamedRegister::pointer("esp", self.esp.into()),
            NamedRegister::pointer("ebp", self.ebp.into()),
            NamedRegister::pointer("esi", self.esi.into()),
            NamedRegister::pointer("edi", self.edi.into()),
            NamedRegister::scalar("eflags", self.eflags.into()),
            NamedRegister::scalar("eip", self.eip.into()),
        ]
    }
}

/// AArch64 general purpose and status registers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct Aarch64Gpr {
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub nzcv: u32,
    pub fpcr: u32,
    pub fpsr: u32,
    pad: u32,
}

/// AArch64 register snapshot
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Aarch64RegFile {
    pub gpr: Aarch64Gpr,
    pub v: [[u8; 16]; 32],
}

impl Record for Aarch64RegFile {}

const AARCH64_X_NAMES: [&str; 31] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30",
];

impl RegisterFile for Aarch64RegFile {
    const ARCH: Arch = Arch::AArch64;
    const FEATURES: u32 = features::SIMD;
    const SIMD_SLOTS: usize = 32;
    type InsnRef = InsnRef;

    fn insn_ref(pc: u64) -> InsnRef {
        InsnRef { pc }
    }

    fn pc(&self) -> u64 {
        self.gpr.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.gpr.pc = pc;
    }

    fn named_registers(&self) -> Vec<NamedRegister> {
        let mut regs: Vec<NamedRegister> = AARCH64_X_NAMES
            .iter()
            .zip(self.gpr.x.iter())
            .map(|(&name, &value)| NamedRegister::pointer(name, value))
            .collect();
        regs.push(NamedRegister::pointer("sp", self.gpr.sp));
        regs.push(NamedRegister::scalar("nzcv", self.gpr.nzcv.into()));
        regs.push(NamedRegister::scalar("pc", self.gpr.pc));
        regs
    }
}
