//! Human-readable register dumps
//!
//! Console output only; nothing here is persisted. Each pointer-like
//! register is dereferenced through the host's [`MemoryProbe`], and an
//! unreadable address is shown inline instead of aborting capture.

use std::fmt::Write;

use crate::host::MemoryProbe;
use crate::regfile::RegisterFile;

/// Marker printed for an address the probe could not read
pub const INVALID_ACCESS: &str = "[Invalid Memory Access]";

/// Format `regs` and the 8 bytes each pointer register points at
pub fn dump_registers<R, P>(regs: &R, probe: &P) -> String
where
    R: RegisterFile,
    P: MemoryProbe + ?Sized,
{
    let mut out = String::from("\tRegisters and Memory Contents:\n");
    for reg in regs.named_registers() {
        let _ = write!(out, "\t  {:<6}: {:#018x}", reg.name, reg.value);
        if !reg.is_pointer {
            out.push('\n');
            continue;
        }
        match probe.probe_u64(reg.value) {
            Some(word) => {
                let _ = writeln!(out, " -> Memory[{:#018x}]: {:#018x}", reg.value, word);
            }
            None => {
                let _ = writeln!(out, " -> Memory[{:#018x}]: {}", reg.value, INVALID_ACCESS);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regfile::Amd64RegFile;
    use bytemuck::Zeroable;

    struct OnePage;

    impl MemoryProbe for OnePage {
        fn probe(&self, addr: u64, buf: &mut [u8]) -> Option<usize> {
            if (0x1000..0x2000).contains(&addr) {
                buf.fill(0xab);
                Some(buf.len())
            } else {
                None
            }
        }
    }

    #[test]
    fn test_dump_marks_unreadable_pointers() {
        let mut regs = Amd64RegFile::zeroed();
        regs.gpr.rsp = 0x1800;
        regs.gpr.rax = 0xdead_0000;
        let dump = dump_registers(&regs, &OnePage);

        let rsp = dump.lines().find(|l| l.contains("rsp")).unwrap();
        assert!(rsp.contains("0xabababababababab"));
        let rax = dump.lines().find(|l| l.contains("rax")).unwrap();
        assert!(rax.contains(INVALID_ACCESS));
    }

    #[test]
    fn test_dump_never_dereferences_flags_or_pc() {
        let mut regs = Amd64RegFile::zeroed();
        regs.gpr.rip = 0x1000;
        regs.gpr.rflags = 0x1000;
        let dump = dump_registers(&regs, &OnePage);
        for name in ["rflags", "rip"] {
            let line = dump.lines().find(|l| l.contains(name)).unwrap();
            assert!(!line.contains("Memory"), "{}", line);
        }
    }
}
