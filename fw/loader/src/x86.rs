// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! x86 specific program hand-off.

use crate::run::ArchRun;
use crate::run::RunError;
use crate::Prog;
use crate::UsableRamQuirk;
use region::MemoryRange;
use std::convert::Infallible;

/// Top of real-mode addressable memory.
pub const LOW_MEMORY_END: u64 = 0x10_0000;

/// A segment register in its descriptor-cache form.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)] // self-explanatory fields
pub struct SegmentRegister {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub attributes: u16,
}

/// Register state programmed before entering a program.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)] // self-explanatory variants
pub enum X86Register {
    Cs(SegmentRegister),
    Ds(SegmentRegister),
    Es(SegmentRegister),
    Ss(SegmentRegister),
    Rip(u64),
    Rax(u64),
    Rflags(u64),
    Cr0(u64),
}

/// A processor that can be set up and started.
pub trait CpuStart {
    /// Sets one register of the initial state.
    fn import_vp_register(&mut self, register: X86Register) -> anyhow::Result<()>;

    /// Starts executing with the imported state.
    fn start(&mut self) -> anyhow::Result<Infallible>;
}

/// Enters programs in flat 32-bit protected mode.
///
/// The entry argument is passed in EAX.
pub struct X86Arch<C> {
    cpu: C,
}

impl<C: CpuStart> X86Arch<C> {
    /// Creates the hand-off for `cpu`.
    pub fn new(cpu: C) -> Self {
        Self { cpu }
    }

    /// The processor.
    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    fn program(&mut self, entry: u64, arg: u64) -> anyhow::Result<Infallible> {
        let mut import_reg = |register| self.cpu.import_vp_register(register);

        // Flat 4GB code and data segments.
        import_reg(X86Register::Cs(SegmentRegister {
            base: 0,
            limit: 0xffff_ffff,
            selector: 0x10,
            attributes: 0xc09b,
        }))?;
        let data = SegmentRegister {
            base: 0,
            limit: 0xffff_ffff,
            selector: 0x18,
            attributes: 0xc093,
        };
        import_reg(X86Register::Ds(data))?;
        import_reg(X86Register::Es(data))?;
        import_reg(X86Register::Ss(data))?;

        // PE and ET only, no paging.
        import_reg(X86Register::Cr0(0x11))?;
        import_reg(X86Register::Rflags(0x2))?;
        import_reg(X86Register::Rax(arg))?;
        import_reg(X86Register::Rip(entry))?;

        self.cpu.start()
    }
}

impl<C: CpuStart> ArchRun for X86Arch<C> {
    fn arch_prog_run(&mut self, prog: &Prog) -> Result<Infallible, RunError> {
        // StageRunner only hands over loaded programs.
        let entry = prog.entry().unwrap_or_default();
        let arg = prog.entry_arg();
        if entry > u32::MAX.into() {
            return Err(RunError::Transfer {
                name: prog.name().into(),
                entry,
                source: anyhow::anyhow!("entry point is not reachable in 32-bit mode"),
            });
        }
        if arg > u32::MAX.into() {
            return Err(RunError::Transfer {
                name: prog.name().into(),
                entry,
                source: anyhow::anyhow!("argument {arg:#x} does not fit in EAX"),
            });
        }

        self.program(entry, arg).map_err(|source| RunError::Transfer {
            name: prog.name().into(),
            entry,
            source,
        })
    }
}

/// Lets payloads load anywhere below 1MB.
///
/// Legacy payloads routinely place themselves in the real-mode area, which the
/// boot memory map reserves for tables and option ROMs.
#[derive(Debug, Default)]
pub struct X86PayloadQuirk;

impl UsableRamQuirk for X86PayloadQuirk {
    fn usable_ram_quirk(&self, range: MemoryRange) -> bool {
        if range.start() < LOW_MEMORY_END && range.end() <= LOW_MEMORY_END {
            tracing::debug!(%range, "payload allowed in low memory");
            return true;
        }
        false
    }
}
