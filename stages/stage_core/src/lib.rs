// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stage transitions: finding, loading and entering the next program in the
//! boot chain.
//!
//! Every failure is returned to the caller, which is expected to halt; none
//! of these operations retries or falls back to another image.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use boot_config::BootConfig;
use boot_config::MemoryKind;
use boot_media::BootMedia;
use cbfs::Cbfs;
use cbfs::CbfsBackend;
use loader::bootmem::BootMem;
use loader::bootmem::BootMemType;
use loader::locate::LoaderBackend;
use loader::locate::LocateError;
use loader::locate::Locator;
use loader::run::RunError;
use loader::run::StageRunner;
use loader::selfload::selfload_check;
use loader::x86::X86PayloadQuirk;
use loader::Loader;
use loader::Prog;
use loader::ProgType;
use region::AddressSpace;
use region::MemoryRange;
use region::RegionError;
use std::convert::Infallible;
use thiserror::Error;

/// Errors returned by stage transitions.
#[derive(Debug, Error)]
#[allow(missing_docs)] // self-explanatory variants
pub enum StageError {
    #[error("failed to locate '{name}'")]
    Locate {
        name: String,
        #[source]
        err: LocateError,
    },
    #[error("failed to load stage '{name}'")]
    StageLoad {
        name: String,
        #[source]
        err: loader::stage::Error,
    },
    #[error("failed to load payload '{name}'")]
    PayloadLoad {
        name: String,
        #[source]
        err: loader::selfload::Error,
    },
    #[error("failed to run program")]
    Run(#[source] RunError),
    #[error("no payload has been loaded")]
    NoPayloadLoaded,
    #[error("backend '{name}' does not fit in the boot media")]
    BackendWindow {
        name: String,
        #[source]
        err: RegionError,
    },
    #[error("memory range {start:#x}+{size:#x} overflows")]
    BadMemoryRange { start: u64, size: u64 },
}

fn bootmem_type(kind: MemoryKind) -> BootMemType {
    match kind {
        MemoryKind::Ram => BootMemType::Ram,
        MemoryKind::Reserved => BootMemType::Reserved,
        MemoryKind::Acpi => BootMemType::Acpi,
        MemoryKind::Nvs => BootMemType::Nvs,
        MemoryKind::Unusable => BootMemType::Unusable,
        MemoryKind::Table => BootMemType::Table,
    }
}

/// The boot chain of one platform.
pub struct BootFlow {
    locator: Locator,
    loader: Loader,
    runner: StageRunner,
    config: BootConfig,
    payload: Option<Prog>,
}

impl BootFlow {
    /// Creates a boot flow from its parts.
    pub fn new(locator: Locator, loader: Loader, runner: StageRunner, config: BootConfig) -> Self {
        Self {
            locator,
            loader,
            runner,
            config,
            payload: None,
        }
    }

    /// Builds an x86 boot flow loading from `media` into `space`.
    ///
    /// Each configured backend becomes an image store window into the boot
    /// media, searched in configuration order.
    pub fn from_config(
        config: BootConfig,
        media: &BootMedia,
        space: AddressSpace,
        runner: StageRunner,
    ) -> Result<Self, StageError> {
        let mut backends: Vec<Box<dyn LoaderBackend>> = Vec::new();
        for backend in &config.backends {
            let window =
                media
                    .window(backend.offset, backend.size)
                    .map_err(|err| StageError::BackendWindow {
                        name: backend.name.clone(),
                        err,
                    })?;
            backends.push(Box::new(
                CbfsBackend::new(backend.name.clone(), Cbfs::new(window))
                    .with_active(backend.active),
            ));
        }

        let mut bootmem = BootMem::new();
        for mem in &config.memory {
            let range = MemoryRange::from_base_len(mem.start, mem.size).ok_or(
                StageError::BadMemoryRange {
                    start: mem.start,
                    size: mem.size,
                },
            )?;
            bootmem.add_range(range, bootmem_type(mem.kind));
        }

        let loader = Loader::new(space, bootmem).with_ram_quirk(X86PayloadQuirk);
        Ok(Self::new(Locator::new(backends), loader, runner, config))
    }

    /// The loader, for registering segment hooks.
    pub fn loader_mut(&mut self) -> &mut Loader {
        &mut self.loader
    }

    /// The loaded payload, if any.
    pub fn payload(&self) -> Option<&Prog> {
        self.payload.as_ref()
    }

    fn locate(&self, prog: &mut Prog) -> Result<(), StageError> {
        self.locator
            .locate(prog)
            .map_err(|err| StageError::Locate {
                name: prog.name().into(),
                err,
            })
    }

    fn load_stage(&mut self, ty: ProgType, stage: &str) -> Result<Prog, StageError> {
        let mut prog = Prog::new(ty, self.config.prog_name(stage));
        self.locate(&mut prog)?;
        loader::stage::load(&mut self.loader, &mut prog).map_err(|err| {
            StageError::StageLoad {
                name: prog.name().into(),
                err,
            }
        })?;
        Ok(prog)
    }

    /// Locates and loads `<prefix>/romstage`.
    pub fn legacy_romstage_select_and_load(&mut self) -> Result<Prog, StageError> {
        self.load_stage(ProgType::Romstage, "romstage")
    }

    /// Loads and enters the romstage.
    pub fn run_romstage(&mut self) -> Result<Infallible, StageError> {
        let romstage = self.legacy_romstage_select_and_load()?;
        self.runner.run(&romstage).map_err(StageError::Run)
    }

    /// Loads and enters the ramstage.
    pub fn run_ramstage(&mut self) -> Result<Infallible, StageError> {
        let ramstage = self.load_stage(ProgType::Ramstage, "ramstage")?;
        self.runner.run(&ramstage).map_err(StageError::Run)
    }

    /// Locates and loads `<prefix>/payload` into RAM.
    ///
    /// The payload is kept for [`BootFlow::payload_run`]. A failed load
    /// forgets any previously loaded payload.
    pub fn payload_load(&mut self) -> Result<(), StageError> {
        self.payload = None;

        let mut payload = Prog::new(ProgType::Payload, self.config.prog_name("payload"));
        self.locate(&mut payload)?;
        selfload_check(&mut self.loader, &mut payload, BootMemType::Ram).map_err(|err| {
            StageError::PayloadLoad {
                name: payload.name().into(),
                err,
            }
        })?;

        self.payload = Some(payload);
        Ok(())
    }

    /// Enters the payload, handing it the firmware tables.
    pub fn payload_run(&mut self) -> Result<Infallible, StageError> {
        let payload = self.payload.as_mut().ok_or(StageError::NoPayloadLoaded)?;
        payload.set_arg(self.config.tables_base);
        self.runner.run(payload).map_err(StageError::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boot_config::BackendConfig;
    use boot_config::MemoryConfig;
    use boot_media::BootMediaDeps;
    use cbfs::CbfsBuilder;
    use loader::notify::HookLevel;
    use loader::notify::SegmentFlags;
    use loader::notify::SegmentLoaded;
    use loader::selfload::SelfBuilder;
    use loader::stage::StageBuilder;
    use loader::x86::CpuStart;
    use loader::x86::X86Arch;
    use loader::x86::X86Register;
    use loader::CbfsType;
    use region::SparseRam;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use test_with_tracing::test;

    const ROM_SIZE: usize = 0x1_0000;
    const TABLES: u64 = 0x7000;

    /// Records entered programs as (rip, rax).
    #[derive(Clone, Default)]
    struct Cpu {
        regs: Vec<X86Register>,
        entered: Rc<RefCell<Vec<(u64, u64)>>>,
    }

    impl CpuStart for Cpu {
        fn import_vp_register(&mut self, register: X86Register) -> anyhow::Result<()> {
            self.regs.push(register);
            Ok(())
        }

        fn start(&mut self) -> anyhow::Result<Infallible> {
            let rip = self.regs.iter().find_map(|r| match r {
                X86Register::Rip(v) => Some(*v),
                _ => None,
            });
            let rax = self.regs.iter().find_map(|r| match r {
                X86Register::Rax(v) => Some(*v),
                _ => None,
            });
            self.regs.clear();
            self.entered
                .borrow_mut()
                .push((rip.unwrap_or_default(), rax.unwrap_or_default()));
            anyhow::bail!("test cpu does not execute")
        }
    }

    struct Segments(Rc<RefCell<Vec<(MemoryRange, bool)>>>);

    impl SegmentLoaded for Segments {
        fn segment_loaded(&mut self, range: MemoryRange, flags: SegmentFlags) {
            self.0.borrow_mut().push((range, flags.final_segment()));
        }
    }

    fn rom(payload: Vec<u8>) -> BootMedia {
        let mut builder = CbfsBuilder::new();
        builder
            .add_file(
                "fallback/romstage",
                CbfsType::LEGACY_STAGE,
                &StageBuilder::new(0x1_0000, 0x1_0010).build(&[0xaa; 0x40]),
            )
            .unwrap();
        builder
            .add_file(
                "fallback/ramstage",
                CbfsType::LEGACY_STAGE,
                &StageBuilder::new(0x2_0000, 0x2_0000)
                    .memlen(0x1000)
                    .build(&[0xbb; 0x80]),
            )
            .unwrap();
        builder
            .add_file("fallback/payload", CbfsType::SELF, &payload)
            .unwrap();
        let image = builder.build_padded(ROM_SIZE).unwrap();
        BootMedia::new(BootMediaDeps { rom: image.into() }).unwrap()
    }

    fn payload() -> Vec<u8> {
        SelfBuilder::new()
            .code(0x10_0000, vec![0xcc; 0x100], 0x100)
            .bss(0x10_1000, 0x1000)
            .build(0x10_0000)
    }

    fn config() -> BootConfig {
        BootConfig {
            backends: vec![BackendConfig {
                name: "ro".into(),
                offset: 0,
                size: ROM_SIZE as u64,
                active: true,
            }],
            memory: vec![
                MemoryConfig {
                    start: 0,
                    size: 0x40_0000,
                    kind: MemoryKind::Ram,
                },
                MemoryConfig {
                    start: 0x30_0000,
                    size: 0x10_0000,
                    kind: MemoryKind::Reserved,
                },
            ],
            tables_base: TABLES,
            ..BootConfig::default()
        }
    }

    fn flow(media: &BootMedia, cpu: Cpu) -> BootFlow {
        let ram = SparseRam::new([MemoryRange::new(0..0x40_0000)]);
        let space = AddressSpace::flat_32bit(Arc::new(ram));
        BootFlow::from_config(
            config(),
            media,
            space,
            StageRunner::new(X86Arch::new(cpu)),
        )
        .unwrap()
    }

    #[test]
    fn full_boot_chain() {
        let media = rom(payload());
        let cpu = Cpu::default();
        let entered = cpu.entered.clone();
        let mut flow = flow(&media, cpu);

        let segments = Rc::default();
        flow.loader_mut()
            .notifier_mut()
            .set_hook(HookLevel::Platform, Box::new(Segments(Rc::clone(&segments))));

        assert!(matches!(flow.run_romstage(), Err(StageError::Run(_))));
        assert!(matches!(flow.run_ramstage(), Err(StageError::Run(_))));
        flow.payload_load().unwrap();
        assert!(matches!(flow.payload_run(), Err(StageError::Run(_))));

        assert_eq!(
            *entered.borrow(),
            [(0x1_0010, 0), (0x2_0000, 0), (0x10_0000, TABLES)]
        );
        assert_eq!(
            *segments.borrow(),
            [
                (MemoryRange::new(0x1_0000..0x1_0040), true),
                (MemoryRange::new(0x2_0000..0x2_1000), true),
                (MemoryRange::new(0x10_0000..0x10_0100), false),
                (MemoryRange::new(0x10_1000..0x10_2000), true),
            ]
        );

        let payload = flow.payload().unwrap();
        assert_eq!(payload.start(), Some(0x10_0000));
        assert_eq!(payload.size(), 0x2000);
    }

    #[test]
    fn payload_must_be_loaded_first() {
        let media = rom(payload());
        let mut flow = flow(&media, Cpu::default());
        assert!(matches!(
            flow.payload_run(),
            Err(StageError::NoPayloadLoaded)
        ));
    }

    #[test]
    fn payload_outside_ram_is_refused() {
        let bad = SelfBuilder::new()
            .code(0x30_0000, vec![0xcc; 0x10], 0x10)
            .build(0x30_0000);
        let media = rom(bad);
        let cpu = Cpu::default();
        let entered = cpu.entered.clone();
        let mut flow = flow(&media, cpu);

        assert!(matches!(
            flow.payload_load(),
            Err(StageError::PayloadLoad {
                err: loader::selfload::Error::TargetsDisallowedMemory { .. },
                ..
            })
        ));
        assert!(flow.payload().is_none());
        assert!(matches!(
            flow.payload_run(),
            Err(StageError::NoPayloadLoaded)
        ));
        assert!(entered.borrow().is_empty());
    }

    #[test]
    fn missing_program_and_bad_backend() {
        let mut config = config();
        config.cbfs_prefix = "normal".into();
        let media = rom(payload());
        let space = AddressSpace::flat_32bit(Arc::new(SparseRam::new([])));
        let mut flow = BootFlow::from_config(
            config.clone(),
            &media,
            space.clone(),
            StageRunner::new(X86Arch::new(Cpu::default())),
        )
        .unwrap();
        assert!(matches!(
            flow.run_romstage(),
            Err(StageError::Locate {
                err: LocateError::NotFound(_),
                ..
            })
        ));

        config.backends[0].size = 2 * ROM_SIZE as u64;
        assert!(matches!(
            BootFlow::from_config(
                config,
                &media,
                space,
                StageRunner::new(X86Arch::new(Cpu::default())),
            ),
            Err(StageError::BackendWindow { .. })
        ));
    }
}
