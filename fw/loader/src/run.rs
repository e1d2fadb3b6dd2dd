// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transferring control to a loaded program.

use crate::Prog;
use std::convert::Infallible;
use thiserror::Error;

/// Platform (SoC or chipset) work done right before the architecture hands
/// off to a program.
pub trait PlatformRun {
    /// Called before [`ArchRun::arch_prog_run`].
    fn platform_prog_run(&mut self, prog: &Prog);
}

/// A platform with nothing to do before running a program.
#[derive(Debug, Default)]
pub struct NoopPlatform;

impl PlatformRun for NoopPlatform {
    fn platform_prog_run(&mut self, _prog: &Prog) {}
}

/// The architecture's control transfer.
pub trait ArchRun {
    /// Enters `prog`. Only returns if the transfer could not be made.
    fn arch_prog_run(&mut self, prog: &Prog) -> Result<Infallible, RunError>;
}

/// Errors returned by [`StageRunner::run`].
#[derive(Debug, Error)]
pub enum RunError {
    /// The architecture could not transfer control.
    #[error("failed to enter '{name}' at {entry:#x}")]
    Transfer {
        /// Program name.
        name: String,
        /// Entry point.
        entry: u64,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },
}

/// Runs loaded programs.
pub struct StageRunner {
    platform: Box<dyn PlatformRun>,
    arch: Box<dyn ArchRun>,
}

impl StageRunner {
    /// Creates a runner using `arch` for the final transfer.
    pub fn new(arch: impl ArchRun + 'static) -> Self {
        Self {
            platform: Box::new(NoopPlatform),
            arch: Box::new(arch),
        }
    }

    /// Replaces the platform pre-run hook.
    pub fn with_platform(mut self, platform: impl PlatformRun + 'static) -> Self {
        self.platform = Box::new(platform);
        self
    }

    /// Transfers control to `prog`.
    ///
    /// There is no success value: on success control never comes back.
    ///
    /// # Panics
    ///
    /// Panics if `prog` has not been loaded. Callers must only run programs
    /// that a loader accepted.
    pub fn run(&mut self, prog: &Prog) -> Result<Infallible, RunError> {
        assert!(
            prog.is_loaded(),
            "running program '{}' that was not loaded",
            prog.name()
        );

        tracing::info!(
            name = prog.name(),
            ty = %prog.ty(),
            entry = prog.entry(),
            arg = prog.entry_arg(),
            "jumping to program"
        );
        self.platform.platform_prog_run(prog);
        self.arch.arch_prog_run(prog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CbfsType;
    use crate::ProgType;
    use region::AddressSpace;
    use region::MemRegionDevice;
    use region::MemoryRange;
    use region::SparseRam;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;
    use test_with_tracing::test;

    type Log = Rc<RefCell<Vec<String>>>;

    struct SpyPlatform(Log);

    impl PlatformRun for SpyPlatform {
        fn platform_prog_run(&mut self, prog: &Prog) {
            self.0.borrow_mut().push(format!("platform {}", prog.name()));
        }
    }

    struct SpyArch(Log);

    impl ArchRun for SpyArch {
        fn arch_prog_run(&mut self, prog: &Prog) -> Result<Infallible, RunError> {
            let entry = prog.entry().unwrap();
            self.0
                .borrow_mut()
                .push(format!("arch {entry:#x} {:#x}", prog.entry_arg()));
            Err(RunError::Transfer {
                name: prog.name().into(),
                entry,
                source: anyhow::anyhow!("no cpu in unit tests"),
            })
        }
    }

    fn loaded_prog() -> Prog {
        let space = AddressSpace::flat_32bit(Arc::new(SparseRam::new([MemoryRange::new(
            0x1000..0x2000,
        )])));
        let mut prog = Prog::new(ProgType::Payload, "fallback/payload");
        prog.memory_init(&space, 0x1000, 0x1000);
        prog.set_entry(0x1200, 0x55);
        prog
    }

    #[test]
    fn platform_runs_before_arch() {
        let log = Log::default();
        let mut runner =
            StageRunner::new(SpyArch(log.clone())).with_platform(SpyPlatform(log.clone()));

        let err = runner.run(&loaded_prog()).unwrap_err();
        assert!(matches!(err, RunError::Transfer { entry: 0x1200, .. }));
        assert_eq!(
            *log.borrow(),
            ["platform fallback/payload", "arch 0x1200 0x55"]
        );
    }

    #[test]
    #[should_panic(expected = "was not loaded")]
    fn running_unloaded_program_is_a_contract_violation() {
        let log = Log::default();
        let mut runner = StageRunner::new(SpyArch(log));
        let mut prog = Prog::new(ProgType::Payload, "fallback/payload");
        prog.set_source(MemRegionDevice::new(vec![0; 4]), CbfsType::SELF);
        let _ = runner.run(&prog);
    }
}
