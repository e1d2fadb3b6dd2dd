// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Finding a program's stored image.

use crate::Prog;
use thiserror::Error;

/// A source of stored program images.
pub trait LoaderBackend {
    /// Name used in log messages.
    fn name(&self) -> &str;

    /// Returns whether this backend should be asked for `prog`.
    fn is_loader_active(&self, prog: &Prog) -> anyhow::Result<bool>;

    /// Binds the stored image of `prog`, see [`Prog::set_source`].
    fn locate(&self, prog: &mut Prog) -> anyhow::Result<()>;
}

/// Policy consulted before any backend is searched.
///
/// Only the type and name of the program are meaningful at that point.
pub trait LocateHook {
    /// Returns true to allow locating `prog`.
    fn allow(&self, prog: &Prog) -> bool;
}

/// Allows every lookup.
#[derive(Debug, Default)]
pub struct AllowAll;

impl LocateHook for AllowAll {
    fn allow(&self, _prog: &Prog) -> bool {
        true
    }
}

/// Errors returned by [`Locator::locate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocateError {
    /// The locate hook vetoed the lookup.
    #[error("locating '{0}' was denied by policy")]
    PolicyDenied(String),
    /// No backend was active for the program.
    #[error("no active loader for '{0}'")]
    NoActiveLoader(String),
    /// Every active backend failed to find the program.
    #[error("'{0}' not found")]
    NotFound(String),
}

/// Tries a fixed, prioritized list of backends.
pub struct Locator {
    hook: Box<dyn LocateHook>,
    backends: Vec<Box<dyn LoaderBackend>>,
}

impl Locator {
    /// Creates a locator trying `backends` in order.
    pub fn new(backends: Vec<Box<dyn LoaderBackend>>) -> Self {
        Self {
            hook: Box::new(AllowAll),
            backends,
        }
    }

    /// Replaces the locate policy hook.
    pub fn with_hook(mut self, hook: impl LocateHook + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    /// Names of the backends, in priority order.
    pub fn backend_names(&self) -> impl Iterator<Item = &str> {
        self.backends.iter().map(|b| b.name())
    }

    /// Binds the stored image of `prog` from the first backend that is
    /// active and finds it.
    pub fn locate(&self, prog: &mut Prog) -> Result<(), LocateError> {
        if !self.hook.allow(prog) {
            tracing::warn!(name = prog.name(), ty = %prog.ty(), "locate denied by policy");
            return Err(LocateError::PolicyDenied(prog.name().into()));
        }

        let mut any_active = false;
        for backend in &self.backends {
            match backend.is_loader_active(prog) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(backend = backend.name(), "loader inactive");
                    continue;
                }
                Err(err) => {
                    tracing::error!(backend = backend.name(), error = ?err, "loader failure");
                    continue;
                }
            }

            any_active = true;
            tracing::debug!(backend = backend.name(), "loader active");
            if let Err(err) = backend.locate(prog) {
                tracing::debug!(
                    backend = backend.name(),
                    name = prog.name(),
                    error = ?err,
                    "locate failed"
                );
                continue;
            }

            tracing::debug!(
                backend = backend.name(),
                name = prog.name(),
                offset = prog.source().map(|s| s.root_offset()),
                size = prog.size(),
                "located"
            );
            return Ok(());
        }

        if any_active {
            Err(LocateError::NotFound(prog.name().into()))
        } else {
            Err(LocateError::NoActiveLoader(prog.name().into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CbfsType;
    use crate::ProgType;
    use region::MemRegionDevice;
    use std::cell::RefCell;
    use std::rc::Rc;
    use test_with_tracing::test;

    #[derive(Default)]
    struct Calls {
        active: Vec<&'static str>,
        locate: Vec<&'static str>,
    }

    struct SpyBackend {
        name: &'static str,
        active: anyhow::Result<bool>,
        has: &'static [&'static str],
        calls: Rc<RefCell<Calls>>,
    }

    impl LoaderBackend for SpyBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn is_loader_active(&self, _prog: &Prog) -> anyhow::Result<bool> {
            self.calls.borrow_mut().active.push(self.name);
            match &self.active {
                Ok(v) => Ok(*v),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }

        fn locate(&self, prog: &mut Prog) -> anyhow::Result<()> {
            self.calls.borrow_mut().locate.push(self.name);
            if !self.has.iter().any(|&n| n == prog.name()) {
                anyhow::bail!("{} has no {}", self.name, prog.name());
            }
            prog.set_source(
                MemRegionDevice::new(self.name.as_bytes().to_vec()),
                CbfsType::STAGE,
            );
            Ok(())
        }
    }

    fn backend(
        name: &'static str,
        active: anyhow::Result<bool>,
        has: &'static [&'static str],
        calls: &Rc<RefCell<Calls>>,
    ) -> Box<dyn LoaderBackend> {
        Box::new(SpyBackend {
            name,
            active,
            has,
            calls: calls.clone(),
        })
    }

    struct DenyRomstage;

    impl LocateHook for DenyRomstage {
        fn allow(&self, prog: &Prog) -> bool {
            prog.ty() != ProgType::Romstage
        }
    }

    #[test]
    fn first_successful_backend_wins() {
        let calls = Rc::default();
        let locator = Locator::new(vec![
            backend("inactive", Ok(false), &["a"], &calls),
            backend("broken", Err(anyhow::anyhow!("bad")), &["a"], &calls),
            backend("rw", Ok(true), &["b"], &calls),
            backend("ro", Ok(true), &["a", "b"], &calls),
            backend("never", Ok(true), &["a"], &calls),
        ]);

        let mut prog = Prog::new(ProgType::Ramstage, "a");
        locator.locate(&mut prog).unwrap();
        assert_eq!(prog.source().unwrap().as_bytes(), b"ro");
        assert_eq!(prog.cbfs_type(), CbfsType::STAGE);

        let calls = calls.borrow();
        assert_eq!(calls.active, ["inactive", "broken", "rw", "ro"]);
        assert_eq!(calls.locate, ["rw", "ro"]);
    }

    #[test]
    fn veto_skips_backends() {
        let calls = Rc::default();
        let locator = Locator::new(vec![backend("ro", Ok(true), &["romstage"], &calls)])
            .with_hook(DenyRomstage);

        let mut prog = Prog::new(ProgType::Romstage, "romstage");
        assert_eq!(
            locator.locate(&mut prog),
            Err(LocateError::PolicyDenied("romstage".into()))
        );
        assert!(calls.borrow().active.is_empty());
        assert!(calls.borrow().locate.is_empty());
        assert!(prog.source().is_none());
    }

    #[test]
    fn not_found_versus_no_active_loader() {
        let calls = Rc::default();
        let locator = Locator::new(vec![
            backend("off", Ok(false), &["x"], &calls),
            backend("ro", Ok(true), &[], &calls),
        ]);
        let mut prog = Prog::new(ProgType::Payload, "x");
        assert_eq!(
            locator.locate(&mut prog),
            Err(LocateError::NotFound("x".into()))
        );

        let locator = Locator::new(vec![backend("off", Ok(false), &["x"], &calls)]);
        assert_eq!(
            locator.locate(&mut prog),
            Err(LocateError::NoActiveLoader("x".into()))
        );
        assert_eq!(
            Locator::new(Vec::new()).locate(&mut prog),
            Err(LocateError::NoActiveLoader("x".into()))
        );
    }
}
