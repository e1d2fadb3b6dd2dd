// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A [`LoaderBackend`] searching a [`Cbfs`] store.

use crate::Cbfs;
use loader::locate::LoaderBackend;
use loader::CbfsType;
use loader::Prog;
use loader::ProgType;

/// Locates programs by name in a store.
#[derive(Debug)]
pub struct CbfsBackend {
    name: String,
    cbfs: Cbfs,
    active: bool,
}

impl CbfsBackend {
    /// Creates an active backend over `cbfs`.
    pub fn new(name: impl Into<String>, cbfs: Cbfs) -> Self {
        Self {
            name: name.into(),
            cbfs,
            active: true,
        }
    }

    /// Sets whether the backend is consulted.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// The file type a program of type `ty` must be stored as, if any.
pub fn expected_type(ty: ProgType) -> Option<CbfsType> {
    match ty {
        ProgType::Verstage
        | ProgType::Romstage
        | ProgType::Ramstage
        | ProgType::Refcode
        | ProgType::Postcar => Some(CbfsType::LEGACY_STAGE),
        ProgType::Payload => Some(CbfsType::SELF),
        ProgType::Unknown
        | ProgType::Bootblock
        | ProgType::Bl31
        | ProgType::Bl32
        | ProgType::Opensbi => None,
    }
}

impl LoaderBackend for CbfsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_loader_active(&self, _prog: &Prog) -> anyhow::Result<bool> {
        Ok(self.active)
    }

    fn locate(&self, prog: &mut Prog) -> anyhow::Result<()> {
        let file = self.cbfs.lookup(prog.name(), expected_type(prog.ty()))?;
        let ty = file.ty();
        prog.set_source(file.into_data(), ty);
        Ok(())
    }
}
