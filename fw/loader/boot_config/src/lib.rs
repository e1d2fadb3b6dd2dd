// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration for the boot flow, as read from a JSON description of the
//! board.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::Deserialize;
use serde::Serialize;

/// Top level boot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct BootConfig {
    /// Prefix of the stage and payload names, e.g. `fallback`.
    #[serde(default = "default_prefix")]
    pub cbfs_prefix: String,
    /// Image stores to search, in priority order.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Boot memory map.
    #[serde(default)]
    pub memory: Vec<MemoryConfig>,
    /// Address of the coreboot tables, passed to the payload.
    #[serde(default)]
    pub tables_base: u64,
}

fn default_prefix() -> String {
    "fallback".into()
}

fn default_true() -> bool {
    true
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            cbfs_prefix: default_prefix(),
            backends: Vec::new(),
            memory: Vec::new(),
            tables_base: 0,
        }
    }
}

impl BootConfig {
    /// Name of a stage or payload under the configured prefix.
    pub fn prog_name(&self, prog: &str) -> String {
        format!("{}/{}", self.cbfs_prefix, prog)
    }
}

/// An image store within the boot media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct BackendConfig {
    /// Name used in logs.
    pub name: String,
    /// Offset of the store in the boot media.
    pub offset: u64,
    /// Size of the store.
    pub size: u64,
    /// Whether the store is searched at all.
    #[serde(default = "default_true")]
    pub active: bool,
}

/// One boot memory map entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct MemoryConfig {
    /// Base address.
    pub start: u64,
    /// Length in bytes.
    pub size: u64,
    /// Classification.
    pub kind: MemoryKind,
}

/// Memory classifications available to board configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)] // self-explanatory variants
pub enum MemoryKind {
    Ram,
    Reserved,
    Acpi,
    Nvs,
    Unusable,
    Table,
}
