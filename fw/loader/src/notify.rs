// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Notification of segments placed in memory.
//!
//! Every segment a loader places in memory is reported to three hooks, always
//! in the same order: the generic hook, then the platform hook, then the
//! architecture hook. Architecture cache and MMU maintenance can therefore
//! rely on platform memory map adjustments having been made already.

use bitfield_struct::bitfield;
use region::MemoryRange;

/// Flags passed along with a loaded segment.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct SegmentFlags {
    /// This is the last segment of the program.
    pub final_segment: bool,
    #[bits(31)]
    _reserved: u32,
}

/// Observer of segments placed in memory.
pub trait SegmentLoaded {
    /// Called once per segment, after its bytes are in place.
    fn segment_loaded(&mut self, range: MemoryRange, flags: SegmentFlags);
}

/// A hook that does nothing.
#[derive(Debug, Default)]
pub struct NoopSegmentHook;

impl SegmentLoaded for NoopSegmentHook {
    fn segment_loaded(&mut self, _range: MemoryRange, _flags: SegmentFlags) {}
}

/// The position of a hook in the notification chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HookLevel {
    /// Runs first.
    Generic,
    /// Runs after the generic hook.
    Platform,
    /// Runs last.
    Arch,
}

/// The fixed generic -> platform -> arch hook chain.
pub struct SegmentNotifier {
    generic: Box<dyn SegmentLoaded>,
    platform: Box<dyn SegmentLoaded>,
    arch: Box<dyn SegmentLoaded>,
}

impl SegmentNotifier {
    /// Creates a chain of no-op hooks.
    pub fn new() -> Self {
        Self {
            generic: Box::new(NoopSegmentHook),
            platform: Box::new(NoopSegmentHook),
            arch: Box::new(NoopSegmentHook),
        }
    }

    /// Replaces the hook at `level`.
    pub fn with_hook(mut self, level: HookLevel, hook: impl SegmentLoaded + 'static) -> Self {
        self.set_hook(level, Box::new(hook));
        self
    }

    /// Replaces the hook at `level`.
    pub fn set_hook(&mut self, level: HookLevel, hook: Box<dyn SegmentLoaded>) {
        match level {
            HookLevel::Generic => self.generic = hook,
            HookLevel::Platform => self.platform = hook,
            HookLevel::Arch => self.arch = hook,
        }
    }

    /// Reports a loaded segment to every hook, in order.
    pub fn notify(&mut self, range: MemoryRange, flags: SegmentFlags) {
        tracing::trace!(%range, final_segment = flags.final_segment(), "segment loaded");
        self.generic.segment_loaded(range, flags);
        self.platform.segment_loaded(range, flags);
        self.arch.segment_loaded(range, flags);
    }
}

impl Default for SegmentNotifier {
    fn default() -> Self {
        Self::new()
    }
}
