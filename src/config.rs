//! Engine limits and collector tuning

use crate::vm::{FRAMES_MAX, STACK_MAX};

/// Knobs for a [`Vm`](crate::vm::Vm). `Default` matches the classic limits:
/// 64 frames, 256 slots per frame, first collection at 1 MiB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Maximum call depth before "Stack overflow."
    pub frames_max: usize,
    /// Maximum operand stack size
    pub stack_max: usize,
    /// Bytes allocated before the first collection
    pub gc_initial_threshold: usize,
    /// Floor for the threshold computed after each collection
    pub gc_min_threshold: usize,
    /// Next threshold = live bytes * this factor
    pub gc_heap_grow_factor: usize,
    /// Collect before every allocation
    pub stress_gc: bool,
    /// Paint runtime error headers red
    pub color_diagnostics: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            frames_max: FRAMES_MAX,
            stack_max: STACK_MAX,
            gc_initial_threshold: 1024 * 1024,
            gc_min_threshold: 1024 * 1024,
            gc_heap_grow_factor: 2,
            stress_gc: false,
            color_diagnostics: false,
        }
    }
}

impl VmConfig {
    pub fn stress() -> Self {
        Self { stress_gc: true, ..Self::default() }
    }

    pub fn with_frames_max(mut self, frames_max: usize) -> Self {
        self.frames_max = frames_max;
        self
    }

    pub fn with_stack_max(mut self, stack_max: usize) -> Self {
        self.stack_max = stack_max;
        self
    }

    pub fn with_gc_threshold(mut self, initial: usize, min: usize) -> Self {
        self.gc_initial_threshold = initial;
        self.gc_min_threshold = min;
        self
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color_diagnostics = color;
        self
    }
}
