//! Hardware buffer records handed to the back end
//!
//! Each `HwBuffer` is turned downstream into a concrete memory (SRAM bank,
//! FIFO or shift-register line buffer) plus address generators, and paced by
//! the simulator through its capacity and block sizes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ir::Expr;
use crate::schedule::{LoopLevel, StmtSchedule};

/// Configuration for the extraction pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassConfig {
    /// Deepest `for` loop nesting accepted before the pass gives up
    pub max_nest_depth: usize,
    /// Insert a `// hw_buffer ...` comment before every analysed store scope
    pub annotate: bool,
}

impl PassConfig {
    pub fn new(max_nest_depth: usize, annotate: bool) -> Self {
        Self {
            max_nest_depth,
            annotate,
        }
    }
}

impl Default for PassConfig {
    fn default() -> Self {
        Self::new(64, false)
    }
}

/// Physical organisation of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    /// Store and compute at the same level: one sliding generation
    LineBuffer,
    /// Store outside compute: one generation filled while the other drains
    DoubleBuffer,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::LineBuffer => write!(f, "line buffer"),
            BufferKind::DoubleBuffer => write!(f, "double buffer"),
        }
    }
}

/// Buffer specification for one stage.
///
/// Every per-dimension sequence follows the stage's argument order, fastest
/// dimension first. A 3x3 blur over 64-wide rows has capacity `[64, 3]`
/// (width, then window height), not `[3, 64]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwBuffer {
    pub name: String,
    pub kind: BufferKind,
    pub store_level: LoopLevel,
    pub compute_level: LoopLevel,
    /// Loops whose iterations advance the window, outer to inner
    pub streaming_loops: StmtSchedule,

    pub buffer_capacity: Vec<i64>,

    pub input_chunk_size: Vec<i64>,
    pub input_block_size: Vec<i64>,
    pub input_access_pattern: Expr,

    pub output_stencil_size: Vec<i64>,
    pub output_block_size: Vec<i64>,
    pub output_access_pattern: Expr,
}

impl HwBuffer {
    pub fn dims(&self) -> usize {
        self.buffer_capacity.len()
    }

    /// Words of storage the buffer needs, `None` when that overflows
    pub fn total_words(&self) -> Option<i64> {
        self.buffer_capacity
            .iter()
            .try_fold(1i64, |words, extent| words.checked_mul(*extent))
    }

    /// One-line summary used in diagnostic annotations
    pub fn summary(&self) -> String {
        format!(
            "{}, capacity {}, stencil {}",
            self.kind,
            list(&self.buffer_capacity),
            list(&self.output_stencil_size)
        )
    }

    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn list(values: &[i64]) -> String {
    let items: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(", "))
}

impl fmt::Display for HwBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HWBuffer {}", self.name)?;
        writeln!(f, "  Kind: {}", self.kind)?;
        writeln!(f, "  Store level: {}", self.store_level)?;
        writeln!(f, "  Compute level: {}", self.compute_level)?;
        let loops: Vec<String> = self.streaming_loops.iter().map(|s| s.to_string()).collect();
        writeln!(f, "  Streaming loops: [{}]", loops.join(", "))?;
        match self.total_words() {
            Some(words) => writeln!(
                f,
                "  Capacity: {} ({} words)",
                list(&self.buffer_capacity),
                words
            )?,
            None => writeln!(f, "  Capacity: {}", list(&self.buffer_capacity))?,
        }
        writeln!(f, "  Input chunk: {}", list(&self.input_chunk_size))?;
        writeln!(f, "  Input block: {}", list(&self.input_block_size))?;
        writeln!(f, "  Input pattern: {}", self.input_access_pattern)?;
        writeln!(f, "  Output stencil: {}", list(&self.output_stencil_size))?;
        writeln!(f, "  Output block: {}", list(&self.output_block_size))?;
        writeln!(f, "  Output pattern: {}", self.output_access_pattern)
    }
}
