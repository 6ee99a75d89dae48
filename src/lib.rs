//! Hardware buffer extraction for scheduled stencil pipelines
//!
//! This library finds every pipeline stage scheduled for hardware buffering
//! and derives the parameters of the line buffer or double buffer that holds
//! its output: capacity, chunk and block sizes, stencil window and address
//! patterns.
//!
//! # Example
//!
//! ```rust
//! use hw_buffers::{extract_hw_buffers, parse_stmt, Environment, LoopLevel, Stage};
//!
//! let program = parse_stmt("
//!     realize f([0, 16]) {
//!       for (f.x, 0, 16) { f(f.x) = input(f.x) }
//!       for (g.x, 0, 14) { g(g.x) = f(g.x) + f(g.x + 1) + f(g.x + 2) }
//!     }").unwrap();
//! let env = Environment::new()
//!     .with(Stage::new("f", ["x"], ["x"]).hw_buffer())
//!     .with(Stage::new("g", ["x"], ["x"]));
//!
//! let result = extract_hw_buffers(&program, &env).unwrap();
//! assert_eq!(result.buffers["f"].output_stencil_size, vec![3]);
//! ```

pub mod analyzer;
pub mod error;
pub mod extract;
pub mod hardware;
pub mod ir;
pub mod ir_utils;
pub mod lexer;
pub mod loop_levels;
pub mod parser;
pub mod schedule;
pub mod sizing;

use serde::{Deserialize, Serialize};

pub use analyzer::{Affine, StencilAnalyzer, Window};
pub use error::{NotConstant, PassError, PassResult};
pub use extract::{ExtractedBuffers, HwBufferExtractor};
pub use hardware::{BufferKind, HwBuffer, PassConfig};
pub use ir::{BinOp, Expr, ForKind, Range, Stmt};
pub use loop_levels::loop_levels_between;
pub use parser::{parse_expr, parse_stmt};
pub use schedule::{Environment, LoopLevel, Stage, StageSchedule, StmtSchedule, VarSpec};
pub use sizing::BufferPlanner;

/// Run the pass with the default configuration
pub fn extract_hw_buffers(stmt: &Stmt, env: &Environment) -> PassResult<ExtractedBuffers> {
    HwBufferExtractor::default().run(stmt, env)
}

/// A scheduled program in IR text together with its stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub program: String,
    pub stages: Vec<Stage>,
}

impl PipelineSpec {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Read the program text and build the environment
    pub fn parse(&self) -> PassResult<(Stmt, Environment)> {
        let stmt = parse_stmt(&self.program)?;
        let env = Environment::from(self.stages.clone());
        Ok((stmt, env))
    }

    /// Parse and extract in one go
    pub fn run(&self, config: PassConfig) -> PassResult<ExtractedBuffers> {
        let (stmt, env) = self.parse()?;
        HwBufferExtractor::new(config).run(&stmt, &env)
    }
}
