//! Hardware buffer extraction pass
//!
//! Visits store scopes inner first, so every producer is handled before the
//! consumers around it. Each flagged stage goes through the same straight
//! pipeline: locate the streaming loops, analyse the accesses, size the
//! buffer and record it. The first failure aborts the whole pass.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use log::{debug, trace, warn};

use crate::analyzer::{StencilAnalyzer, Window};
use crate::error::{PassError, PassResult};
use crate::hardware::{BufferKind, HwBuffer, PassConfig};
use crate::ir::Stmt;
use crate::ir_utils::{
    find_loop, find_store_scope, let_chain_exceeds, nesting_exceeds, produces_at_level,
    realize_order, substitute_in_constants, StoreScope, MAX_LET_CHAIN,
};
use crate::loop_levels::streaming_loops;
use crate::schedule::{Environment, LoopLevel, Stage};
use crate::sizing::{BufferPlanner, ComputeRegion};

/// Result of a pass invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedBuffers {
    /// The input tree, annotated when the config asks for it
    pub stmt: Stmt,
    /// Buffer specification per stage name
    pub buffers: BTreeMap<String, HwBuffer>,
}

/// Hardware buffer extractor
pub struct HwBufferExtractor {
    config: PassConfig,
}

impl HwBufferExtractor {
    pub fn new(config: PassConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PassConfig {
        &self.config
    }

    /// Extract a buffer for every flagged stage that has a store scope
    pub fn run(&self, stmt: &Stmt, env: &Environment) -> PassResult<ExtractedBuffers> {
        if nesting_exceeds(stmt, self.config.max_nest_depth) {
            return Err(PassError::NestingTooDeep {
                limit: self.config.max_nest_depth,
            });
        }
        if let_chain_exceeds(stmt, MAX_LET_CHAIN) {
            return Err(PassError::NestingTooDeep {
                limit: MAX_LET_CHAIN,
            });
        }

        let program = substitute_in_constants(stmt);
        let order = realize_order(&program);

        for stage in env.stages().filter(|s| s.schedule.hw_buffer) {
            if !order.contains(&stage.name.as_str()) {
                warn!("{}: no store scope, stage is inlined; skipping", stage.name);
            }
        }

        let mut buffers = BTreeMap::new();
        for name in order {
            if buffers.contains_key(name) {
                continue;
            }
            let Some(stage) = env.get(name) else {
                trace!("{}: not in the environment; skipping", name);
                continue;
            };
            if !stage.schedule.hw_buffer {
                continue;
            }

            let buffer = self.extract_stage(&program, stage, env)?;
            debug!("{}: {}", name, buffer.summary());
            buffers.insert(name.to_string(), buffer);
        }

        let stmt = if self.config.annotate {
            annotate(stmt, &buffers)
        } else {
            stmt.clone()
        };
        Ok(ExtractedBuffers { stmt, buffers })
    }

    /// Locate, analyse and size one stage
    fn extract_stage(&self, program: &Stmt, stage: &Stage, env: &Environment) -> PassResult<HwBuffer> {
        let name = stage.name.as_str();
        let store = &stage.schedule.store_level;
        let compute = &stage.schedule.compute_level;

        let host = host_stage(stage, env)?;
        let kind = match host.compare_levels(name, store, compute)? {
            Ordering::Equal => BufferKind::LineBuffer,
            Ordering::Less => BufferKind::DoubleBuffer,
            Ordering::Greater => {
                return Err(PassError::inconsistent(
                    name,
                    store,
                    compute,
                    "store level is nested inside the compute level",
                ))
            }
        };

        let scope = find_store_scope(program, name)
            .ok_or_else(|| PassError::sizing(name, "store scope disappeared"))?;
        check_placement(stage, host, &scope)?;

        let (streaming, region) = match kind {
            BufferKind::LineBuffer => {
                let streaming = streaming_loops(
                    name,
                    scope.body,
                    host,
                    compute,
                    &LoopLevel::Innermost,
                    true,
                )?;
                let region = ComputeRegion {
                    produced_at_level: produces_at_level(scope.body, name),
                    tile: Window::Footprint,
                };
                (streaming, region)
            }
            BufferKind::DoubleBuffer => {
                let inconsistent = |reason: String| PassError::inconsistent(name, store, compute, reason);
                let compute_loop = host
                    .level_loop(compute)
                    .ok_or_else(|| inconsistent(format!("`{}` names no loop", compute)))?;
                let Some(Stmt::For { body, .. }) = find_loop(scope.body, &compute_loop) else {
                    return Err(inconsistent(format!(
                        "compute loop `{}` is not inside the store scope",
                        compute_loop
                    )));
                };
                let streaming = streaming_loops(name, scope.body, host, store, compute, true)?;
                let region = ComputeRegion {
                    produced_at_level: produces_at_level(body, name),
                    tile: Window::Within(compute_loop),
                };
                (streaming, region)
            }
        };

        let loops: Vec<String> = streaming.iter().map(|s| s.to_string()).collect();
        debug!(
            "{}: {} in the nest of `{}`, streaming over [{}]",
            name,
            kind,
            host.name,
            loops.join(", ")
        );

        let analysis = StencilAnalyzer::new(env).analyze(&scope)?;
        let sizes = BufferPlanner::new(name, kind, &streaming).plan(&analysis, &region)?;

        Ok(HwBuffer {
            name: name.to_string(),
            kind,
            store_level: store.clone(),
            compute_level: compute.clone(),
            streaming_loops: streaming,
            buffer_capacity: sizes.capacity,
            input_chunk_size: sizes.input_chunk,
            input_block_size: sizes.input_block,
            input_access_pattern: sizes.input_pattern,
            output_stencil_size: sizes.output_stencil,
            output_block_size: sizes.output_block,
            output_access_pattern: sizes.output_pattern,
        })
    }
}

impl Default for HwBufferExtractor {
    fn default() -> Self {
        Self::new(PassConfig::default())
    }
}

/// The stage whose loop nest the store and compute levels point into
fn host_stage<'e>(stage: &'e Stage, env: &'e Environment) -> PassResult<&'e Stage> {
    let schedule = &stage.schedule;
    match (schedule.store_level.stage(), schedule.compute_level.stage()) {
        (Some(a), Some(b)) if a != b => Err(PassError::inconsistent(
            &stage.name,
            &schedule.store_level,
            &schedule.compute_level,
            format!("store level is in the nest of `{}`, compute level in `{}`", a, b),
        )),
        (Some(host), _) | (None, Some(host)) => env.require(&stage.name, host),
        (None, None) => Ok(stage),
    }
}

/// The store scope must sit inside the loops its levels name, and nothing
/// at or outside the compute loop may run in parallel.
fn check_placement(stage: &Stage, host: &Stage, scope: &StoreScope<'_>) -> PassResult<()> {
    let store = &stage.schedule.store_level;
    let compute = &stage.schedule.compute_level;
    let position = |level: &LoopLevel| {
        host.level_loop(level)
            .and_then(|name| scope.enclosing_loops.iter().position(|f| f.name == name))
    };

    if let LoopLevel::At { .. } = store {
        if let Some(loop_name) = host.level_loop(store) {
            if position(store).is_none() {
                return Err(PassError::inconsistent(
                    &stage.name,
                    store,
                    compute,
                    format!("store scope is not inside loop `{}`", loop_name),
                ));
            }
        }
    }

    // A compute loop inside the store scope has every enclosing frame outside it
    let outside = match position(compute) {
        Some(index) => &scope.enclosing_loops[..=index],
        None => &scope.enclosing_loops[..],
    };
    if let Some(frame) = outside.iter().find(|f| !f.kind.is_sequential()) {
        let message = match host.level_loop(compute) {
            Some(name) if name == frame.name => format!("compute loop `{}` is {}", name, frame.kind),
            _ => format!(
                "compute level `{}` is nested inside {} loop `{}`",
                compute, frame.kind, frame.name
            ),
        };
        return Err(PassError::sizing(&stage.name, message));
    }
    Ok(())
}

/// Put a `// hw_buffer` comment in front of every store scope with a buffer
fn annotate(stmt: &Stmt, buffers: &BTreeMap<String, HwBuffer>) -> Stmt {
    match stmt {
        Stmt::Realize { name, bounds, body } => {
            let realize = Stmt::realize(name.clone(), bounds.clone(), annotate(body, buffers));
            match buffers.get(name) {
                Some(buffer) => Stmt::block(vec![
                    Stmt::Comment(format!("hw_buffer {}: {}", name, buffer.summary())),
                    realize,
                ]),
                None => realize,
            }
        }
        Stmt::Block(stmts) => Stmt::block(stmts.iter().map(|s| annotate(s, buffers)).collect()),
        Stmt::For {
            name,
            min,
            extent,
            kind,
            body,
        } => Stmt::for_loop(name.clone(), min.clone(), extent.clone(), *kind, annotate(body, buffers)),
        Stmt::LetStmt { name, value, body } => {
            Stmt::let_stmt(name.clone(), value.clone(), annotate(body, buffers))
        }
        Stmt::Provide { .. } | Stmt::Evaluate(_) | Stmt::Comment(_) => stmt.clone(),
    }
}
