//! Loop levels between two points of a stage's nest
//!
//! The streaming loops of a buffer are the loops of its host nest that run
//! between the store level and the compute level. They are found by walking
//! the host's loop chain in the IR and slicing it at the two levels.

use crate::error::{PassError, PassResult};
use crate::ir::{Expr, ForKind, Stmt};
use crate::ir_utils::{fold_to_int, substitute, Scope};
use crate::schedule::{LoopLevel, Stage, StmtSchedule, VarSpec};

/// One loop of a host chain as it appears in the IR
#[derive(Debug, Clone, PartialEq)]
struct ChainLoop {
    name: String,
    min: Expr,
    extent: Expr,
    kind: ForKind,
}

impl ChainLoop {
    /// Loops that run a single iteration at a known index collapse to constants.
    fn to_spec(&self) -> VarSpec {
        match (fold_to_int(&self.extent), fold_to_int(&self.min)) {
            (Ok(1), Ok(min)) => VarSpec::constant(min),
            _ => VarSpec::new(self.name.clone(), self.min.clone(), self.extent.clone()),
        }
    }
}

/// Loops of `host`'s nest in `stmt`, outer to inner, strictly inside
/// `outer_exclusive` and down to `inner_inclusive`.
///
/// With `start_inside`, `stmt` is taken to already sit inside
/// `outer_exclusive` and collection starts at the first host loop.
pub fn loop_levels_between(
    stmt: &Stmt,
    host: &Stage,
    outer_exclusive: &LoopLevel,
    inner_inclusive: &LoopLevel,
    start_inside: bool,
) -> PassResult<StmtSchedule> {
    let chain = slice_chain(
        &host.name,
        stmt,
        host,
        outer_exclusive,
        inner_inclusive,
        start_inside,
    )?;
    Ok(chain.iter().map(ChainLoop::to_spec).collect())
}

/// Streaming loops for `subject`'s buffer. Every loop that still iterates
/// must be serial.
pub fn streaming_loops(
    subject: &str,
    stmt: &Stmt,
    host: &Stage,
    outer_exclusive: &LoopLevel,
    inner_inclusive: &LoopLevel,
    start_inside: bool,
) -> PassResult<StmtSchedule> {
    let chain = slice_chain(
        subject,
        stmt,
        host,
        outer_exclusive,
        inner_inclusive,
        start_inside,
    )?;

    let mut schedule = StmtSchedule::with_capacity(chain.len());
    for lp in &chain {
        let spec = lp.to_spec();
        if !spec.is_const() && !lp.kind.is_sequential() {
            return Err(PassError::NonSequentialStreamingLoop {
                stage: subject.to_string(),
                loop_name: lp.name.clone(),
                kind: lp.kind,
            });
        }
        schedule.push(spec);
    }
    Ok(schedule)
}

fn slice_chain(
    subject: &str,
    stmt: &Stmt,
    host: &Stage,
    outer: &LoopLevel,
    inner: &LoopLevel,
    start_inside: bool,
) -> PassResult<Vec<ChainLoop>> {
    let fail = |reason: String| PassError::inconsistent(subject, outer, inner, reason);

    let names = host.loop_names();
    let chain = collect_chain(stmt, &names);

    // The chain must follow the nest order declared for the host
    let positions: Vec<usize> = chain
        .iter()
        .filter_map(|lp| names.iter().position(|n| n == &lp.name))
        .collect();
    if positions.windows(2).any(|w| w[0] >= w[1]) {
        return Err(fail(format!(
            "loops of `{}` appear out of nest order",
            host.name
        )));
    }

    let start = match (outer, start_inside) {
        (LoopLevel::Root, _) | (_, true) => 0,
        (level, false) => {
            let Some(name) = host.level_loop(level) else {
                return Ok(Vec::new());
            };
            chain
                .iter()
                .position(|lp| lp.name == name)
                .map(|i| i + 1)
                .ok_or_else(|| fail(format!("loop `{}` not found", name)))?
        }
    };

    let end = match inner {
        LoopLevel::Root => start,
        LoopLevel::Innermost => chain.len(),
        level => {
            let name = host
                .level_loop(level)
                .ok_or_else(|| fail(format!("`{}` names no loop", level)))?;
            chain
                .iter()
                .position(|lp| lp.name == name)
                .map(|i| i + 1)
                .ok_or_else(|| fail(format!("loop `{}` not found", name)))?
        }
    };

    if end < start {
        return Err(fail("inner level encloses the outer level".to_string()));
    }
    Ok(chain[start..end].to_vec())
}

/// Follow the host's loops downward. At a block, the first statement that
/// holds a host loop continues the chain.
fn collect_chain(stmt: &Stmt, names: &[String]) -> Vec<ChainLoop> {
    fn holds_host_loop(stmt: &Stmt, names: &[String]) -> bool {
        match stmt {
            Stmt::For { name, body, .. } => {
                names.contains(name) || holds_host_loop(body, names)
            }
            Stmt::Realize { body, .. } | Stmt::LetStmt { body, .. } => holds_host_loop(body, names),
            Stmt::Block(stmts) => stmts.iter().any(|s| holds_host_loop(s, names)),
            Stmt::Provide { .. } | Stmt::Evaluate(_) | Stmt::Comment(_) => false,
        }
    }

    fn walk(stmt: &Stmt, names: &[String], lets: &mut Scope, chain: &mut Vec<ChainLoop>) {
        match stmt {
            Stmt::For {
                name,
                min,
                extent,
                kind,
                body,
            } => {
                if names.contains(name) {
                    chain.push(ChainLoop {
                        name: name.clone(),
                        min: substitute(min, lets),
                        extent: substitute(extent, lets),
                        kind: *kind,
                    });
                }
                let shadowed = lets.remove(name);
                walk(body, names, lets, chain);
                if let Some(value) = shadowed {
                    lets.insert(name.clone(), value);
                }
            }
            Stmt::Realize { body, .. } => walk(body, names, lets, chain),
            Stmt::LetStmt { name, value, body } => {
                let value = substitute(value, lets);
                let previous = lets.insert(name.clone(), value);
                walk(body, names, lets, chain);
                match previous {
                    Some(value) => lets.insert(name.clone(), value),
                    None => lets.remove(name),
                };
            }
            Stmt::Block(stmts) => {
                if let Some(next) = stmts.iter().find(|s| holds_host_loop(s, names)) {
                    walk(next, names, lets, chain);
                }
            }
            Stmt::Provide { .. } | Stmt::Evaluate(_) | Stmt::Comment(_) => {}
        }
    }

    let mut chain = Vec::new();
    walk(stmt, names, &mut Scope::new(), &mut chain);
    chain
}
