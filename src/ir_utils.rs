//! Side-effect-free queries over the scheduled IR
//!
//! Substitution, constant folding and the searches the hardware buffer pass
//! needs: store scopes, loops, and whether a stage is written or read at a
//! given level of the tree.

use std::collections::BTreeMap;

use crate::error::NotConstant;
use crate::ir::{BinOp, Expr, ForKind, Range, Stmt};

/// Bindings from variable name to replacement expression
pub type Scope = BTreeMap<String, Expr>;

/// A loop enclosing some point of the tree, with bounds already expanded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopFrame {
    pub name: String,
    pub min: Expr,
    pub extent: Expr,
    pub kind: ForKind,
}

/// The allocation scope of a stage together with its context in the tree
#[derive(Debug, Clone)]
pub struct StoreScope<'a> {
    pub name: &'a str,
    pub bounds: &'a [Range],
    pub body: &'a Stmt,
    /// Loops around the scope, outermost first
    pub enclosing_loops: Vec<LoopFrame>,
    /// `let` bindings visible inside the scope, fully expanded
    pub lets: Scope,
}

/// Depth-first search for the `realize` of `name`.
/// `None` is valid: the stage may be scheduled inline.
pub fn find_store_scope<'a>(stmt: &'a Stmt, name: &str) -> Option<StoreScope<'a>> {
    fn search<'a>(
        stmt: &'a Stmt,
        name: &str,
        loops: &mut Vec<LoopFrame>,
        lets: &mut Scope,
    ) -> Option<StoreScope<'a>> {
        match stmt {
            Stmt::Realize { name: n, bounds, body } if n == name => Some(StoreScope {
                name: n,
                bounds,
                body,
                enclosing_loops: loops.clone(),
                lets: lets.clone(),
            }),
            Stmt::Realize { body, .. } => search(body, name, loops, lets),
            Stmt::Block(stmts) => stmts.iter().find_map(|s| search(s, name, loops, lets)),
            Stmt::For {
                name: var,
                min,
                extent,
                kind,
                body,
            } => {
                loops.push(LoopFrame {
                    name: var.clone(),
                    min: substitute(min, lets),
                    extent: substitute(extent, lets),
                    kind: *kind,
                });
                let shadowed = lets.remove(var);
                let found = search(body, name, loops, lets);
                if let Some(value) = shadowed {
                    lets.insert(var.clone(), value);
                }
                loops.pop();
                found
            }
            Stmt::LetStmt {
                name: var,
                value,
                body,
            } => {
                let value = substitute(value, lets);
                let previous = lets.insert(var.clone(), value);
                let found = search(body, name, loops, lets);
                restore(lets, var, previous);
                found
            }
            Stmt::Provide { .. } | Stmt::Evaluate(_) | Stmt::Comment(_) => None,
        }
    }

    search(stmt, name, &mut Vec::new(), &mut Scope::new())
}

fn restore(scope: &mut Scope, name: &str, previous: Option<Expr>) {
    match previous {
        Some(value) => {
            scope.insert(name.to_string(), value);
        }
        None => {
            scope.remove(name);
        }
    }
}

/// Find the loop named `name` anywhere below `stmt`
pub fn find_loop<'a>(stmt: &'a Stmt, name: &str) -> Option<&'a Stmt> {
    match stmt {
        Stmt::For { name: n, .. } if n == name => Some(stmt),
        Stmt::For { body, .. } | Stmt::Realize { body, .. } | Stmt::LetStmt { body, .. } => {
            find_loop(body, name)
        }
        Stmt::Block(stmts) => stmts.iter().find_map(|s| find_loop(s, name)),
        Stmt::Provide { .. } | Stmt::Evaluate(_) | Stmt::Comment(_) => None,
    }
}

/// Name of the first loop met in a depth-first walk
pub fn first_for_name(stmt: &Stmt) -> Option<&str> {
    match stmt {
        Stmt::For { name, .. } => Some(name),
        Stmt::Realize { body, .. } | Stmt::LetStmt { body, .. } => first_for_name(body),
        Stmt::Block(stmts) => stmts.iter().find_map(first_for_name),
        Stmt::Provide { .. } | Stmt::Evaluate(_) | Stmt::Comment(_) => None,
    }
}

/// Names of all store scopes, inner scopes before the scopes around them
pub fn realize_order(stmt: &Stmt) -> Vec<&str> {
    fn walk<'a>(stmt: &'a Stmt, out: &mut Vec<&'a str>) {
        match stmt {
            Stmt::Realize { name, body, .. } => {
                walk(body, out);
                out.push(name);
            }
            Stmt::For { body, .. } | Stmt::LetStmt { body, .. } => walk(body, out),
            Stmt::Block(stmts) => stmts.iter().for_each(|s| walk(s, out)),
            Stmt::Provide { .. } | Stmt::Evaluate(_) | Stmt::Comment(_) => {}
        }
    }

    let mut out = Vec::new();
    walk(stmt, &mut out);
    out
}

/// True if `expr` reads stage `name` anywhere
pub fn expr_calls(expr: &Expr, name: &str) -> bool {
    match expr {
        Expr::Int(_) | Expr::Var(_) => false,
        Expr::Binary { lhs, rhs, .. } => expr_calls(lhs, name) || expr_calls(rhs, name),
        Expr::Not(inner) => expr_calls(inner, name),
        Expr::Select {
            cond,
            then_value,
            else_value,
        } => {
            expr_calls(cond, name) || expr_calls(then_value, name) || expr_calls(else_value, name)
        }
        Expr::Call { name: n, args } => n == name || args.iter().any(|a| expr_calls(a, name)),
    }
}

/// True if stage `name` is read anywhere below `stmt`
pub fn contains_call(stmt: &Stmt, name: &str) -> bool {
    reads(stmt, name, true)
}

/// True if `stmt` writes stage `name` without passing through a nested
/// sequential loop.
pub fn produces_at_level(stmt: &Stmt, name: &str) -> bool {
    match stmt {
        Stmt::Provide { name: n, .. } => n == name,
        Stmt::For { kind, body, .. } => !kind.is_sequential() && produces_at_level(body, name),
        Stmt::Realize { body, .. } | Stmt::LetStmt { body, .. } => produces_at_level(body, name),
        Stmt::Block(stmts) => stmts.iter().any(|s| produces_at_level(s, name)),
        Stmt::Evaluate(_) | Stmt::Comment(_) => false,
    }
}

/// True if `stmt` reads stage `name` without passing through a nested
/// sequential loop. A sequential loop's own bounds are evaluated at this level.
pub fn reads_at_level(stmt: &Stmt, name: &str) -> bool {
    reads(stmt, name, false)
}

fn reads(stmt: &Stmt, name: &str, through_serial: bool) -> bool {
    match stmt {
        Stmt::Provide { args, value, .. } => {
            args.iter().any(|a| expr_calls(a, name)) || expr_calls(value, name)
        }
        Stmt::For {
            min,
            extent,
            kind,
            body,
            ..
        } => {
            expr_calls(min, name)
                || expr_calls(extent, name)
                || ((through_serial || !kind.is_sequential()) && reads(body, name, through_serial))
        }
        Stmt::Realize { bounds, body, .. } => {
            bounds
                .iter()
                .any(|r| expr_calls(&r.min, name) || expr_calls(&r.extent, name))
                || reads(body, name, through_serial)
        }
        Stmt::LetStmt { value, body, .. } => {
            expr_calls(value, name) || reads(body, name, through_serial)
        }
        Stmt::Block(stmts) => stmts.iter().any(|s| reads(s, name, through_serial)),
        Stmt::Evaluate(expr) => expr_calls(expr, name),
        Stmt::Comment(_) => false,
    }
}

/// Replace every bound variable by its binding
pub fn substitute(expr: &Expr, bindings: &Scope) -> Expr {
    if bindings.is_empty() {
        return expr.clone();
    }
    match expr {
        Expr::Var(name) => bindings.get(name).cloned().unwrap_or_else(|| expr.clone()),
        Expr::Int(_) => expr.clone(),
        Expr::Binary { op, lhs, rhs } => {
            Expr::binary(*op, substitute(lhs, bindings), substitute(rhs, bindings))
        }
        Expr::Not(inner) => Expr::Not(Box::new(substitute(inner, bindings))),
        Expr::Select {
            cond,
            then_value,
            else_value,
        } => Expr::select(
            substitute(cond, bindings),
            substitute(then_value, bindings),
            substitute(else_value, bindings),
        ),
        Expr::Call { name, args } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(|a| substitute(a, bindings)).collect(),
        },
    }
}

/// Substitute through a statement. Loops and lets that rebind a name hide
/// the outer binding inside their body.
pub fn substitute_stmt(stmt: &Stmt, bindings: &Scope) -> Stmt {
    if bindings.is_empty() {
        return stmt.clone();
    }
    match stmt {
        Stmt::Block(stmts) => Stmt::Block(stmts.iter().map(|s| substitute_stmt(s, bindings)).collect()),
        Stmt::For {
            name,
            min,
            extent,
            kind,
            body,
        } => Stmt::for_loop(
            name.clone(),
            substitute(min, bindings),
            substitute(extent, bindings),
            *kind,
            substitute_stmt(body, &without(bindings, name)),
        ),
        Stmt::Realize { name, bounds, body } => Stmt::realize(
            name.clone(),
            bounds
                .iter()
                .map(|r| Range::new(substitute(&r.min, bindings), substitute(&r.extent, bindings)))
                .collect(),
            substitute_stmt(body, bindings),
        ),
        Stmt::Provide { name, args, value } => Stmt::provide(
            name.clone(),
            args.iter().map(|a| substitute(a, bindings)).collect(),
            substitute(value, bindings),
        ),
        Stmt::LetStmt { name, value, body } => Stmt::let_stmt(
            name.clone(),
            substitute(value, bindings),
            substitute_stmt(body, &without(bindings, name)),
        ),
        Stmt::Evaluate(expr) => Stmt::Evaluate(substitute(expr, bindings)),
        Stmt::Comment(_) => stmt.clone(),
    }
}

fn without(bindings: &Scope, name: &str) -> Scope {
    if bindings.contains_key(name) {
        let mut inner = bindings.clone();
        inner.remove(name);
        inner
    } else {
        bindings.clone()
    }
}

/// Inline every `let` whose value folds to a constant
pub fn substitute_in_constants(stmt: &Stmt) -> Stmt {
    match stmt {
        Stmt::LetStmt { name, value, body } => match fold_to_int(value) {
            Ok(constant) => {
                let mut bindings = Scope::new();
                bindings.insert(name.clone(), Expr::Int(constant));
                substitute_in_constants(&substitute_stmt(body, &bindings))
            }
            Err(_) => Stmt::let_stmt(name.clone(), value.clone(), substitute_in_constants(body)),
        },
        Stmt::Block(stmts) => Stmt::Block(stmts.iter().map(substitute_in_constants).collect()),
        Stmt::For {
            name,
            min,
            extent,
            kind,
            body,
        } => Stmt::for_loop(
            name.clone(),
            min.clone(),
            extent.clone(),
            *kind,
            substitute_in_constants(body),
        ),
        Stmt::Realize { name, bounds, body } => {
            Stmt::realize(name.clone(), bounds.clone(), substitute_in_constants(body))
        }
        Stmt::Provide { .. } | Stmt::Evaluate(_) | Stmt::Comment(_) => stmt.clone(),
    }
}

/// Reduce an expression to an integer literal
pub fn fold_to_int(expr: &Expr) -> Result<i64, NotConstant> {
    eval(expr).ok_or_else(|| NotConstant(expr.clone()))
}

fn eval(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Int(v) => Some(*v),
        Expr::Var(_) | Expr::Call { .. } => None,
        Expr::Binary { op, lhs, rhs } => apply(*op, eval(lhs)?, eval(rhs)?),
        Expr::Not(inner) => Some((eval(inner)? == 0) as i64),
        Expr::Select {
            cond,
            then_value,
            else_value,
        } => {
            if eval(cond)? != 0 {
                eval(then_value)
            } else {
                eval(else_value)
            }
        }
    }
}

/// Euclidean division and modulo; a zero divisor does not fold.
fn apply(op: BinOp, a: i64, b: i64) -> Option<i64> {
    match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => a.checked_div_euclid(b),
        BinOp::Mod => a.checked_rem_euclid(b),
        BinOp::Min => Some(a.min(b)),
        BinOp::Max => Some(a.max(b)),
        BinOp::Eq => Some((a == b) as i64),
        BinOp::Ne => Some((a != b) as i64),
        BinOp::Lt => Some((a < b) as i64),
        BinOp::Le => Some((a <= b) as i64),
        BinOp::Gt => Some((a > b) as i64),
        BinOp::Ge => Some((a >= b) as i64),
        BinOp::And => Some((a != 0 && b != 0) as i64),
        BinOp::Or => Some((a != 0 || b != 0) as i64),
    }
}

/// Fold constant sub-trees and drop additive/multiplicative identities
pub fn fold_constants(expr: &Expr) -> Expr {
    match expr {
        Expr::Int(_) | Expr::Var(_) => expr.clone(),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = fold_constants(lhs);
            let rhs = fold_constants(rhs);
            match (op, lhs.as_int(), rhs.as_int()) {
                (_, Some(a), Some(b)) => match apply(*op, a, b) {
                    Some(v) => Expr::Int(v),
                    None => Expr::binary(*op, lhs, rhs),
                },
                (BinOp::Add, Some(0), _) => rhs,
                (BinOp::Add | BinOp::Sub, _, Some(0)) => lhs,
                (BinOp::Mul, Some(1), _) => rhs,
                (BinOp::Mul | BinOp::Div, _, Some(1)) => lhs,
                (BinOp::Mul, Some(0), _) | (BinOp::Mul, _, Some(0)) => Expr::Int(0),
                _ => Expr::binary(*op, lhs, rhs),
            }
        }
        Expr::Not(inner) => match fold_constants(inner) {
            Expr::Int(v) => Expr::Int((v == 0) as i64),
            other => Expr::Not(Box::new(other)),
        },
        Expr::Select {
            cond,
            then_value,
            else_value,
        } => match fold_constants(cond) {
            Expr::Int(0) => fold_constants(else_value),
            Expr::Int(_) => fold_constants(then_value),
            cond => Expr::select(cond, fold_constants(then_value), fold_constants(else_value)),
        },
        Expr::Call { name, args } => Expr::Call {
            name: name.clone(),
            args: args.iter().map(fold_constants).collect(),
        },
    }
}

/// Longest chain of nested `let` bindings the pass walks
pub const MAX_LET_CHAIN: usize = 1024;

/// True when `for` loops nest deeper than `limit`
pub fn nesting_exceeds(stmt: &Stmt, limit: usize) -> bool {
    depth_exceeds(stmt, limit, &|s| matches!(s, Stmt::For { .. }))
}

/// True when `let` bindings nest deeper than `limit`
pub fn let_chain_exceeds(stmt: &Stmt, limit: usize) -> bool {
    depth_exceeds(stmt, limit, &|s| matches!(s, Stmt::LetStmt { .. }))
}

fn depth_exceeds(stmt: &Stmt, limit: usize, counts: &dyn Fn(&Stmt) -> bool) -> bool {
    fn walk(stmt: &Stmt, depth: usize, limit: usize, counts: &dyn Fn(&Stmt) -> bool) -> bool {
        let depth = if counts(stmt) { depth + 1 } else { depth };
        if depth > limit {
            return true;
        }
        match stmt {
            Stmt::Block(stmts) => stmts.iter().any(|s| walk(s, depth, limit, counts)),
            Stmt::For { body, .. } | Stmt::Realize { body, .. } | Stmt::LetStmt { body, .. } => {
                walk(body, depth, limit, counts)
            }
            Stmt::Provide { .. } | Stmt::Evaluate(_) | Stmt::Comment(_) => false,
        }
    }

    walk(stmt, 0, limit, counts)
}
