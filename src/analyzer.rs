//! Stencil and access-pattern analysis
//!
//! Collects every write and read of a buffered stage inside its store scope,
//! reduces each index to an affine form in the loop variables, and derives
//! per-dimension windows: the full footprint, the per-element stencil and the
//! per-cycle window once unrolling is taken into account.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::trace;

use crate::error::{PassError, PassResult};
use crate::ir::{BinOp, Expr, Range, Stmt};
use crate::ir_utils::{fold_constants, fold_to_int, substitute, LoopFrame, Scope, StoreScope};
use crate::schedule::Environment;

/// `constant + sum(coefficient * variable)`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Affine {
    pub constant: i64,
    /// Never holds a zero coefficient
    pub terms: BTreeMap<String, i64>,
}

impl Affine {
    pub fn constant(value: i64) -> Self {
        Self {
            constant: value,
            terms: BTreeMap::new(),
        }
    }

    pub fn var(name: impl Into<String>) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(name.into(), 1);
        Self { constant: 0, terms }
    }

    /// Affine form of an expression, if it has one. Products need one
    /// constant side; division, modulo, selects and reads have no form.
    pub fn from_expr(expr: &Expr) -> Option<Self> {
        if let Ok(value) = fold_to_int(expr) {
            return Some(Self::constant(value));
        }
        match expr {
            Expr::Int(value) => Some(Self::constant(*value)),
            Expr::Var(name) => Some(Self::var(name.clone())),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = Self::from_expr(lhs)?;
                let rhs = Self::from_expr(rhs)?;
                match op {
                    BinOp::Add => lhs.checked_add(&rhs),
                    BinOp::Sub => lhs.checked_add(&rhs.scale(-1)?),
                    BinOp::Mul if lhs.is_constant() => rhs.scale(lhs.constant),
                    BinOp::Mul if rhs.is_constant() => lhs.scale(rhs.constant),
                    _ => None,
                }
            }
            Expr::Not(_) | Expr::Select { .. } | Expr::Call { .. } => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn coefficient(&self, var: &str) -> i64 {
        self.terms.get(var).copied().unwrap_or(0)
    }

    pub fn checked_add(&self, other: &Affine) -> Option<Self> {
        let mut sum = self.clone();
        sum.constant = sum.constant.checked_add(other.constant)?;
        for (var, coef) in &other.terms {
            let total = sum.coefficient(var).checked_add(*coef)?;
            if total == 0 {
                sum.terms.remove(var);
            } else {
                sum.terms.insert(var.clone(), total);
            }
        }
        Some(sum)
    }

    pub fn scale(&self, factor: i64) -> Option<Self> {
        if factor == 0 {
            return Some(Self::default());
        }
        let mut terms = BTreeMap::new();
        for (var, coef) in &self.terms {
            terms.insert(var.clone(), coef.checked_mul(factor)?);
        }
        Some(Self {
            constant: self.constant.checked_mul(factor)?,
            terms,
        })
    }

    fn without(&self, var: &str) -> Self {
        let mut rest = self.clone();
        rest.terms.remove(var);
        rest
    }

    /// The variable part only
    pub fn symbolic(&self) -> Self {
        Self {
            constant: 0,
            terms: self.terms.clone(),
        }
    }

    /// Canonical expression: variables in name order, constant last.
    pub fn to_expr(&self) -> Expr {
        let mut out: Option<Expr> = None;
        for (var, coef) in &self.terms {
            let term = match coef {
                1 => Expr::var(var.clone()),
                c => Expr::var(var.clone()) * Expr::int(*c),
            };
            out = Some(match out {
                None => term,
                Some(acc) => acc + term,
            });
        }
        match (out, self.constant) {
            (None, c) => Expr::int(c),
            (Some(acc), 0) => acc,
            (Some(acc), c) if c > 0 => acc + Expr::int(c),
            (Some(acc), c) => acc - Expr::int(-c),
        }
    }
}

impl fmt::Display for Affine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_expr())
    }
}

/// One write or read of the buffered stage
#[derive(Debug, Clone, PartialEq)]
pub struct Access {
    /// Index per dimension, `let` bindings expanded
    pub args: Vec<Expr>,
    /// Loops inside the store scope around the access, outermost first
    pub loops: Vec<LoopFrame>,
}

/// Offset range of one dimension relative to a symbolic origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimBounds {
    /// Variables left symbolic by the window
    pub base: Affine,
    pub lo: i64,
    pub hi: i64,
    /// Loops ranged over to build this dimension
    pub driven_by: BTreeSet<String>,
}

impl DimBounds {
    /// Number of indices covered, `None` when it does not fit an `i64`
    pub fn extent(&self) -> Option<i64> {
        self.hi.checked_sub(self.lo)?.checked_add(1)
    }

    /// First index touched, as an expression
    pub fn origin(&self) -> Expr {
        let mut origin = self.base.clone();
        origin.constant = self.lo;
        origin.to_expr()
    }
}

/// Which loops a window ranges over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Window {
    /// Every loop inside the store scope
    Footprint,
    /// Loops nested inside the named loop
    Within(String),
    /// Unrolled and vectorized loops: one element of the consumer
    Element,
    /// `Element` plus loops the schedule unrolls by a factor: one cycle
    Cycle,
}

/// Accesses of one stage inside its store scope
#[derive(Debug, Clone)]
pub struct StencilAnalysis {
    pub stage: String,
    pub declared: Vec<Range>,
    /// Loops around the store scope, outermost first
    pub outer_loops: Vec<LoopFrame>,
    pub writes: Vec<Access>,
    pub reads: Vec<Access>,
    unroll: BTreeMap<String, i64>,
}

/// Collects accesses of a buffered stage from its store scope
pub struct StencilAnalyzer<'a> {
    env: &'a Environment,
}

impl<'a> StencilAnalyzer<'a> {
    pub fn new(env: &'a Environment) -> Self {
        Self { env }
    }

    /// Gather the writes and reads of `scope.name` inside its store scope
    pub fn analyze(&self, scope: &StoreScope<'_>) -> PassResult<StencilAnalysis> {
        let mut collector = AccessCollector {
            stage: scope.name,
            writes: Vec::new(),
            reads: Vec::new(),
            loops: Vec::new(),
            lets: scope.lets.clone(),
        };
        collector.visit(scope.body);

        let mut unroll = BTreeMap::new();
        for access in collector.writes.iter().chain(&collector.reads) {
            for frame in &access.loops {
                if let Some(factor) = self.env.unroll_factor(&frame.name) {
                    unroll.insert(frame.name.clone(), i64::from(factor));
                }
            }
        }

        trace!(
            "{}: {} writes, {} reads inside the store scope",
            scope.name,
            collector.writes.len(),
            collector.reads.len()
        );

        let analysis = StencilAnalysis {
            stage: scope.name.to_string(),
            declared: scope.bounds.to_vec(),
            outer_loops: scope.enclosing_loops.clone(),
            writes: collector.writes,
            reads: collector.reads,
            unroll,
        };
        for access in analysis.writes.iter().chain(&analysis.reads) {
            analysis.check_arity(access)?;
        }
        Ok(analysis)
    }
}

impl StencilAnalysis {
    /// Number of storage dimensions
    pub fn dims(&self) -> usize {
        if !self.declared.is_empty() {
            return self.declared.len();
        }
        self.writes
            .iter()
            .chain(&self.reads)
            .map(|a| a.args.len())
            .next()
            .unwrap_or(0)
    }

    pub fn write_bounds(&self, window: &Window) -> PassResult<Option<Vec<DimBounds>>> {
        self.bounds(&self.writes, window)
    }

    pub fn read_bounds(&self, window: &Window) -> PassResult<Option<Vec<DimBounds>>> {
        self.bounds(&self.reads, window)
    }

    /// Window of a set of accesses, `None` when the set is empty. All
    /// accesses must share the same symbolic origin per dimension.
    pub fn bounds(&self, accesses: &[Access], window: &Window) -> PassResult<Option<Vec<DimBounds>>> {
        let mut merged: Option<Vec<DimBounds>> = None;
        for access in accesses {
            let dims = self.access_bounds(access, window)?;
            merged = Some(match merged {
                None => dims,
                Some(acc) => acc
                    .into_iter()
                    .zip(dims)
                    .zip(&access.args)
                    .map(|((a, b), index)| {
                        if a.base != b.base {
                            return Err(PassError::non_affine(
                                &self.stage,
                                index,
                                format!("window origin `{}` differs from `{}`", b.base, a.base),
                            ));
                        }
                        Ok(DimBounds {
                            base: a.base,
                            lo: a.lo.min(b.lo),
                            hi: a.hi.max(b.hi),
                            driven_by: a.driven_by.union(&b.driven_by).cloned().collect(),
                        })
                    })
                    .collect::<PassResult<Vec<_>>>()?,
            });
        }
        Ok(merged)
    }

    /// Extents of the store scope's declared bounds
    pub fn declared_extents(&self) -> PassResult<Vec<i64>> {
        self.declared
            .iter()
            .enumerate()
            .map(|(dim, range)| {
                fold_to_int(&range.extent).map_err(|_| PassError::unbounded(&self.stage, dim, &range.extent))
            })
            .collect()
    }

    /// Address expression for per-dimension indices: variables bound outside
    /// the store scope are pinned to their loop minimum and the dimensions
    /// are linearised with strides `1, cap[0], cap[0] * cap[1], ...`.
    pub fn access_pattern(&self, indices: &[Expr], capacity: &[i64]) -> Expr {
        let mut stride = 1i64;
        let mut linear: Option<Expr> = None;
        for (index, cap) in indices.iter().zip(capacity) {
            let term = self.pin_outer(index) * Expr::int(stride);
            linear = Some(match linear {
                None => term,
                Some(acc) => acc + term,
            });
            stride = stride.saturating_mul(*cap);
        }
        let linear = linear.unwrap_or(Expr::int(0));
        match Affine::from_expr(&linear) {
            Some(affine) => affine.to_expr(),
            None => fold_constants(&linear),
        }
    }

    fn pin_outer(&self, index: &Expr) -> Expr {
        let mut pinned = index.clone();
        for frame in self.outer_loops.iter().rev() {
            let mut binding = Scope::new();
            binding.insert(frame.name.clone(), frame.min.clone());
            pinned = substitute(&pinned, &binding);
        }
        pinned
    }

    fn check_arity(&self, access: &Access) -> PassResult<()> {
        let dims = self.dims();
        if access.args.len() != dims {
            return Err(PassError::sizing(
                &self.stage,
                format!(
                    "`{}` has {} indices but the store scope has {} dimensions",
                    Expr::call(self.stage.clone(), access.args.clone()),
                    access.args.len(),
                    dims
                ),
            ));
        }
        Ok(())
    }

    fn access_bounds(&self, access: &Access, window: &Window) -> PassResult<Vec<DimBounds>> {
        let within = match window {
            Window::Within(name) => access.loops.iter().position(|l| &l.name == name),
            _ => None,
        };

        access
            .args
            .iter()
            .enumerate()
            .map(|(dim, index)| {
                let mut affine = Affine::from_expr(index)
                    .ok_or_else(|| PassError::non_affine(&self.stage, index, non_affine_reason(index)))?;
                let (mut lo, mut hi) = (0i64, 0i64);
                let mut driven_by = BTreeSet::new();

                // Inner loops first, so a loop minimum naming an outer loop
                // is ranged when that outer loop is reached.
                for (depth, frame) in access.loops.iter().enumerate().rev() {
                    let coef = affine.coefficient(&frame.name);
                    if coef == 0 {
                        continue;
                    }
                    let Some(count) = self.range_count(frame, depth, within, window, dim)? else {
                        continue;
                    };
                    let min = Affine::from_expr(&frame.min).ok_or_else(|| {
                        PassError::non_affine(&self.stage, &frame.min, "loop minimum is not affine")
                    })?;
                    affine = min
                        .scale(coef)
                        .and_then(|m| affine.without(&frame.name).checked_add(&m))
                        .ok_or_else(|| self.overflow(dim, index))?;
                    let span = coef
                        .checked_mul(count - 1)
                        .ok_or_else(|| self.overflow(dim, index))?;
                    if span >= 0 {
                        hi = hi.checked_add(span).ok_or_else(|| self.overflow(dim, index))?;
                    } else {
                        lo = lo.checked_add(span).ok_or_else(|| self.overflow(dim, index))?;
                    }
                    driven_by.insert(frame.name.clone());
                }

                Ok(DimBounds {
                    base: affine.symbolic(),
                    lo: lo.checked_add(affine.constant).ok_or_else(|| self.overflow(dim, index))?,
                    hi: hi.checked_add(affine.constant).ok_or_else(|| self.overflow(dim, index))?,
                    driven_by,
                })
            })
            .collect()
    }

    /// Iterations of `frame` the window covers, `None` if it stays symbolic
    fn range_count(
        &self,
        frame: &LoopFrame,
        depth: usize,
        within: Option<usize>,
        window: &Window,
        dim: usize,
    ) -> PassResult<Option<i64>> {
        let limit = match window {
            Window::Footprint => None,
            Window::Within(_) => match within {
                Some(k) if depth <= k => return Ok(None),
                _ => None,
            },
            Window::Element if frame.kind.is_spatial() => None,
            Window::Element => return Ok(None),
            Window::Cycle if frame.kind.is_spatial() => None,
            Window::Cycle => match self.unroll.get(&frame.name) {
                Some(factor) => Some(*factor),
                None => return Ok(None),
            },
        };

        let extent = fold_to_int(&frame.extent)
            .map_err(|_| PassError::unbounded(&self.stage, dim, &frame.extent))?;
        if extent <= 0 {
            return Err(PassError::sizing(
                &self.stage,
                format!("loop `{}` has empty extent {}", frame.name, extent),
            ));
        }
        Ok(Some(limit.map_or(extent, |f| f.min(extent))))
    }

    fn overflow(&self, dim: usize, index: &Expr) -> PassError {
        PassError::unbounded(&self.stage, dim, index)
    }
}

fn non_affine_reason(index: &Expr) -> &'static str {
    fn has(expr: &Expr, pred: &dyn Fn(&Expr) -> bool) -> bool {
        if pred(expr) {
            return true;
        }
        match expr {
            Expr::Int(_) | Expr::Var(_) => false,
            Expr::Binary { lhs, rhs, .. } => has(lhs, pred) || has(rhs, pred),
            Expr::Not(inner) => has(inner, pred),
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => has(cond, pred) || has(then_value, pred) || has(else_value, pred),
            Expr::Call { args, .. } => args.iter().any(|a| has(a, pred)),
        }
    }

    if has(index, &|e| matches!(e, Expr::Select { .. })) {
        "piecewise index"
    } else if has(index, &|e| matches!(e, Expr::Call { .. })) {
        "data-dependent index"
    } else {
        "index is not affine in the loop variables"
    }
}

struct AccessCollector<'s> {
    stage: &'s str,
    writes: Vec<Access>,
    reads: Vec<Access>,
    loops: Vec<LoopFrame>,
    lets: Scope,
}

impl AccessCollector<'_> {
    fn visit(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Block(stmts) => stmts.iter().for_each(|s| self.visit(s)),
            Stmt::For {
                name,
                min,
                extent,
                kind,
                body,
            } => {
                let min = substitute(min, &self.lets);
                let extent = substitute(extent, &self.lets);
                self.reads_in(&min);
                self.reads_in(&extent);
                self.loops.push(LoopFrame {
                    name: name.clone(),
                    min,
                    extent,
                    kind: *kind,
                });
                let shadowed = self.lets.remove(name);
                self.visit(body);
                if let Some(value) = shadowed {
                    self.lets.insert(name.clone(), value);
                }
                self.loops.pop();
            }
            // An inner allocation of the same name hides this one
            Stmt::Realize { name, .. } if name == self.stage => {}
            Stmt::Realize { bounds, body, .. } => {
                for range in bounds {
                    self.reads_in(&substitute(&range.min, &self.lets));
                    self.reads_in(&substitute(&range.extent, &self.lets));
                }
                self.visit(body);
            }
            Stmt::LetStmt { name, value, body } => {
                let value = substitute(value, &self.lets);
                let previous = self.lets.insert(name.clone(), value);
                self.visit(body);
                match previous {
                    Some(value) => self.lets.insert(name.clone(), value),
                    None => self.lets.remove(name),
                };
            }
            Stmt::Provide { name, args, value } => {
                let args: Vec<Expr> = args.iter().map(|a| substitute(a, &self.lets)).collect();
                if name == self.stage {
                    trace!("write {}({:?})", name, args);
                    self.writes.push(Access {
                        args,
                        loops: self.loops.clone(),
                    });
                } else {
                    args.iter().for_each(|a| self.reads_in(a));
                    self.reads_in(&substitute(value, &self.lets));
                }
            }
            Stmt::Evaluate(expr) => self.reads_in(&substitute(expr, &self.lets)),
            Stmt::Comment(_) => {}
        }
    }

    fn reads_in(&mut self, expr: &Expr) {
        match expr {
            Expr::Int(_) | Expr::Var(_) => {}
            Expr::Binary { lhs, rhs, .. } => {
                self.reads_in(lhs);
                self.reads_in(rhs);
            }
            Expr::Not(inner) => self.reads_in(inner),
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => {
                self.reads_in(cond);
                self.reads_in(then_value);
                self.reads_in(else_value);
            }
            Expr::Call { name, args } => {
                if name == self.stage {
                    trace!("read {}", expr);
                    self.reads.push(Access {
                        args: args.clone(),
                        loops: self.loops.clone(),
                    });
                }
                args.iter().for_each(|a| self.reads_in(a));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_utils::find_store_scope;
    use crate::parser::{parse_expr, parse_stmt};
    use crate::schedule::Stage;

    fn affine(src: &str) -> Option<Affine> {
        Affine::from_expr(&parse_expr(src).unwrap())
    }

    const BOX: &str = "
        for (blur.y, 0, 62) {
          realize hw_input([0, 64], [blur.y, 3]) {
            for (hw_input.y, blur.y, 3) {
              for (hw_input.x, 0, 64) {
                hw_input(hw_input.x, hw_input.y) = input(hw_input.x, hw_input.y)
              }
            }
            for (blur.x, 0, 62) {
              blur(blur.x, blur.y) = hw_input(blur.x, blur.y) + hw_input(blur.x + 2, blur.y + 1)
                + hw_input(blur.x + 1, blur.y + 2)
            }
          }
        }";

    fn analyze(source: &str, env: &Environment) -> StencilAnalysis {
        let stmt = parse_stmt(source).unwrap();
        let scope = find_store_scope(&stmt, "hw_input").unwrap();
        StencilAnalyzer::new(env).analyze(&scope).unwrap()
    }

    fn extents(bounds: Option<Vec<DimBounds>>) -> Vec<i64> {
        bounds.unwrap().iter().map(|b| b.extent().unwrap()).collect()
    }

    #[test]
    fn test_affine_forms() {
        let a = affine("2 * (x + 3) - y + 1").unwrap();
        assert_eq!(a.constant, 7);
        assert_eq!(a.coefficient("x"), 2);
        assert_eq!(a.coefficient("y"), -1);
        assert_eq!(a.to_expr().to_string(), "x * 2 + y * -1 + 7");

        assert_eq!(affine("x - x + 4"), Some(Affine::constant(4)));
        assert_eq!(affine("min(3, 8) + x").unwrap().constant, 3);
        assert!(affine("x * y").is_none());
        assert!(affine("x / 2").is_none());
        assert!(affine("select(x < 2, x, 0)").is_none());
        assert!(affine("f(x)").is_none());
    }

    #[test]
    fn test_collects_writes_and_reads() {
        let analysis = analyze(BOX, &Environment::new());
        assert_eq!(analysis.writes.len(), 1);
        assert_eq!(analysis.reads.len(), 3);
        assert_eq!(analysis.outer_loops.len(), 1);
        assert_eq!(analysis.dims(), 2);
        assert_eq!(analysis.writes[0].loops.len(), 2);
        assert_eq!(analysis.reads[0].loops[0].name, "blur.x");
    }

    #[test]
    fn test_windows() {
        let analysis = analyze(BOX, &Environment::new());

        assert_eq!(extents(analysis.write_bounds(&Window::Footprint).unwrap()), vec![64, 3]);
        assert_eq!(extents(analysis.read_bounds(&Window::Footprint).unwrap()), vec![64, 3]);
        assert_eq!(extents(analysis.read_bounds(&Window::Element).unwrap()), vec![3, 3]);
        assert_eq!(extents(analysis.write_bounds(&Window::Cycle).unwrap()), vec![1, 1]);

        let element = analysis.read_bounds(&Window::Element).unwrap().unwrap();
        assert_eq!(element[0].origin(), Expr::var("blur.x"));
        assert!(element[0].driven_by.is_empty());

        let footprint = analysis.write_bounds(&Window::Footprint).unwrap().unwrap();
        assert_eq!(footprint[1].base, Affine::var("blur.y"));
        assert!(footprint[1].driven_by.contains("hw_input.y"));
    }

    #[test]
    fn test_within_window_ranges_inner_loops_only() {
        let analysis = analyze(BOX, &Environment::new());
        let tile = analysis
            .write_bounds(&Window::Within("hw_input.y".to_string()))
            .unwrap();
        assert_eq!(extents(tile), vec![64, 1]);
    }

    #[test]
    fn test_cycle_window_follows_unroll_factor() {
        let env = Environment::new().with(Stage::new("blur", ["x", "y"], ["y", "x"]).unroll("x", 2));
        let analysis = analyze(BOX, &env);
        assert_eq!(extents(analysis.read_bounds(&Window::Cycle).unwrap()), vec![4, 3]);
    }

    #[test]
    fn test_access_patterns() {
        let analysis = analyze(BOX, &Environment::new());
        let pattern = analysis.access_pattern(&analysis.writes[0].args, &[64, 3]);
        assert_eq!(pattern.to_string(), "hw_input.x + hw_input.y * 64");

        let element = analysis.read_bounds(&Window::Element).unwrap().unwrap();
        let origins: Vec<Expr> = element.iter().map(DimBounds::origin).collect();
        assert_eq!(analysis.access_pattern(&origins, &[64, 3]), Expr::var("blur.x"));
    }

    #[test]
    fn test_piecewise_read_is_non_affine() {
        let source = "
            realize hw_input([0, 8]) {
              for (hw_input.x, 0, 8) { hw_input(hw_input.x) = 0 }
              for (out.x, 0, 8) { out(out.x) = hw_input(select(out.x % 2 == 0, out.x, out.x - 1)) }
            }";
        let analysis = analyze(source, &Environment::new());
        let err = analysis.read_bounds(&Window::Element).unwrap_err();
        assert!(matches!(
            err,
            PassError::NonAffineAccess { ref reason, .. } if reason == "piecewise index"
        ));
    }

    #[test]
    fn test_symbolic_extent_is_unbounded() {
        let source = "
            realize hw_input([0, n]) {
              for (hw_input.x, 0, n) { hw_input(hw_input.x) = 0 }
            }";
        let analysis = analyze(source, &Environment::new());
        let err = analysis.write_bounds(&Window::Footprint).unwrap_err();
        assert_eq!(
            err,
            PassError::UnboundedCapacity {
                stage: "hw_input".to_string(),
                dim: 0,
                expr: "n".to_string(),
            }
        );
    }

    #[test]
    fn test_arity_mismatch() {
        let source = "
            realize hw_input([0, 8], [0, 8]) {
              for (hw_input.x, 0, 8) { hw_input(hw_input.x) = 0 }
            }";
        let stmt = parse_stmt(source).unwrap();
        let scope = find_store_scope(&stmt, "hw_input").unwrap();
        let env = Environment::new();
        let err = StencilAnalyzer::new(&env).analyze(&scope).unwrap_err();
        assert!(matches!(err, PassError::SizingError { .. }));
    }
}
