//! Scheduled pipeline IR
//!
//! Expressions and statements are immutable trees. The pass only reads them
//! and builds new trees by substitution; no node is ever mutated in place.

use std::fmt;
use std::ops;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Binary operators of the scalar expression language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Min => "min",
            BinOp::Max => "max",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    /// Binding strength used by the printer; `min`/`max` print as calls.
    fn precedence(&self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 3,
            BinOp::Add | BinOp::Sub => 4,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 5,
            BinOp::Min | BinOp::Max => ATOM,
        }
    }

    fn is_comparison(&self) -> bool {
        self.precedence() == 3
    }
}

const UNARY: u8 = 6;
const ATOM: u8 = 7;

/// A scalar expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    /// Integer literal
    Int(i64),

    /// Named variable: a loop variable or a `let` binding
    Var(String),

    /// Arithmetic, comparison or logical operator
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    /// Logical negation
    Not(Box<Expr>),

    /// Conditional select: `select(cond, then_value, else_value)`
    Select {
        cond: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },

    /// Read of another stage's output at the given indices
    Call { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Int(value)
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            name: name.into(),
            args,
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn select(cond: Expr, then_value: Expr, else_value: Expr) -> Self {
        Expr::Select {
            cond: Box::new(cond),
            then_value: Box::new(then_value),
            else_value: Box::new(else_value),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Not(_) => UNARY,
            _ => ATOM,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min_prec: u8) -> fmt::Result {
        if self.precedence() < min_prec {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{}", v),
            Expr::Var(name) => write!(f, "{}", name),
            Expr::Binary { op, lhs, rhs } if matches!(op, BinOp::Min | BinOp::Max) => {
                write!(f, "{}({}, {})", op.symbol(), lhs, rhs)
            }
            Expr::Binary { op, lhs, rhs } => {
                let prec = op.precedence();
                let lhs_prec = if op.is_comparison() { prec + 1 } else { prec };
                lhs.fmt_operand(f, lhs_prec)?;
                write!(f, " {} ", op.symbol())?;
                rhs.fmt_operand(f, prec + 1)
            }
            Expr::Not(inner) => {
                write!(f, "!")?;
                inner.fmt_operand(f, UNARY)
            }
            Expr::Select {
                cond,
                then_value,
                else_value,
            } => write!(f, "select({}, {}, {})", cond, then_value, else_value),
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                write_list(f, args)?;
                write!(f, ")")
            }
        }
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Add, self, rhs)
    }
}

impl ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Sub, self, rhs)
    }
}

impl ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mul, self, rhs)
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::Int(value)
    }
}

// Expressions travel through JSON as IR text.
impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        crate::parser::parse_expr(&text).map_err(serde::de::Error::custom)
    }
}

/// Loop execution tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForKind {
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
}

impl ForKind {
    /// Only serial loops advance one iteration at a time.
    pub fn is_sequential(self) -> bool {
        matches!(self, ForKind::Serial)
    }

    /// Unrolled and vectorized loops execute all iterations in one step.
    pub fn is_spatial(self) -> bool {
        matches!(self, ForKind::Unrolled | ForKind::Vectorized)
    }
}

impl fmt::Display for ForKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForKind::Serial => write!(f, "serial"),
            ForKind::Parallel => write!(f, "parallel"),
            ForKind::Vectorized => write!(f, "vectorized"),
            ForKind::Unrolled => write!(f, "unrolled"),
        }
    }
}

/// One dimension of a store-allocation scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Range {
    pub min: Expr,
    pub extent: Expr,
}

impl Range {
    pub fn new(min: impl Into<Expr>, extent: impl Into<Expr>) -> Self {
        Self {
            min: min.into(),
            extent: extent.into(),
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.extent)
    }
}

/// Control structure of the scheduled program
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Stmt {
    /// Sequential composition
    Block(Vec<Stmt>),

    /// Loop over `name` in `[min, min + extent)`
    For {
        name: String,
        min: Expr,
        extent: Expr,
        kind: ForKind,
        body: Box<Stmt>,
    },

    /// Storage for stage `name` is live inside `body`
    Realize {
        name: String,
        bounds: Vec<Range>,
        body: Box<Stmt>,
    },

    /// Write `value` into stage `name` at `args`
    Provide {
        name: String,
        args: Vec<Expr>,
        value: Expr,
    },

    /// `name` is bound to `value` inside `body`
    LetStmt {
        name: String,
        value: Expr,
        body: Box<Stmt>,
    },

    /// Evaluate an expression for its reads
    Evaluate(Expr),

    /// Diagnostic note; no effect on the program
    Comment(String),
}

impl Stmt {
    pub fn block(stmts: Vec<Stmt>) -> Self {
        Stmt::Block(stmts)
    }

    pub fn for_loop(
        name: impl Into<String>,
        min: impl Into<Expr>,
        extent: impl Into<Expr>,
        kind: ForKind,
        body: Stmt,
    ) -> Self {
        Stmt::For {
            name: name.into(),
            min: min.into(),
            extent: extent.into(),
            kind,
            body: Box::new(body),
        }
    }

    pub fn realize(name: impl Into<String>, bounds: Vec<Range>, body: Stmt) -> Self {
        Stmt::Realize {
            name: name.into(),
            bounds,
            body: Box::new(body),
        }
    }

    pub fn provide(name: impl Into<String>, args: Vec<Expr>, value: Expr) -> Self {
        Stmt::Provide {
            name: name.into(),
            args,
            value,
        }
    }

    pub fn let_stmt(name: impl Into<String>, value: Expr, body: Stmt) -> Self {
        Stmt::LetStmt {
            name: name.into(),
            value,
            body: Box::new(body),
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        match self {
            Stmt::Block(stmts) => {
                for stmt in stmts {
                    stmt.write_indented(f, depth)?;
                }
                Ok(())
            }
            Stmt::For {
                name,
                min,
                extent,
                kind,
                body,
            } => {
                let prefix = match kind {
                    ForKind::Serial => String::new(),
                    other => format!("{} ", other),
                };
                writeln!(f, "{}{}for ({}, {}, {}) {{", pad, prefix, name, min, extent)?;
                body.write_indented(f, depth + 1)?;
                writeln!(f, "{}}}", pad)
            }
            Stmt::Realize { name, bounds, body } => {
                write!(f, "{}realize {}(", pad, name)?;
                write_list(f, bounds)?;
                writeln!(f, ") {{")?;
                body.write_indented(f, depth + 1)?;
                writeln!(f, "{}}}", pad)
            }
            Stmt::Provide { name, args, value } => {
                write!(f, "{}{}(", pad, name)?;
                write_list(f, args)?;
                writeln!(f, ") = {}", value)
            }
            Stmt::LetStmt { name, value, body } => {
                writeln!(f, "{}let {} = {}", pad, name, value)?;
                body.write_indented(f, depth)
            }
            Stmt::Evaluate(expr) => writeln!(f, "{}eval {}", pad, expr),
            Stmt::Comment(text) => writeln!(f, "{}// {}", pad, text),
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_precedence() {
        let x = Expr::var("x");
        let e = (x.clone() + Expr::int(1)) * Expr::int(2);
        assert_eq!(e.to_string(), "(x + 1) * 2");

        let e = x.clone() - (Expr::var("y") - Expr::int(3));
        assert_eq!(e.to_string(), "x - (y - 3)");

        let e = Expr::binary(BinOp::Min, x.clone(), Expr::int(4)) + Expr::int(1);
        assert_eq!(e.to_string(), "min(x, 4) + 1");
    }

    #[test]
    fn test_print_loop_nest() {
        let body = Stmt::provide(
            "f",
            vec![Expr::var("f.x")],
            Expr::call("g", vec![Expr::var("f.x") + Expr::int(1)]),
        );
        let stmt = Stmt::realize(
            "f",
            vec![Range::new(0, 8)],
            Stmt::for_loop("f.x", 0, 8, ForKind::Unrolled, body),
        );
        let text = stmt.to_string();
        assert_eq!(
            text,
            "realize f([0, 8]) {\n  unrolled for (f.x, 0, 8) {\n    f(f.x) = g(f.x + 1)\n  }\n}\n"
        );
    }

    #[test]
    fn test_for_kind_sequential() {
        assert!(ForKind::Serial.is_sequential());
        assert!(!ForKind::Parallel.is_sequential());
        assert!(!ForKind::Vectorized.is_sequential());
        assert!(!ForKind::Unrolled.is_sequential());
        assert!(ForKind::Unrolled.is_spatial());
    }
}
