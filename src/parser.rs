//! Parser for the textual IR dump
//!
//! Parses programs like:
//! - `realize blur([0, 62], [0, 62]) { ... }`
//! - `unrolled for (blur.r, 0, 3) { ... }`
//! - `let w = 64`
//! - `blur(blur.x, blur.y) = hw_input(blur.x + 1, blur.y)`

use crate::error::{PassError, PassResult};
use crate::ir::{BinOp, Expr, ForKind, Range, Stmt};
use crate::lexer::{Lexer, Token};

/// Bracket nesting accepted before the parser gives up.
const MAX_NESTING: usize = 256;

/// Parse a complete program
pub fn parse_stmt(source: &str) -> PassResult<Stmt> {
    Parser::new(source).parse_program()
}

/// Parse a single expression
pub fn parse_expr(source: &str) -> PassResult<Expr> {
    let mut parser = Parser::new(source);
    parser.advance()?;
    let expr = parser.parse_expr()?;
    parser.expect_end()?;
    Ok(expr)
}

/// Parser for IR text
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    current: Option<Token>,
    depth: usize,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            lexer: Lexer::new(source),
            current: None,
            depth: 0,
        }
    }

    /// Advance to the next token
    fn advance(&mut self) -> PassResult<Option<Token>> {
        let next = match self.lexer.next() {
            Some(Ok(tok)) => Some(tok),
            Some(Err(())) => {
                return Err(PassError::lexer(
                    self.lexer.span().start,
                    format!("unexpected input `{}`", self.lexer.slice()),
                ))
            }
            None => None,
        };
        Ok(std::mem::replace(&mut self.current, next))
    }

    /// Check if current token matches expected
    fn check(&self, expected: &Token) -> bool {
        match &self.current {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> PassResult<()> {
        if self.check(&expected) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{}`", expected)))
        }
    }

    fn expect_ident(&mut self) -> PassResult<String> {
        match self.current.take() {
            Some(Token::Ident(name)) => {
                self.advance()?;
                Ok(name)
            }
            other => {
                self.current = other;
                Err(self.unexpected("a name"))
            }
        }
    }

    fn expect_end(&self) -> PassResult<()> {
        match &self.current {
            None => Ok(()),
            Some(_) => Err(self.unexpected("end of input")),
        }
    }

    fn unexpected(&self, wanted: &str) -> PassError {
        match &self.current {
            Some(tok) => PassError::parse_error(format!("Expected {}, got `{}`", wanted, tok)),
            None => PassError::parse_error(format!("Expected {}, got end of input", wanted)),
        }
    }

    fn enter(&mut self) -> PassResult<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(PassError::parse_error(format!(
                "nesting deeper than {} levels",
                MAX_NESTING
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Parse a complete program (a statement list)
    pub fn parse_program(&mut self) -> PassResult<Stmt> {
        self.advance()?;
        let program = self.parse_statements()?;
        self.expect_end()?;
        Ok(program)
    }

    /// Parse statements up to a closing brace or the end of input.
    /// A `let` takes the rest of the list as its body.
    fn parse_statements(&mut self) -> PassResult<Stmt> {
        let mut stmts = Vec::new();

        while self.current.is_some() && !self.check(&Token::RBrace) {
            if self.check(&Token::Let) {
                self.advance()?;
                let name = self.expect_ident()?;
                self.expect(Token::Equals)?;
                let value = self.parse_expr()?;
                if self.check(&Token::Semicolon) {
                    self.advance()?;
                }
                let body = self.parse_statements()?;
                stmts.push(Stmt::let_stmt(name, value, body));
                break;
            }

            stmts.push(self.parse_statement()?);

            // Optional semicolon between statements
            if self.check(&Token::Semicolon) {
                self.advance()?;
            }
        }

        if stmts.len() == 1 {
            Ok(stmts.remove(0))
        } else {
            Ok(Stmt::Block(stmts))
        }
    }

    /// Parse a single statement
    fn parse_statement(&mut self) -> PassResult<Stmt> {
        let kind = match &self.current {
            Some(Token::Serial) => Some(ForKind::Serial),
            Some(Token::Parallel) => Some(ForKind::Parallel),
            Some(Token::Vectorized) => Some(ForKind::Vectorized),
            Some(Token::Unrolled) => Some(ForKind::Unrolled),
            _ => None,
        };
        if let Some(kind) = kind {
            self.advance()?;
            return self.parse_for(kind);
        }

        match self.current.clone() {
            Some(Token::For) => self.parse_for(ForKind::Serial),
            Some(Token::Realize) => self.parse_realize(),
            Some(Token::Eval) => {
                self.advance()?;
                Ok(Stmt::Evaluate(self.parse_expr()?))
            }
            Some(Token::Comment(text)) => {
                self.advance()?;
                Ok(Stmt::Comment(text))
            }
            Some(Token::Ident(name)) => {
                self.advance()?;
                let args = self.parse_args()?;
                self.expect(Token::Equals)?;
                let value = self.parse_expr()?;
                Ok(Stmt::Provide { name, args, value })
            }
            _ => Err(self.unexpected("a statement")),
        }
    }

    /// Parse `for (name, min, extent) { body }`
    fn parse_for(&mut self, kind: ForKind) -> PassResult<Stmt> {
        self.expect(Token::For)?;
        self.expect(Token::LParen)?;
        let name = self.expect_ident()?;
        self.expect(Token::Comma)?;
        let min = self.parse_expr()?;
        self.expect(Token::Comma)?;
        let extent = self.parse_expr()?;
        self.expect(Token::RParen)?;
        let body = self.parse_body()?;
        Ok(Stmt::for_loop(name, min, extent, kind, body))
    }

    /// Parse `realize name([min, extent], ...) { body }`
    fn parse_realize(&mut self) -> PassResult<Stmt> {
        self.expect(Token::Realize)?;
        let name = self.expect_ident()?;
        self.expect(Token::LParen)?;

        let mut bounds = Vec::new();
        while !self.check(&Token::RParen) {
            self.expect(Token::LBracket)?;
            let min = self.parse_expr()?;
            self.expect(Token::Comma)?;
            let extent = self.parse_expr()?;
            self.expect(Token::RBracket)?;
            bounds.push(Range { min, extent });

            if !self.check(&Token::Comma) {
                break;
            }
            self.advance()?;
        }
        self.expect(Token::RParen)?;

        let body = self.parse_body()?;
        Ok(Stmt::realize(name, bounds, body))
    }

    fn parse_body(&mut self) -> PassResult<Stmt> {
        self.enter()?;
        self.expect(Token::LBrace)?;
        let body = self.parse_statements()?;
        self.expect(Token::RBrace)?;
        self.leave();
        Ok(body)
    }

    /// Parse an expression (handles operator precedence)
    pub fn parse_expr(&mut self) -> PassResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PassResult<Expr> {
        let mut left = self.parse_and()?;
        while self.check(&Token::OrOr) {
            self.advance()?;
            let right = self.parse_and()?;
            left = Expr::binary(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> PassResult<Expr> {
        let mut left = self.parse_comparison()?;
        while self.check(&Token::AndAnd) {
            self.advance()?;
            let right = self.parse_comparison()?;
            left = Expr::binary(BinOp::And, left, right);
        }
        Ok(left)
    }

    /// Comparisons do not chain: `a < b < c` is rejected.
    fn parse_comparison(&mut self) -> PassResult<Expr> {
        let left = self.parse_additive()?;
        let op = match &self.current {
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::NotEq) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(left),
        };
        self.advance()?;
        let right = self.parse_additive()?;
        Ok(Expr::binary(op, left, right))
    }

    /// Parse additive expressions: a + b, a - b
    fn parse_additive(&mut self) -> PassResult<Expr> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match &self.current {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_multiplicative()?;
            left = Expr::binary(op, left, right);
        }

        Ok(left)
    }

    /// Parse multiplicative expressions: a * b, a / b, a % b
    fn parse_multiplicative(&mut self) -> PassResult<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match &self.current {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_unary()?;
            left = Expr::binary(op, left, right);
        }

        Ok(left)
    }

    /// Parse unary expressions: -a, !a
    fn parse_unary(&mut self) -> PassResult<Expr> {
        if self.check(&Token::Minus) {
            self.advance()?;
            self.enter()?;
            let operand = self.parse_unary()?;
            self.leave();
            Ok(match operand {
                Expr::Int(v) => Expr::Int(-v),
                other => Expr::binary(BinOp::Sub, Expr::Int(0), other),
            })
        } else if self.check(&Token::Bang) {
            self.advance()?;
            self.enter()?;
            let operand = self.parse_unary()?;
            self.leave();
            Ok(Expr::Not(Box::new(operand)))
        } else {
            self.parse_primary()
        }
    }

    /// Parse primary expressions: literals, names, calls, parenthesized
    fn parse_primary(&mut self) -> PassResult<Expr> {
        match self.current.clone() {
            Some(Token::Int(n)) => {
                self.advance()?;
                Ok(Expr::Int(n))
            }

            Some(Token::Ident(name)) => {
                self.advance()?;

                if !self.check(&Token::LParen) {
                    return Ok(Expr::Var(name));
                }

                let mut args = self.parse_args()?;
                match (name.as_str(), args.len()) {
                    ("min", 2) | ("max", 2) => {
                        let op = if name == "min" { BinOp::Min } else { BinOp::Max };
                        let rhs = args.remove(1);
                        let lhs = args.remove(0);
                        Ok(Expr::binary(op, lhs, rhs))
                    }
                    ("select", 3) => {
                        let else_value = args.remove(2);
                        let then_value = args.remove(1);
                        let cond = args.remove(0);
                        Ok(Expr::select(cond, then_value, else_value))
                    }
                    ("min", _) | ("max", _) | ("select", _) => Err(PassError::parse_error(
                        format!("`{}` given {} arguments", name, args.len()),
                    )),
                    _ => Ok(Expr::Call { name, args }),
                }
            }

            Some(Token::LParen) => {
                self.advance()?;
                self.enter()?;
                let inner = self.parse_expr()?;
                self.leave();
                self.expect(Token::RParen)?;
                Ok(inner)
            }

            _ => Err(self.unexpected("an expression")),
        }
    }

    /// Parse a parenthesized, comma separated argument list
    fn parse_args(&mut self) -> PassResult<Vec<Expr>> {
        self.expect(Token::LParen)?;
        self.enter()?;

        let mut args = Vec::new();
        while !self.check(&Token::RParen) {
            args.push(self.parse_expr()?);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance()?;
        }

        self.leave();
        self.expect(Token::RParen)?;
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_precedence() {
        let expr = parse_expr("a + b * 2 - 1").unwrap();
        assert_eq!(expr.to_string(), "a + b * 2 - 1");
        assert_eq!(
            expr,
            Expr::var("a") + Expr::var("b") * Expr::int(2) - Expr::int(1)
        );
    }

    #[test]
    fn test_parse_builtins() {
        let expr = parse_expr("select(x < 3, min(x, y), max(x, 0))").unwrap();
        assert!(matches!(expr, Expr::Select { .. }));
        assert_eq!(expr.to_string(), "select(x < 3, min(x, y), max(x, 0))");
    }

    #[test]
    fn test_parse_negative_literal() {
        assert_eq!(parse_expr("-2").unwrap(), Expr::Int(-2));
        assert_eq!(
            parse_expr("x - -1").unwrap(),
            Expr::var("x") - Expr::int(-1)
        );
    }

    #[test]
    fn test_parse_loop_nest() {
        let source = "
            realize f([0, 8], [0, 4]) {
                for (f.y, 0, 4) {
                    vectorized for (f.x, 0, 8) {
                        f(f.x, f.y) = input(f.x, f.y) + 1
                    }
                }
            }";
        let stmt = parse_stmt(source).unwrap();

        let Stmt::Realize { name, bounds, body } = &stmt else {
            panic!("Expected realize, got {:?}", stmt);
        };
        assert_eq!(name, "f");
        assert_eq!(bounds.len(), 2);
        let Stmt::For { name, body, kind, .. } = body.as_ref() else {
            panic!("Expected loop");
        };
        assert_eq!(name, "f.y");
        assert_eq!(*kind, ForKind::Serial);
        assert!(matches!(
            body.as_ref(),
            Stmt::For { kind: ForKind::Vectorized, .. }
        ));
    }

    #[test]
    fn test_let_takes_rest_of_block() {
        let stmt = parse_stmt("let w = 4; f(0) = w; f(1) = w").unwrap();
        let Stmt::LetStmt { name, body, .. } = stmt else {
            panic!("Expected let");
        };
        assert_eq!(name, "w");
        assert!(matches!(body.as_ref(), Stmt::Block(stmts) if stmts.len() == 2));
    }

    #[test]
    fn test_print_parse_round_trip() {
        let source = "
            // keep me
            realize g([0, 10]) {
              parallel for (g.x, 0, 10) {
                g(g.x) = select(g.x % 2 == 0, f(g.x / 2), 0)
              }
              eval g(3)
            }";
        let stmt = parse_stmt(source).unwrap();
        let reparsed = parse_stmt(&stmt.to_string()).unwrap();
        assert_eq!(stmt, reparsed);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_stmt("for (x, 0) { }"),
            Err(PassError::ParseError { .. })
        ));
        assert!(matches!(
            parse_stmt("f(0) = 1 }"),
            Err(PassError::ParseError { .. })
        ));
        assert!(matches!(
            parse_expr("a # b"),
            Err(PassError::LexerError { position: 2, .. })
        ));
        assert!(parse_expr("min(a)").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(300), ")".repeat(300));
        assert!(matches!(
            parse_expr(&deep),
            Err(PassError::ParseError { .. })
        ));
    }
}
