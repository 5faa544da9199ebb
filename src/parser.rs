//! Recursive-descent parser with precedence climbing for expressions.
//!
//! The parser is not resilient: it aborts on the first unexpected token
//! with `ParseError{expected, got, offset}`. Recursion depth is bounded so
//! adversarial nesting fails with `ResourceExceeded` instead of blowing the
//! stack.

pub mod ast;

use thiserror::Error;

use crate::error::Error;
use crate::lexer::{self, Token, TokenKind};
use ast::{Assoc, BinOp, Block, Expr, Field, FuncName, Number, Stmt, UnOp};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("expected {expected}, got {got} at offset {offset}")]
pub struct ParseError {
    pub expected: String,
    pub got: String,
    pub offset: usize,
}

/// Maximum recursion depth across statements and expressions.
pub const MAX_DEPTH: usize = 1024;

pub struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
    depth: usize,
    loop_depth: usize,
}

type Result<T> = std::result::Result<T, Error>;

impl<'a> Parser<'a> {
    pub fn new(mut tokens: Vec<Token<'a>>) -> Self {
        if tokens.is_empty() {
            tokens.push(Token::new(TokenKind::Eof, b"", 0));
        }
        Self {
            tokens,
            pos: 0,
            depth: 0,
            loop_depth: 0,
        }
    }

    /// Parses a whole chunk. The chunk body counts as a function body, so a
    /// top-level `return` is legal.
    pub fn parse_chunk(mut self) -> Result<Block> {
        let block = self.parse_block()?;
        if self.current().kind != TokenKind::Eof {
            return Err(self.error("end of input"));
        }
        Ok(block)
    }

    fn parse_block(&mut self) -> Result<Block> {
        self.enter()?;
        let mut stmts = Vec::new();
        loop {
            while self.current().is(TokenKind::Punctuation, b";") {
                self.advance();
            }
            if self.at_block_end() {
                break;
            }
            let is_return = self.current().is(TokenKind::Keyword, b"return");
            stmts.push(self.parse_statement()?);
            if is_return {
                while self.current().is(TokenKind::Punctuation, b";") {
                    self.advance();
                }
                if !self.at_block_end() {
                    return Err(self.error("end of block after 'return'"));
                }
                break;
            }
        }
        self.leave();
        Ok(Block::new(stmts))
    }

    fn at_block_end(&self) -> bool {
        let token = self.current();
        token.kind == TokenKind::Eof
            || (token.kind == TokenKind::Keyword
                && matches!(token.lexeme, b"end" | b"else" | b"elseif" | b"until"))
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        self.enter()?;
        let token = self.current();
        let stmt = match (token.kind, token.lexeme) {
            (TokenKind::Keyword, b"local") => self.parse_local(),
            (TokenKind::Keyword, b"if") => self.parse_if(),
            (TokenKind::Keyword, b"while") => self.parse_while(),
            (TokenKind::Keyword, b"for") => self.parse_for(),
            (TokenKind::Keyword, b"repeat") => self.parse_repeat(),
            (TokenKind::Keyword, b"return") => self.parse_return(),
            (TokenKind::Keyword, b"break") => self.parse_break(),
            (TokenKind::Keyword, b"do") => self.parse_do(),
            (TokenKind::Keyword, b"function") => self.parse_function_decl(),
            (TokenKind::Keyword, b"goto") => Err(self.error("statement ('goto' is unsupported)")),
            _ => self.parse_expression_statement(),
        }?;
        self.leave();
        Ok(stmt)
    }

    fn parse_local(&mut self) -> Result<Stmt> {
        self.expect_keyword(b"local")?;
        if self.current().is(TokenKind::Keyword, b"function") {
            self.advance();
            let name = self.expect_identifier()?;
            let (params, is_vararg, body) = self.parse_function_rest(false)?;
            return Ok(Stmt::FunctionDecl {
                name: FuncName::plain(name),
                is_local: true,
                params,
                is_vararg,
                body,
            });
        }
        let mut names = vec![self.expect_identifier()?];
        while self.current().is(TokenKind::Punctuation, b",") {
            self.advance();
            names.push(self.expect_identifier()?);
        }
        let mut values = Vec::new();
        if self.current().is(TokenKind::Operator, b"=") {
            self.advance();
            values = self.parse_expr_list()?;
        }
        Ok(Stmt::Local { names, values })
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        self.expect_keyword(b"if")?;
        let cond = self.parse_expr(1)?;
        self.expect_keyword(b"then")?;
        let then = self.parse_block()?;
        let mut elseifs = Vec::new();
        while self.current().is(TokenKind::Keyword, b"elseif") {
            self.advance();
            let elseif_cond = self.parse_expr(1)?;
            self.expect_keyword(b"then")?;
            elseifs.push((elseif_cond, self.parse_block()?));
        }
        let els = if self.current().is(TokenKind::Keyword, b"else") {
            self.advance();
            Some(self.parse_block()?)
        } else {
            None
        };
        self.expect_keyword(b"end")?;
        Ok(Stmt::If {
            cond,
            then,
            elseifs,
            els,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        self.expect_keyword(b"while")?;
        let cond = self.parse_expr(1)?;
        self.expect_keyword(b"do")?;
        let body = self.parse_loop_body()?;
        self.expect_keyword(b"end")?;
        Ok(Stmt::While { cond, body })
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        self.expect_keyword(b"for")?;
        let first = self.expect_identifier()?;
        if self.current().is(TokenKind::Operator, b"=") {
            self.advance();
            let start = self.parse_expr(1)?;
            self.expect_punctuation(b",")?;
            let end = self.parse_expr(1)?;
            let step = if self.current().is(TokenKind::Punctuation, b",") {
                self.advance();
                Some(self.parse_expr(1)?)
            } else {
                None
            };
            self.expect_keyword(b"do")?;
            let body = self.parse_loop_body()?;
            self.expect_keyword(b"end")?;
            return Ok(Stmt::NumericFor {
                var: first,
                start,
                end,
                step,
                body,
            });
        }
        let mut vars = vec![first];
        while self.current().is(TokenKind::Punctuation, b",") {
            self.advance();
            vars.push(self.expect_identifier()?);
        }
        self.expect_keyword(b"in")?;
        let exprs = self.parse_expr_list()?;
        self.expect_keyword(b"do")?;
        let body = self.parse_loop_body()?;
        self.expect_keyword(b"end")?;
        Ok(Stmt::GenericFor { vars, exprs, body })
    }

    fn parse_repeat(&mut self) -> Result<Stmt> {
        self.expect_keyword(b"repeat")?;
        let body = self.parse_loop_body()?;
        self.expect_keyword(b"until")?;
        let cond = self.parse_expr(1)?;
        Ok(Stmt::Repeat { body, cond })
    }

    fn parse_loop_body(&mut self) -> Result<Block> {
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        body
    }

    fn parse_return(&mut self) -> Result<Stmt> {
        self.expect_keyword(b"return")?;
        let exprs = if self.at_block_end() || self.current().is(TokenKind::Punctuation, b";") {
            Vec::new()
        } else {
            self.parse_expr_list()?
        };
        Ok(Stmt::Return { exprs })
    }

    fn parse_break(&mut self) -> Result<Stmt> {
        if self.loop_depth == 0 {
            return Err(self.error("'break' inside a loop"));
        }
        self.expect_keyword(b"break")?;
        Ok(Stmt::Break)
    }

    fn parse_do(&mut self) -> Result<Stmt> {
        self.expect_keyword(b"do")?;
        let block = self.parse_block()?;
        self.expect_keyword(b"end")?;
        Ok(Stmt::Do(block))
    }

    fn parse_function_decl(&mut self) -> Result<Stmt> {
        self.expect_keyword(b"function")?;
        let base = self.expect_identifier()?;
        let mut path = Vec::new();
        while self.current().is(TokenKind::Punctuation, b".") {
            self.advance();
            path.push(self.expect_identifier()?);
        }
        let method = if self.current().is(TokenKind::Punctuation, b":") {
            self.advance();
            Some(self.expect_identifier()?)
        } else {
            None
        };
        let is_method = method.is_some();
        let (params, is_vararg, body) = self.parse_function_rest(is_method)?;
        Ok(Stmt::FunctionDecl {
            name: FuncName { base, path, method },
            is_local: false,
            params,
            is_vararg,
            body,
        })
    }

    /// Parses `( params ) body end`. Method declarations get the implicit
    /// `self` parameter prepended.
    fn parse_function_rest(&mut self, is_method: bool) -> Result<(Vec<String>, bool, Block)> {
        self.expect_punctuation(b"(")?;
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        let mut is_vararg = false;
        if !self.current().is(TokenKind::Punctuation, b")") {
            loop {
                if self.current().is(TokenKind::Operator, b"...") {
                    self.advance();
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_identifier()?);
                if self.current().is(TokenKind::Punctuation, b",") {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_punctuation(b")")?;
        // The function body is not a loop body: a surrounding loop cannot be
        // broken from inside the function.
        let saved_loop_depth = std::mem::take(&mut self.loop_depth);
        let body = self.parse_block()?;
        self.loop_depth = saved_loop_depth;
        self.expect_keyword(b"end")?;
        Ok((params, is_vararg, body))
    }

    fn parse_expression_statement(&mut self) -> Result<Stmt> {
        let first = self.parse_suffixed()?;
        if self.current().is(TokenKind::Operator, b"=")
            || self.current().is(TokenKind::Punctuation, b",")
        {
            let mut targets = vec![first];
            while self.current().is(TokenKind::Punctuation, b",") {
                self.advance();
                targets.push(self.parse_suffixed()?);
            }
            for target in &targets {
                if !matches!(
                    target,
                    Expr::Variable(_) | Expr::MemberAccess { .. } | Expr::IndexAccess { .. }
                ) {
                    return Err(self.error("assignable expression"));
                }
            }
            self.expect_operator(b"=")?;
            let values = self.parse_expr_list()?;
            return Ok(Stmt::Assign { targets, values });
        }
        if !matches!(first, Expr::Call { .. } | Expr::MethodCall { .. }) {
            return Err(self.error("'=' or call"));
        }
        Ok(Stmt::Expression(first))
    }

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>> {
        let mut exprs = vec![self.parse_expr(1)?];
        while self.current().is(TokenKind::Punctuation, b",") {
            self.advance();
            exprs.push(self.parse_expr(1)?);
        }
        Ok(exprs)
    }

    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr> {
        self.enter()?;
        let mut left = self.parse_unary()?;
        loop {
            let Some(op) = self.peek_binop() else { break };
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let next_min = match op.assoc() {
                Assoc::Left => prec + 1,
                Assoc::Right => prec,
            };
            let right = self.parse_expr(next_min)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.leave();
        Ok(left)
    }

    fn peek_binop(&self) -> Option<BinOp> {
        let token = self.current();
        match token.kind {
            TokenKind::Operator => BinOp::from_lexeme(token.lexeme),
            TokenKind::Keyword if matches!(token.lexeme, b"and" | b"or") => {
                BinOp::from_lexeme(token.lexeme)
            }
            _ => None,
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.enter()?;
        let token = self.current();
        let op = match (token.kind, token.lexeme) {
            (TokenKind::Keyword, b"not") => Some(UnOp::Not),
            (TokenKind::Operator, b"-") => Some(UnOp::Neg),
            (TokenKind::Operator, b"#") => Some(UnOp::Len),
            (TokenKind::Operator, b"~") => Some(UnOp::BitNot),
            _ => None,
        };
        let expr = if let Some(op) = op {
            self.advance();
            let arg = self.parse_unary()?;
            Ok(Expr::Unary {
                op,
                arg: Box::new(arg),
            })
        } else {
            self.parse_simple()
        };
        self.leave();
        expr
    }

    fn parse_simple(&mut self) -> Result<Expr> {
        let token = self.current();
        match (token.kind, token.lexeme) {
            (TokenKind::Keyword, b"nil") => {
                self.advance();
                Ok(Expr::Nil)
            }
            (TokenKind::Keyword, b"true") => {
                self.advance();
                Ok(Expr::Boolean(true))
            }
            (TokenKind::Keyword, b"false") => {
                self.advance();
                Ok(Expr::Boolean(false))
            }
            (TokenKind::Number, _) => {
                let number = parse_number(token.lexeme)
                    .ok_or_else(|| Error::from(self.error_at("numeric literal", token)))?;
                self.advance();
                Ok(Expr::Number(number))
            }
            (TokenKind::String, _) => {
                let bytes = lexer::decode_string(token.lexeme)
                    .map_err(|_| Error::from(self.error_at("valid string escape", token)))?;
                self.advance();
                Ok(Expr::String(bytes))
            }
            (TokenKind::Operator, b"...") => {
                self.advance();
                Ok(Expr::Vararg)
            }
            (TokenKind::Keyword, b"function") => {
                self.advance();
                let (params, is_vararg, body) = self.parse_function_rest(false)?;
                Ok(Expr::FunctionExpr {
                    params,
                    is_vararg,
                    body,
                })
            }
            (TokenKind::Punctuation, b"{") => self.parse_table(),
            _ => self.parse_suffixed(),
        }
    }

    fn parse_table(&mut self) -> Result<Expr> {
        self.expect_punctuation(b"{")?;
        let mut fields = Vec::new();
        while !self.current().is(TokenKind::Punctuation, b"}") {
            if self.current().is(TokenKind::Punctuation, b"[") {
                self.advance();
                let key = self.parse_expr(1)?;
                self.expect_punctuation(b"]")?;
                self.expect_operator(b"=")?;
                let val = self.parse_expr(1)?;
                fields.push(Field::Index { key, val });
            } else if self.current().kind == TokenKind::Identifier
                && self.peek_next().is(TokenKind::Operator, b"=")
            {
                let name = self.expect_identifier()?;
                self.advance();
                let val = self.parse_expr(1)?;
                fields.push(Field::Named { name, val });
            } else {
                fields.push(Field::Array(self.parse_expr(1)?));
            }
            if self.current().is(TokenKind::Punctuation, b",")
                || self.current().is(TokenKind::Punctuation, b";")
            {
                self.advance();
            } else {
                break;
            }
        }
        self.expect_punctuation(b"}")?;
        Ok(Expr::Table { fields })
    }

    fn parse_suffixed(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let token = self.current();
            match (token.kind, token.lexeme) {
                (TokenKind::Punctuation, b".") => {
                    self.advance();
                    let member = self.expect_identifier()?;
                    expr = Expr::MemberAccess {
                        obj: Box::new(expr),
                        member,
                    };
                }
                (TokenKind::Punctuation, b"[") => {
                    self.advance();
                    let index = self.parse_expr(1)?;
                    self.expect_punctuation(b"]")?;
                    expr = Expr::IndexAccess {
                        obj: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                (TokenKind::Punctuation, b":") => {
                    self.advance();
                    let method = self.expect_identifier()?;
                    let args = self.parse_call_args()?;
                    expr = Expr::MethodCall {
                        obj: Box::new(expr),
                        method,
                        args,
                    };
                }
                (TokenKind::Punctuation, b"(")
                | (TokenKind::Punctuation, b"{")
                | (TokenKind::String, _) => {
                    let args = self.parse_call_args()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Call arguments: parenthesized list, or the single-argument sugar
    /// forms (a string literal or a table constructor).
    fn parse_call_args(&mut self) -> Result<Vec<Expr>> {
        let token = self.current();
        match (token.kind, token.lexeme) {
            (TokenKind::String, _) => {
                let bytes = lexer::decode_string(token.lexeme)
                    .map_err(|_| Error::from(self.error_at("valid string escape", token)))?;
                self.advance();
                Ok(vec![Expr::String(bytes)])
            }
            (TokenKind::Punctuation, b"{") => Ok(vec![self.parse_table()?]),
            _ => {
                self.expect_punctuation(b"(")?;
                let args = if self.current().is(TokenKind::Punctuation, b")") {
                    Vec::new()
                } else {
                    self.parse_expr_list()?
                };
                self.expect_punctuation(b")")?;
                Ok(args)
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.current();
        match (token.kind, token.lexeme) {
            (TokenKind::Identifier, _) => {
                let name = token.text();
                self.advance();
                Ok(Expr::Variable(name))
            }
            (TokenKind::Punctuation, b"(") => {
                self.advance();
                let expr = self.parse_expr(1)?;
                self.expect_punctuation(b")")?;
                Ok(expr)
            }
            _ => Err(self.error("expression")),
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(Error::ResourceExceeded {
                what: "syntax tree depth",
                limit: MAX_DEPTH,
                actual: self.depth,
            });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn current(&self) -> Token<'a> {
        self.tokens
            .get(self.pos)
            .copied()
            .unwrap_or_else(|| Token::new(TokenKind::Eof, b"", 0))
    }

    fn peek_next(&self) -> Token<'a> {
        self.tokens
            .get(self.pos + 1)
            .copied()
            .unwrap_or_else(|| Token::new(TokenKind::Eof, b"", 0))
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        let token = self.current();
        if token.kind == TokenKind::Identifier {
            self.advance();
            Ok(token.text())
        } else {
            Err(self.error("identifier"))
        }
    }

    fn expect_keyword(&mut self, keyword: &[u8]) -> Result<()> {
        self.expect(TokenKind::Keyword, keyword)
    }

    fn expect_operator(&mut self, operator: &[u8]) -> Result<()> {
        self.expect(TokenKind::Operator, operator)
    }

    fn expect_punctuation(&mut self, punctuation: &[u8]) -> Result<()> {
        self.expect(TokenKind::Punctuation, punctuation)
    }

    fn expect(&mut self, kind: TokenKind, lexeme: &[u8]) -> Result<()> {
        let token = self.current();
        if token.is(kind, lexeme) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("'{}'", String::from_utf8_lossy(lexeme))))
        }
    }

    fn error(&self, expected: &str) -> Error {
        Error::from(self.error_at(expected, self.current()))
    }

    fn error_at(&self, expected: &str, token: Token<'a>) -> ParseError {
        let got = match token.kind {
            TokenKind::Eof => "end of input".to_string(),
            _ => format!("'{}'", token.text()),
        };
        ParseError {
            expected: expected.to_string(),
            got,
            offset: token.offset,
        }
    }
}

fn parse_number(lexeme: &[u8]) -> Option<Number> {
    let text = std::str::from_utf8(lexeme).ok()?;
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        if hex.is_empty() {
            return None;
        }
        return u64::from_str_radix(hex, 16).ok().map(|v| Number::Int(v as i64));
    }
    if text.contains(['.', 'e', 'E']) {
        return text.parse::<f64>().ok().map(Number::Float);
    }
    match text.parse::<i64>() {
        Ok(value) => Some(Number::Int(value)),
        Err(_) => text.parse::<f64>().ok().map(Number::Float),
    }
}

/// Parses a token stream into a chunk body.
pub fn parse_tokens(tokens: Vec<Token<'_>>) -> Result<Block> {
    Parser::new(tokens).parse_chunk()
}

/// Convenience entry: tokenize and parse source bytes.
pub fn parse_source(source: &[u8]) -> Result<Block> {
    parse_tokens(crate::lexer::tokenize(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn parse(source: &[u8]) -> Block {
        parse_source(source).expect("parse failed")
    }

    fn parse_err(source: &[u8]) -> Error {
        parse_source(source).expect_err("expected parse failure")
    }

    #[test]
    fn parses_local_assignment_and_return() {
        let block = parse(b"local x = 1 return x");
        assert_eq!(
            block.stmts,
            vec![
                Stmt::Local {
                    names: vec!["x".to_string()],
                    values: vec![Expr::Number(Number::Int(1))],
                },
                Stmt::Return {
                    exprs: vec![Expr::Variable("x".to_string())],
                },
            ]
        );
    }

    #[test]
    fn precedence_shapes_arithmetic() {
        let block = parse(b"return 1 + 2 * 3");
        let Stmt::Return { exprs } = &block.stmts[0] else {
            panic!("expected return");
        };
        assert_eq!(
            exprs[0],
            Expr::Binary {
                op: BinOp::Add,
                left: Box::new(Expr::Number(Number::Int(1))),
                right: Box::new(Expr::Binary {
                    op: BinOp::Mul,
                    left: Box::new(Expr::Number(Number::Int(2))),
                    right: Box::new(Expr::Number(Number::Int(3))),
                }),
            }
        );
    }

    #[test]
    fn concat_is_right_associative() {
        let block = parse(b"return a .. b .. c");
        let Stmt::Return { exprs } = &block.stmts[0] else {
            panic!("expected return");
        };
        let Expr::Binary { op, right, .. } = &exprs[0] else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinOp::Concat);
        assert!(matches!(
            right.as_ref(),
            Expr::Binary {
                op: BinOp::Concat,
                ..
            }
        ));
    }

    #[test]
    fn unary_binds_tighter_than_pow() {
        let block = parse(b"return -x ^ 2");
        let Stmt::Return { exprs } = &block.stmts[0] else {
            panic!("expected return");
        };
        let Expr::Binary { op, left, .. } = &exprs[0] else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinOp::Pow);
        assert!(matches!(
            left.as_ref(),
            Expr::Unary { op: UnOp::Neg, .. }
        ));
    }

    #[test]
    fn parses_statement_forms() {
        let block = parse(indoc! {b"
            local t = { 1, x = 2, [3] = 4 }
            for i = 1, 10, 2 do t[i] = i end
            for k, v in pairs(t) do print(k, v) end
            while #t > 0 do break end
            repeat local z = 1 until true
            do local inner = 1 end
            if t then return 1 elseif nil then return 2 else return 3 end
        "});
        assert_eq!(block.stmts.len(), 7);
        assert!(matches!(block.stmts[1], Stmt::NumericFor { .. }));
        assert!(matches!(block.stmts[2], Stmt::GenericFor { .. }));
        assert!(matches!(block.stmts[4], Stmt::Repeat { .. }));
        assert!(matches!(block.stmts[5], Stmt::Do(_)));
    }

    #[test]
    fn parses_function_decl_variants() {
        let block = parse(indoc! {b"
            function outer.inner:method(a, ...) return a end
            local function helper(b) return b end
        "});
        let Stmt::FunctionDecl {
            name,
            is_local,
            params,
            is_vararg,
            ..
        } = &block.stmts[0]
        else {
            panic!("expected function declaration");
        };
        assert!(!is_local);
        assert!(is_vararg);
        assert_eq!(name.base, "outer");
        assert_eq!(name.path, vec!["inner".to_string()]);
        assert_eq!(name.method.as_deref(), Some("method"));
        assert_eq!(params, &vec!["self".to_string(), "a".to_string()]);
        assert!(matches!(
            block.stmts[1],
            Stmt::FunctionDecl { is_local: true, .. }
        ));
    }

    #[test]
    fn parses_call_sugar_forms() {
        let block = parse(b"f \"hi\" g { 1 } obj:m(2)");
        assert_eq!(block.stmts.len(), 3);
        assert!(matches!(
            &block.stmts[0],
            Stmt::Expression(Expr::Call { args, .. }) if args.len() == 1
        ));
        assert!(matches!(
            &block.stmts[2],
            Stmt::Expression(Expr::MethodCall { .. })
        ));
    }

    #[test]
    fn multi_assignment_targets_are_validated() {
        let block = parse(b"a, b.c, d[1] = 1, 2, 3");
        let Stmt::Assign { targets, values } = &block.stmts[0] else {
            panic!("expected assignment");
        };
        assert_eq!(targets.len(), 3);
        assert_eq!(values.len(), 3);

        let err = parse_err(b"f() = 1");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn reports_offset_of_unexpected_token() {
        let err = parse_err(b"local =");
        let Error::Parse(parse_error) = err else {
            panic!("expected parse error");
        };
        assert_eq!(parse_error.offset, 6);
        assert_eq!(parse_error.expected, "identifier");
        assert_eq!(parse_error.got, "'='");
    }

    #[test]
    fn rejects_break_outside_loop() {
        let err = parse_err(b"break");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn break_inside_function_inside_loop_is_rejected() {
        let err = parse_err(b"while true do local f = function() break end end");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn rejects_goto() {
        let err = parse_err(b"goto done");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn rejects_unknown_token() {
        let err = parse_err(b"local x = 1 @");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn statements_after_return_are_rejected() {
        let err = parse_err(b"return 1 local x = 2");
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn deep_nesting_exceeds_resource_limit() {
        let mut source = Vec::new();
        source.extend_from_slice(b"return ");
        for _ in 0..2000 {
            source.push(b'(');
        }
        source.push(b'1');
        for _ in 0..2000 {
            source.push(b')');
        }
        let err = parse_err(&source);
        assert!(matches!(err, Error::ResourceExceeded { .. }));
    }

    #[test]
    fn parses_number_forms() {
        let block = parse(b"return 42, 0x10, 3.5, 1e2");
        let Stmt::Return { exprs } = &block.stmts[0] else {
            panic!("expected return");
        };
        assert_eq!(exprs[0], Expr::Number(Number::Int(42)));
        assert_eq!(exprs[1], Expr::Number(Number::Int(16)));
        assert_eq!(exprs[2], Expr::Number(Number::Float(3.5)));
        assert_eq!(exprs[3], Expr::Number(Number::Float(100.0)));
    }
}
