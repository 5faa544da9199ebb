//! AST to source text.
//!
//! Parentheses are inserted iff the parent operator binds strictly tighter
//! than the child, or equally tight with opposite associativity on that
//! side, so `parse(print(parse(s)))` is equivalent to `parse(s)` up to
//! whitespace, comments, and redundant parentheses.

use std::fmt::Write;

use crate::parser::ast::{Assoc, Block, Expr, Field, Number, Stmt, UnOp, UNARY_PRECEDENCE};

const INDENT: &str = "  ";

pub fn print_chunk(chunk: &Block) -> String {
    let mut printer = Printer::new();
    printer.block(chunk);
    printer.out
}

/// Renders one expression without surrounding statement context.
pub fn print_expr(expr: &Expr) -> String {
    let mut printer = Printer::new();
    printer.expr(expr);
    printer.out
}

struct Printer {
    out: String,
    indent: usize,
}

impl Printer {
    fn new() -> Self {
        Self {
            out: String::new(),
            indent: 0,
        }
    }

    fn line_start(&mut self) {
        for _ in 0..self.indent {
            self.out.push_str(INDENT);
        }
    }

    fn block(&mut self, block: &Block) {
        for stmt in &block.stmts {
            self.stmt(stmt);
        }
    }

    fn nested_block(&mut self, block: &Block) {
        self.indent += 1;
        self.block(block);
        self.indent -= 1;
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::RawEmit(text) => {
                // Spliced verbatim; the payload is already legal source.
                self.out.push_str(text);
                if !text.ends_with('\n') {
                    self.out.push('\n');
                }
                return;
            }
            _ => self.line_start(),
        }
        match stmt {
            Stmt::Do(block) => {
                self.out.push_str("do\n");
                self.nested_block(block);
                self.line_start();
                self.out.push_str("end\n");
            }
            Stmt::Local { names, values } => {
                self.out.push_str("local ");
                self.out.push_str(&names.join(", "));
                if !values.is_empty() {
                    self.out.push_str(" = ");
                    self.expr_list(values);
                }
                self.out.push('\n');
            }
            Stmt::Assign { targets, values } => {
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.expr(target);
                }
                self.out.push_str(" = ");
                self.expr_list(values);
                self.out.push('\n');
            }
            Stmt::If {
                cond,
                then,
                elseifs,
                els,
            } => {
                self.out.push_str("if ");
                self.expr(cond);
                self.out.push_str(" then\n");
                self.nested_block(then);
                for (elseif_cond, elseif_block) in elseifs {
                    self.line_start();
                    self.out.push_str("elseif ");
                    self.expr(elseif_cond);
                    self.out.push_str(" then\n");
                    self.nested_block(elseif_block);
                }
                if let Some(els) = els {
                    self.line_start();
                    self.out.push_str("else\n");
                    self.nested_block(els);
                }
                self.line_start();
                self.out.push_str("end\n");
            }
            Stmt::NumericFor {
                var,
                start,
                end,
                step,
                body,
            } => {
                write!(self.out, "for {var} = ").expect("write to string");
                self.expr(start);
                self.out.push_str(", ");
                self.expr(end);
                if let Some(step) = step {
                    self.out.push_str(", ");
                    self.expr(step);
                }
                self.out.push_str(" do\n");
                self.nested_block(body);
                self.line_start();
                self.out.push_str("end\n");
            }
            Stmt::GenericFor { vars, exprs, body } => {
                self.out.push_str("for ");
                self.out.push_str(&vars.join(", "));
                self.out.push_str(" in ");
                self.expr_list(exprs);
                self.out.push_str(" do\n");
                self.nested_block(body);
                self.line_start();
                self.out.push_str("end\n");
            }
            Stmt::While { cond, body } => {
                self.out.push_str("while ");
                self.expr(cond);
                self.out.push_str(" do\n");
                self.nested_block(body);
                self.line_start();
                self.out.push_str("end\n");
            }
            Stmt::Repeat { body, cond } => {
                self.out.push_str("repeat\n");
                self.nested_block(body);
                self.line_start();
                self.out.push_str("until ");
                self.expr(cond);
                self.out.push('\n');
            }
            Stmt::Return { exprs } => {
                self.out.push_str("return");
                if !exprs.is_empty() {
                    self.out.push(' ');
                    self.expr_list(exprs);
                }
                self.out.push('\n');
            }
            Stmt::Break => self.out.push_str("break\n"),
            Stmt::FunctionDecl {
                name,
                is_local,
                params,
                is_vararg,
                body,
            } => {
                if *is_local {
                    self.out.push_str("local ");
                }
                self.out.push_str("function ");
                self.out.push_str(&name.base);
                for segment in &name.path {
                    self.out.push('.');
                    self.out.push_str(segment);
                }
                // Method declarations carry the implicit `self` parameter in
                // the tree; it is not written back.
                let params: &[String] = if let Some(method) = &name.method {
                    self.out.push(':');
                    self.out.push_str(method);
                    &params[1..]
                } else {
                    params
                };
                self.param_list(params, *is_vararg);
                self.out.push('\n');
                self.nested_block(body);
                self.line_start();
                self.out.push_str("end\n");
            }
            Stmt::Expression(expr) => {
                // A line-leading `(` would be parsed as a call continuation
                // of the previous statement.
                let at = self.out.len();
                self.expr(expr);
                if self.out.as_bytes().get(at) == Some(&b'(') {
                    self.out.insert(at, ';');
                }
                self.out.push('\n');
            }
            Stmt::RawEmit(_) => unreachable!("handled above"),
        }
    }

    fn param_list(&mut self, params: &[String], is_vararg: bool) {
        self.out.push('(');
        self.out.push_str(&params.join(", "));
        if is_vararg {
            if !params.is_empty() {
                self.out.push_str(", ");
            }
            self.out.push_str("...");
        }
        self.out.push(')');
    }

    fn expr_list(&mut self, exprs: &[Expr]) {
        for (i, expr) in exprs.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(expr);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Number(number) => self.number(*number),
            Expr::String(bytes) => self.string(bytes),
            Expr::Boolean(true) => self.out.push_str("true"),
            Expr::Boolean(false) => self.out.push_str("false"),
            Expr::Nil => self.out.push_str("nil"),
            Expr::Vararg => self.out.push_str("..."),
            Expr::Variable(name) => self.out.push_str(name),
            Expr::MemberAccess { obj, member } => {
                self.prefix_operand(obj);
                self.out.push('.');
                self.out.push_str(member);
            }
            Expr::IndexAccess { obj, index } => {
                self.prefix_operand(obj);
                self.out.push('[');
                self.expr(index);
                self.out.push(']');
            }
            Expr::Call { callee, args } => {
                self.prefix_operand(callee);
                self.out.push('(');
                self.expr_list(args);
                self.out.push(')');
            }
            Expr::MethodCall { obj, method, args } => {
                self.prefix_operand(obj);
                self.out.push(':');
                self.out.push_str(method);
                self.out.push('(');
                self.expr_list(args);
                self.out.push(')');
            }
            Expr::Binary { op, left, right } => {
                let prec = op.precedence();
                self.operand(left, prec, op.assoc() == Assoc::Right);
                write!(self.out, " {} ", op.symbol()).expect("write to string");
                self.operand(right, prec, op.assoc() == Assoc::Left);
            }
            Expr::Unary { op, arg } => {
                self.out.push_str(op.symbol());
                if *op == UnOp::Not {
                    self.out.push(' ');
                }
                // `- -x` must not print as `--x` (a comment), and `~~x`
                // reads better parenthesized too.
                let shield = matches!(
                    (op, arg.as_ref()),
                    (UnOp::Neg, Expr::Unary { op: UnOp::Neg, .. })
                        | (UnOp::BitNot, Expr::Unary { op: UnOp::BitNot, .. })
                );
                if shield {
                    self.out.push('(');
                    self.expr(arg);
                    self.out.push(')');
                } else {
                    self.operand(arg, UNARY_PRECEDENCE, false);
                }
            }
            Expr::FunctionExpr {
                params,
                is_vararg,
                body,
            } => {
                self.out.push_str("function");
                self.param_list(params, *is_vararg);
                self.out.push('\n');
                self.nested_block(body);
                self.line_start();
                self.out.push_str("end");
            }
            Expr::Table { fields } => {
                if fields.is_empty() {
                    self.out.push_str("{}");
                    return;
                }
                self.out.push_str("{ ");
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    match field {
                        Field::Index { key, val } => {
                            self.out.push('[');
                            self.expr(key);
                            self.out.push_str("] = ");
                            self.expr(val);
                        }
                        Field::Named { name, val } => {
                            write!(self.out, "{name} = ").expect("write to string");
                            self.expr(val);
                        }
                        Field::Array(val) => self.expr(val),
                    }
                }
                self.out.push_str(" }");
            }
        }
    }

    /// Prints an operand of a binary operator with precedence `parent`;
    /// `needs_tighter` is set on the side where equal precedence must still
    /// be parenthesized (the non-associative side).
    fn operand(&mut self, expr: &Expr, parent: u8, needs_tighter: bool) {
        let child = match expr {
            Expr::Binary { op, .. } => Some(op.precedence()),
            Expr::Unary { .. } => Some(UNARY_PRECEDENCE),
            _ => None,
        };
        let parens = match child {
            Some(child) => child < parent || (child == parent && needs_tighter),
            None => false,
        };
        if parens {
            self.out.push('(');
            self.expr(expr);
            self.out.push(')');
        } else {
            self.expr(expr);
        }
    }

    /// Base of a call, member, index, or method suffix. Anything that is
    /// not itself a prefix expression must be parenthesized there.
    fn prefix_operand(&mut self, expr: &Expr) {
        if expr.is_prefix() {
            self.expr(expr);
        } else {
            self.out.push('(');
            self.expr(expr);
            self.out.push(')');
        }
    }

    fn number(&mut self, number: Number) {
        match number {
            Number::Int(value) => {
                write!(self.out, "{value}").expect("write to string");
            }
            Number::Float(value) => {
                let mut text = format!("{value}");
                if !text.contains(['.', 'e', 'E', 'n', 'i']) {
                    text.push_str(".0");
                }
                self.out.push_str(&text);
            }
        }
    }

    /// Minimal escaping: printable ASCII stays, everything else becomes a
    /// three-digit decimal escape so a following digit cannot extend it.
    fn string(&mut self, bytes: &[u8]) {
        self.out.push('"');
        for &byte in bytes {
            match byte {
                b'"' => self.out.push_str("\\\""),
                b'\\' => self.out.push_str("\\\\"),
                b'\n' => self.out.push_str("\\n"),
                b'\r' => self.out.push_str("\\r"),
                b'\t' => self.out.push_str("\\t"),
                0x20..=0x7E => self.out.push(byte as char),
                _ => {
                    write!(self.out, "\\{byte:03}").expect("write to string");
                }
            }
        }
        self.out.push('"');
    }
}
