//! Small constructors for synthesized AST fragments. Passes build their
//! emitted code as real trees and let the printer handle precedence, which
//! keeps generated source parseable by construction.

use crate::parser::ast::{BinOp, Block, Expr, Field, Number, Stmt, UnOp};

pub(crate) fn num(value: i64) -> Expr {
    Expr::Number(Number::Int(value))
}

pub(crate) fn var(name: impl Into<String>) -> Expr {
    Expr::Variable(name.into())
}

pub(crate) fn string(bytes: impl Into<Vec<u8>>) -> Expr {
    Expr::String(bytes.into())
}

pub(crate) fn bin(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

pub(crate) fn unary(op: UnOp, arg: Expr) -> Expr {
    Expr::Unary {
        op,
        arg: Box::new(arg),
    }
}

pub(crate) fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call {
        callee: Box::new(callee),
        args,
    }
}

pub(crate) fn name_call(name: &str, args: Vec<Expr>) -> Expr {
    call(var(name), args)
}

pub(crate) fn member(obj: Expr, name: impl Into<String>) -> Expr {
    Expr::MemberAccess {
        obj: Box::new(obj),
        member: name.into(),
    }
}

pub(crate) fn index(obj: Expr, idx: Expr) -> Expr {
    Expr::IndexAccess {
        obj: Box::new(obj),
        index: Box::new(idx),
    }
}

pub(crate) fn array_table(items: Vec<Expr>) -> Expr {
    Expr::Table {
        fields: items.into_iter().map(Field::Array).collect(),
    }
}

pub(crate) fn function(params: Vec<String>, is_vararg: bool, body: Vec<Stmt>) -> Expr {
    Expr::FunctionExpr {
        params,
        is_vararg,
        body: Block::new(body),
    }
}

pub(crate) fn local(name: &str, value: Expr) -> Stmt {
    Stmt::Local {
        names: vec![name.to_string()],
        values: vec![value],
    }
}

pub(crate) fn assign(target: Expr, value: Expr) -> Stmt {
    Stmt::Assign {
        targets: vec![target],
        values: vec![value],
    }
}
