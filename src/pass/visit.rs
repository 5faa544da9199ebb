//! Explicit recursive traversals shared by the passes.
//!
//! No visitor objects: walks are plain recursive procedures that carry
//! their context on the call stack, and callbacks receive mutable nodes.

use crate::parser::ast::{Block, Expr, Field, Stmt};

/// Applies `f` to every block in the tree, innermost first. Function
/// bodies (declarations and function expressions) are included.
pub fn blocks_mut(block: &mut Block, f: &mut impl FnMut(&mut Block)) {
    for stmt in &mut block.stmts {
        match stmt {
            Stmt::Do(inner) => blocks_mut(inner, f),
            Stmt::If {
                then, elseifs, els, ..
            } => {
                blocks_mut(then, f);
                for (_, elseif_block) in elseifs {
                    blocks_mut(elseif_block, f);
                }
                if let Some(els) = els {
                    blocks_mut(els, f);
                }
            }
            Stmt::NumericFor { body, .. }
            | Stmt::GenericFor { body, .. }
            | Stmt::While { body, .. }
            | Stmt::Repeat { body, .. }
            | Stmt::FunctionDecl { body, .. } => blocks_mut(body, f),
            Stmt::Local { values, .. } | Stmt::Return { exprs: values } => {
                for value in values {
                    expr_blocks_mut(value, f);
                }
            }
            Stmt::Assign { targets, values } => {
                for expr in targets.iter_mut().chain(values.iter_mut()) {
                    expr_blocks_mut(expr, f);
                }
            }
            Stmt::Expression(expr) => expr_blocks_mut(expr, f),
            Stmt::Break | Stmt::RawEmit(_) => {}
        }
        // Condition expressions may carry function bodies too.
        match stmt {
            Stmt::If { cond, elseifs, .. } => {
                expr_blocks_mut(cond, f);
                for (elseif_cond, _) in elseifs {
                    expr_blocks_mut(elseif_cond, f);
                }
            }
            Stmt::While { cond, .. } | Stmt::Repeat { cond, .. } => expr_blocks_mut(cond, f),
            Stmt::NumericFor {
                start, end, step, ..
            } => {
                expr_blocks_mut(start, f);
                expr_blocks_mut(end, f);
                if let Some(step) = step {
                    expr_blocks_mut(step, f);
                }
            }
            Stmt::GenericFor { exprs, .. } => {
                for expr in exprs {
                    expr_blocks_mut(expr, f);
                }
            }
            _ => {}
        }
    }
    f(block);
}

fn expr_blocks_mut(expr: &mut Expr, f: &mut impl FnMut(&mut Block)) {
    match expr {
        Expr::FunctionExpr { body, .. } => blocks_mut(body, f),
        Expr::MemberAccess { obj, .. } => expr_blocks_mut(obj, f),
        Expr::IndexAccess { obj, index } => {
            expr_blocks_mut(obj, f);
            expr_blocks_mut(index, f);
        }
        Expr::Call { callee, args } => {
            expr_blocks_mut(callee, f);
            for arg in args {
                expr_blocks_mut(arg, f);
            }
        }
        Expr::MethodCall { obj, args, .. } => {
            expr_blocks_mut(obj, f);
            for arg in args {
                expr_blocks_mut(arg, f);
            }
        }
        Expr::Binary { left, right, .. } => {
            expr_blocks_mut(left, f);
            expr_blocks_mut(right, f);
        }
        Expr::Unary { arg, .. } => expr_blocks_mut(arg, f),
        Expr::Table { fields } => {
            for field in fields {
                match field {
                    Field::Index { key, val } => {
                        expr_blocks_mut(key, f);
                        expr_blocks_mut(val, f);
                    }
                    Field::Named { val, .. } => expr_blocks_mut(val, f),
                    Field::Array(val) => expr_blocks_mut(val, f),
                }
            }
        }
        _ => {}
    }
}

/// Applies `f` to every expression in the tree, children first.
pub fn exprs_mut(block: &mut Block, f: &mut impl FnMut(&mut Expr)) {
    for stmt in &mut block.stmts {
        stmt_exprs_mut(stmt, f);
    }
}

fn stmt_exprs_mut(stmt: &mut Stmt, f: &mut impl FnMut(&mut Expr)) {
    match stmt {
        Stmt::Do(block) => exprs_mut(block, f),
        Stmt::Local { values, .. } | Stmt::Return { exprs: values } => {
            for value in values {
                expr_mut(value, f);
            }
        }
        Stmt::Assign { targets, values } => {
            for expr in targets.iter_mut().chain(values.iter_mut()) {
                expr_mut(expr, f);
            }
        }
        Stmt::If {
            cond,
            then,
            elseifs,
            els,
        } => {
            expr_mut(cond, f);
            exprs_mut(then, f);
            for (elseif_cond, elseif_block) in elseifs {
                expr_mut(elseif_cond, f);
                exprs_mut(elseif_block, f);
            }
            if let Some(els) = els {
                exprs_mut(els, f);
            }
        }
        Stmt::NumericFor {
            start,
            end,
            step,
            body,
            ..
        } => {
            expr_mut(start, f);
            expr_mut(end, f);
            if let Some(step) = step {
                expr_mut(step, f);
            }
            exprs_mut(body, f);
        }
        Stmt::GenericFor { exprs, body, .. } => {
            for expr in exprs {
                expr_mut(expr, f);
            }
            exprs_mut(body, f);
        }
        Stmt::While { cond, body } => {
            expr_mut(cond, f);
            exprs_mut(body, f);
        }
        Stmt::Repeat { body, cond } => {
            exprs_mut(body, f);
            expr_mut(cond, f);
        }
        Stmt::FunctionDecl { body, .. } => exprs_mut(body, f),
        Stmt::Expression(expr) => expr_mut(expr, f),
        Stmt::Break | Stmt::RawEmit(_) => {}
    }
}

fn expr_mut(expr: &mut Expr, f: &mut impl FnMut(&mut Expr)) {
    match expr {
        Expr::MemberAccess { obj, .. } => expr_mut(obj, f),
        Expr::IndexAccess { obj, index } => {
            expr_mut(obj, f);
            expr_mut(index, f);
        }
        Expr::Call { callee, args } => {
            expr_mut(callee, f);
            for arg in args {
                expr_mut(arg, f);
            }
        }
        Expr::MethodCall { obj, args, .. } => {
            expr_mut(obj, f);
            for arg in args {
                expr_mut(arg, f);
            }
        }
        Expr::Binary { left, right, .. } => {
            expr_mut(left, f);
            expr_mut(right, f);
        }
        Expr::Unary { arg, .. } => expr_mut(arg, f),
        Expr::FunctionExpr { body, .. } => exprs_mut(body, f),
        Expr::Table { fields } => {
            for field in fields {
                match field {
                    Field::Index { key, val } => {
                        expr_mut(key, f);
                        expr_mut(val, f);
                    }
                    Field::Named { val, .. } => expr_mut(val, f),
                    Field::Array(val) => expr_mut(val, f),
                }
            }
        }
        _ => {}
    }
    f(expr);
}
