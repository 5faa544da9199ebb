//! Control-flow obfuscation: opaque predicates and switch-dispatch
//! flattening.
//!
//! Predicates are drawn from templates whose truth value is known at
//! construction time and combined so only the condition's truthiness is
//! relied upon (`cond and P` for always-true P, `cond or P` for
//! always-false P). Flattening rewrites a statement list into a closure
//! dispatch table driven by a state variable; it refuses any block where a
//! statement could transfer control out of the dispatch loop or where a
//! top-level declaration would be swallowed by a closure body.

use crate::error::Result;
use crate::oracle::Oracle;
use crate::parser::ast::{BinOp, Block, Expr, Field, Stmt};
use crate::pass::build::{bin, call, function, index, local, num, var};
use crate::pass::{Pass, visit};

pub struct ControlFlow;

/// Probability that an individual condition or block is transformed.
const PREDICATE_RATE: f64 = 0.7;
const FLATTEN_RATE: f64 = 0.6;

impl Pass for ControlFlow {
    fn name(&self) -> &'static str {
        "control-flow"
    }

    fn run(&self, chunk: &mut Block, oracle: &mut Oracle) -> Result<()> {
        let mut predicates = 0usize;
        visit::blocks_mut(chunk, &mut |block| {
            predicates += inject_predicates(block, oracle);
        });
        let mut flattened = 0usize;
        visit::blocks_mut(chunk, &mut |block| {
            if flatten_eligible(block) && oracle.chance(FLATTEN_RATE) {
                flatten(block, oracle);
                flattened += 1;
            }
        });
        tracing::debug!(predicates, flattened, "control flow rewritten");
        Ok(())
    }
}

/// An expression with a truth value established by its template.
pub(crate) struct Predicate {
    pub expr: Expr,
    pub value: bool,
}

/// Opaque predicate over oracle-chosen constants.
pub(crate) fn constant_predicate(oracle: &mut Oracle) -> Predicate {
    let k = oracle.range(3, 89);
    let odd = k | 1;
    let pow2 = 1i64 << oracle.range(1, 16);
    match oracle.range(0, 7) {
        // Always true.
        0 => Predicate {
            expr: bin(BinOp::Eq, bin(BinOp::Mul, num(k), num(0)), num(0)),
            value: true,
        },
        1 => Predicate {
            expr: bin(
                BinOp::Lt,
                bin(BinOp::Mod, bin(BinOp::Mul, num(k), num(k)), num(4)),
                num(2),
            ),
            value: true,
        },
        2 => Predicate {
            expr: bin(
                BinOp::Eq,
                bin(BinOp::BitAnd, num(pow2), num(pow2 - 1)),
                num(0),
            ),
            value: true,
        },
        3 => Predicate {
            expr: bin(
                BinOp::Eq,
                bin(BinOp::Mod, bin(BinOp::BitOr, num(k), num(1)), num(2)),
                num(1),
            ),
            value: true,
        },
        // Always false.
        4 => Predicate {
            expr: bin(BinOp::Eq, bin(BinOp::Mod, num(odd), num(2)), num(0)),
            value: false,
        },
        5 => Predicate {
            expr: bin(BinOp::Lt, num(k), num(k - 1)),
            value: false,
        },
        6 => Predicate {
            expr: bin(BinOp::Eq, bin(BinOp::BitXor, num(k), num(k)), num(1)),
            value: false,
        },
        _ => Predicate {
            expr: bin(
                BinOp::Eq,
                bin(BinOp::Mod, bin(BinOp::Mul, num(k), num(k)), num(4)),
                num(2),
            ),
            value: false,
        },
    }
}

/// Always-true predicate over a live numeric variable (a numeric-for
/// control variable). Safe for any finite runtime value including floats.
pub(crate) fn variable_predicate(oracle: &mut Oracle, name: &str) -> Predicate {
    let k = oracle.range(2, 59);
    let expr = match oracle.range(0, 2) {
        0 => bin(BinOp::Eq, bin(BinOp::Mul, var(name), num(0)), num(0)),
        1 => bin(BinOp::Eq, bin(BinOp::Sub, var(name), var(name)), num(0)),
        _ => bin(
            BinOp::Eq,
            bin(BinOp::Add, bin(BinOp::Mul, var(name), num(0)), num(k)),
            num(k),
        ),
    };
    Predicate { expr, value: true }
}

fn combine(cond: Expr, oracle: &mut Oracle) -> Expr {
    let predicate = constant_predicate(oracle);
    if predicate.value {
        bin(BinOp::And, cond, predicate.expr)
    } else {
        bin(BinOp::Or, cond, predicate.expr)
    }
}

fn guard_body(body: Block, predicate: Predicate) -> Block {
    debug_assert!(predicate.value, "a body guard must always pass");
    Block::new(vec![Stmt::If {
        cond: predicate.expr,
        then: body,
        elseifs: Vec::new(),
        els: None,
    }])
}

fn inject_predicates(block: &mut Block, oracle: &mut Oracle) -> usize {
    let mut count = 0;
    for stmt in &mut block.stmts {
        match stmt {
            Stmt::If { cond, elseifs, .. } => {
                if oracle.chance(PREDICATE_RATE) {
                    *cond = combine(std::mem::replace(cond, Expr::Nil), oracle);
                    count += 1;
                }
                for (elseif_cond, _) in elseifs {
                    if oracle.chance(PREDICATE_RATE) {
                        *elseif_cond = combine(std::mem::replace(elseif_cond, Expr::Nil), oracle);
                        count += 1;
                    }
                }
            }
            Stmt::While { cond, .. } => {
                if oracle.chance(PREDICATE_RATE) {
                    *cond = combine(std::mem::replace(cond, Expr::Nil), oracle);
                    count += 1;
                }
            }
            Stmt::NumericFor { var, body, .. } => {
                if oracle.chance(PREDICATE_RATE) {
                    let predicate = variable_predicate(oracle, var);
                    *body = guard_body(std::mem::take(body), predicate);
                    count += 1;
                }
            }
            Stmt::GenericFor { body, .. } => {
                // Loop variables may hold non-numeric values here, so the
                // guard must not touch them.
                if oracle.chance(PREDICATE_RATE) {
                    let mut predicate = constant_predicate(oracle);
                    while !predicate.value {
                        predicate = constant_predicate(oracle);
                    }
                    *body = guard_body(std::mem::take(body), predicate);
                    count += 1;
                }
            }
            _ => {}
        }
    }
    count
}

/// A block qualifies for flattening when it has at least two statements,
/// none of which declares a block-local name at top level or can transfer
/// control out of the dispatch loop.
fn flatten_eligible(block: &Block) -> bool {
    if block.stmts.len() < 2 {
        return false;
    }
    block.stmts.iter().all(|stmt| {
        if matches!(
            stmt,
            Stmt::Local { .. } | Stmt::FunctionDecl { is_local: true, .. }
        ) {
            return false;
        }
        !stmt_escapes(stmt, false, false)
    })
}

/// True when executing `stmt` inside a dispatch closure could transfer
/// control out of it: a `break` not enclosed by a loop within the subtree,
/// a `return` (or `...`) not enclosed by a function within the subtree, or
/// opaque raw source.
fn stmt_escapes(stmt: &Stmt, in_loop: bool, in_func: bool) -> bool {
    match stmt {
        Stmt::Break => !in_loop,
        Stmt::RawEmit(_) => true,
        Stmt::Return { exprs } => {
            !in_func || exprs.iter().any(|expr| expr_escapes(expr, in_func))
        }
        Stmt::Do(block) => block
            .stmts
            .iter()
            .any(|inner| stmt_escapes(inner, in_loop, in_func)),
        Stmt::Local { values, .. } => values.iter().any(|expr| expr_escapes(expr, in_func)),
        Stmt::Assign { targets, values } => targets
            .iter()
            .chain(values.iter())
            .any(|expr| expr_escapes(expr, in_func)),
        Stmt::If {
            cond,
            then,
            elseifs,
            els,
        } => {
            expr_escapes(cond, in_func)
                || then
                    .stmts
                    .iter()
                    .any(|inner| stmt_escapes(inner, in_loop, in_func))
                || elseifs.iter().any(|(elseif_cond, elseif_block)| {
                    expr_escapes(elseif_cond, in_func)
                        || elseif_block
                            .stmts
                            .iter()
                            .any(|inner| stmt_escapes(inner, in_loop, in_func))
                })
                || els.as_ref().is_some_and(|els| {
                    els.stmts
                        .iter()
                        .any(|inner| stmt_escapes(inner, in_loop, in_func))
                })
        }
        Stmt::NumericFor {
            start,
            end,
            step,
            body,
            ..
        } => {
            expr_escapes(start, in_func)
                || expr_escapes(end, in_func)
                || step.as_ref().is_some_and(|step| expr_escapes(step, in_func))
                || body
                    .stmts
                    .iter()
                    .any(|inner| stmt_escapes(inner, true, in_func))
        }
        Stmt::GenericFor { exprs, body, .. } => {
            exprs.iter().any(|expr| expr_escapes(expr, in_func))
                || body
                    .stmts
                    .iter()
                    .any(|inner| stmt_escapes(inner, true, in_func))
        }
        Stmt::While { cond, body } => {
            expr_escapes(cond, in_func)
                || body
                    .stmts
                    .iter()
                    .any(|inner| stmt_escapes(inner, true, in_func))
        }
        Stmt::Repeat { body, cond } => {
            expr_escapes(cond, in_func)
                || body
                    .stmts
                    .iter()
                    .any(|inner| stmt_escapes(inner, true, in_func))
        }
        Stmt::FunctionDecl { body, .. } => body
            .stmts
            .iter()
            .any(|inner| stmt_escapes(inner, false, true)),
        Stmt::Expression(expr) => expr_escapes(expr, in_func),
    }
}

fn expr_escapes(expr: &Expr, in_func: bool) -> bool {
    match expr {
        Expr::Vararg => !in_func,
        Expr::FunctionExpr { body, .. } => body
            .stmts
            .iter()
            .any(|inner| stmt_escapes(inner, false, true)),
        Expr::MemberAccess { obj, .. } => expr_escapes(obj, in_func),
        Expr::IndexAccess { obj, index } => {
            expr_escapes(obj, in_func) || expr_escapes(index, in_func)
        }
        Expr::Call { callee, args } => {
            expr_escapes(callee, in_func) || args.iter().any(|arg| expr_escapes(arg, in_func))
        }
        Expr::MethodCall { obj, args, .. } => {
            expr_escapes(obj, in_func) || args.iter().any(|arg| expr_escapes(arg, in_func))
        }
        Expr::Binary { left, right, .. } => {
            expr_escapes(left, in_func) || expr_escapes(right, in_func)
        }
        Expr::Unary { arg, .. } => expr_escapes(arg, in_func),
        Expr::Table { fields } => fields.iter().any(|field| match field {
            Field::Index { key, val } => expr_escapes(key, in_func) || expr_escapes(val, in_func),
            Field::Named { val, .. } => expr_escapes(val, in_func),
            Field::Array(val) => expr_escapes(val, in_func),
        }),
        _ => false,
    }
}

/// `{ s1; s2; ... }` becomes a state machine: each statement runs inside a
/// numbered closure that advances the state to its successor, and a drive
/// loop dispatches until the state leaves the table.
fn flatten(block: &mut Block, oracle: &mut Oracle) {
    let state = oracle.identifier();
    let dispatch = oracle.identifier();

    let stmts = std::mem::take(&mut block.stmts);
    let mut fields = Vec::with_capacity(stmts.len());
    for (i, stmt) in stmts.into_iter().enumerate() {
        let step = function(
            Vec::new(),
            false,
            vec![stmt, crate::pass::build::assign(var(&state), num(i as i64 + 2))],
        );
        fields.push(Field::Index {
            key: num(i as i64 + 1),
            val: step,
        });
    }

    block.stmts = vec![
        local(&state, num(1)),
        local(&dispatch, Expr::Table { fields }),
        Stmt::While {
            cond: bin(
                BinOp::And,
                bin(BinOp::Ne, var(&state), Expr::Nil),
                bin(BinOp::Ne, index(var(&dispatch), var(&state)), Expr::Nil),
            ),
            body: Block::new(vec![Stmt::Expression(call(
                index(var(&dispatch), var(&state)),
                Vec::new(),
            ))]),
        },
    ];
}
