//! Dead-code injection.
//!
//! Splices effect-free statements between existing ones: loops that never
//! run a useful iteration, arithmetic on fresh locals, functions nobody
//! calls, tables built and torn down, metatables whose handlers are never
//! invoked. Templates only name fresh oracle identifiers, so nothing they
//! declare or mutate can touch pre-existing state. Insertion volume per
//! block is capped at a fraction of the block's original statement count.

use crate::error::Result;
use crate::oracle::Oracle;
use crate::parser::ast::{BinOp, Block, Expr, Field, Stmt};
use crate::pass::build::{array_table, assign, bin, function, index, local, name_call, num, var};
use crate::pass::control_flow::constant_predicate;
use crate::pass::{Pass, visit};

pub struct DeadCode {
    pub density: f64,
}

impl Default for DeadCode {
    fn default() -> Self {
        Self { density: 0.3 }
    }
}

impl Pass for DeadCode {
    fn name(&self) -> &'static str {
        "dead-code"
    }

    fn run(&self, chunk: &mut Block, oracle: &mut Oracle) -> Result<()> {
        let mut inserted = 0usize;
        visit::blocks_mut(chunk, &mut |block| {
            inserted += inject(block, oracle, self.density);
        });
        tracing::debug!(inserted, "dead statements injected");
        Ok(())
    }
}

fn inject(block: &mut Block, oracle: &mut Oracle, density: f64) -> usize {
    let original = block.stmts.len();
    if original == 0 {
        return 0;
    }
    let mut budget = (original as f64 * density).floor() as usize;
    if budget == 0 {
        return 0;
    }

    // Nothing may follow a return statement.
    let last_gap = if matches!(block.stmts.last(), Some(Stmt::Return { .. })) {
        original - 1
    } else {
        original
    };

    let mut inserted = 0;
    for gap in (0..=last_gap).rev() {
        if budget == 0 {
            break;
        }
        if oracle.chance(0.35) {
            let stmts = template(oracle);
            for stmt in stmts.into_iter().rev() {
                block.stmts.insert(gap, stmt);
            }
            budget -= 1;
            inserted += 1;
        }
    }
    inserted
}

/// One effect-free statement group with fresh names throughout.
fn template(oracle: &mut Oracle) -> Vec<Stmt> {
    match oracle.range(0, 5) {
        0 => loop_that_breaks(oracle),
        1 => loop_that_never_runs(oracle),
        2 => scratch_arithmetic(oracle),
        3 => unused_function(oracle),
        4 => table_churn(oracle),
        _ => idle_metatable(oracle),
    }
}

fn loop_that_breaks(oracle: &mut Oracle) -> Vec<Stmt> {
    let i = oracle.identifier();
    let bound = oracle.range(2, 17);
    vec![Stmt::NumericFor {
        var: i,
        start: num(1),
        end: num(bound),
        step: None,
        body: Block::new(vec![Stmt::Break]),
    }]
}

fn loop_that_never_runs(oracle: &mut Oracle) -> Vec<Stmt> {
    let mut predicate = constant_predicate(oracle);
    while predicate.value {
        predicate = constant_predicate(oracle);
    }
    let sink = oracle.identifier();
    vec![Stmt::While {
        cond: predicate.expr,
        body: Block::new(vec![local(&sink, num(oracle.range(0, 255)))]),
    }]
}

fn scratch_arithmetic(oracle: &mut Oracle) -> Vec<Stmt> {
    let name = oracle.identifier();
    let a = oracle.range(2, 97);
    let b = oracle.range(2, 97);
    let c = oracle.range(2, 97);
    vec![
        local(
            &name,
            bin(BinOp::Add, bin(BinOp::Mul, num(a), num(b)), num(c)),
        ),
        assign(
            var(&name),
            bin(BinOp::BitXor, var(&name), num(oracle.range(1, 255))),
        ),
    ]
}

fn unused_function(oracle: &mut Oracle) -> Vec<Stmt> {
    let name = oracle.identifier();
    let param = oracle.identifier();
    let k = oracle.range(1, 59);
    vec![local(
        &name,
        function(
            vec![param.clone()],
            false,
            vec![Stmt::Return {
                exprs: vec![bin(BinOp::Mul, var(&param), num(k))],
            }],
        ),
    )]
}

fn table_churn(oracle: &mut Oracle) -> Vec<Stmt> {
    let name = oracle.identifier();
    let items = (0..oracle.range(2, 5))
        .map(|_| num(oracle.range(0, 255)))
        .collect();
    vec![
        local(&name, array_table(items)),
        assign(index(var(&name), num(1)), Expr::Nil),
        assign(var(&name), Expr::Nil),
    ]
}

fn idle_metatable(oracle: &mut Oracle) -> Vec<Stmt> {
    let name = oracle.identifier();
    let receiver = oracle.identifier();
    let key = oracle.identifier();
    let handler = function(
        vec![receiver, key.clone()],
        false,
        vec![Stmt::Return {
            exprs: vec![var(&key)],
        }],
    );
    vec![local(
        &name,
        name_call(
            "setmetatable",
            vec![
                Expr::Table { fields: vec![] },
                Expr::Table {
                    fields: vec![Field::Named {
                        name: "__index".to_string(),
                        val: handler,
                    }],
                },
            ],
        ),
    )]
}
