//! Alpha-renaming of user-introduced identifiers.
//!
//! A scope is a frame mapping declared names to their fresh replacements;
//! frames stack with block structure. References resolve along the chain:
//! bound names are rewritten, unbound names are globals or built-ins and
//! stay untouched. Fresh names come from the oracle, which guarantees they
//! collide neither with each other nor with any name observed in the
//! program, so the rewrite is capture-free by construction.

use std::collections::HashMap;

use crate::error::Result;
use crate::oracle::Oracle;
use crate::parser::ast::{Block, Expr, Field, Stmt};
use crate::pass::Pass;

pub struct VariableRename;

impl Pass for VariableRename {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn run(&self, chunk: &mut Block, oracle: &mut Oracle) -> Result<()> {
        let mut scopes = Scopes::new();
        scopes.push();
        rename_stmts(&mut chunk.stmts, &mut scopes, oracle);
        scopes.pop();
        Ok(())
    }
}

struct Scopes {
    frames: Vec<HashMap<String, String>>,
}

impl Scopes {
    fn new() -> Self {
        Self { frames: Vec::new() }
    }

    fn push(&mut self) {
        self.frames.push(HashMap::new());
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    /// Binds a declaration in the innermost frame. `self` stays literal:
    /// the implicit method receiver must keep its name.
    fn bind(&mut self, name: &mut String, oracle: &mut Oracle) {
        if name == "self" {
            return;
        }
        let fresh = oracle.identifier();
        self.frames
            .last_mut()
            .expect("scope stack is never empty during a walk")
            .insert(name.clone(), fresh.clone());
        *name = fresh;
    }

    fn resolve(&self, name: &str) -> Option<&String> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
    }
}

fn rename_block(block: &mut Block, scopes: &mut Scopes, oracle: &mut Oracle) {
    scopes.push();
    rename_stmts(&mut block.stmts, scopes, oracle);
    scopes.pop();
}

fn rename_stmts(stmts: &mut [Stmt], scopes: &mut Scopes, oracle: &mut Oracle) {
    for stmt in stmts {
        rename_stmt(stmt, scopes, oracle);
    }
}

fn rename_stmt(stmt: &mut Stmt, scopes: &mut Scopes, oracle: &mut Oracle) {
    match stmt {
        Stmt::Do(block) => rename_block(block, scopes, oracle),
        Stmt::Local { names, values } => {
            // Initializers see the outer bindings: `local x = x` reads the
            // enclosing x.
            for value in values.iter_mut() {
                rename_expr(value, scopes, oracle);
            }
            for name in names {
                scopes.bind(name, oracle);
            }
        }
        Stmt::Assign { targets, values } => {
            for expr in targets.iter_mut().chain(values.iter_mut()) {
                rename_expr(expr, scopes, oracle);
            }
        }
        Stmt::If {
            cond,
            then,
            elseifs,
            els,
        } => {
            rename_expr(cond, scopes, oracle);
            rename_block(then, scopes, oracle);
            for (elseif_cond, elseif_block) in elseifs {
                rename_expr(elseif_cond, scopes, oracle);
                rename_block(elseif_block, scopes, oracle);
            }
            if let Some(els) = els {
                rename_block(els, scopes, oracle);
            }
        }
        Stmt::NumericFor {
            var,
            start,
            end,
            step,
            body,
        } => {
            rename_expr(start, scopes, oracle);
            rename_expr(end, scopes, oracle);
            if let Some(step) = step {
                rename_expr(step, scopes, oracle);
            }
            scopes.push();
            scopes.bind(var, oracle);
            rename_block(body, scopes, oracle);
            scopes.pop();
        }
        Stmt::GenericFor { vars, exprs, body } => {
            for expr in exprs.iter_mut() {
                rename_expr(expr, scopes, oracle);
            }
            scopes.push();
            for var in vars {
                scopes.bind(var, oracle);
            }
            rename_block(body, scopes, oracle);
            scopes.pop();
        }
        Stmt::While { cond, body } => {
            rename_expr(cond, scopes, oracle);
            rename_block(body, scopes, oracle);
        }
        Stmt::Repeat { body, cond } => {
            // The until-condition is inside the body scope.
            scopes.push();
            rename_stmts(&mut body.stmts, scopes, oracle);
            rename_expr(cond, scopes, oracle);
            scopes.pop();
        }
        Stmt::Return { exprs } => {
            for expr in exprs.iter_mut() {
                rename_expr(expr, scopes, oracle);
            }
        }
        Stmt::FunctionDecl {
            name,
            is_local,
            params,
            body,
            ..
        } => {
            if *is_local {
                // Bound before the body so the function can call itself.
                scopes.bind(&mut name.base, oracle);
            } else if let Some(fresh) = scopes.resolve(&name.base) {
                name.base = fresh.clone();
            }
            scopes.push();
            for param in params {
                scopes.bind(param, oracle);
            }
            rename_block(body, scopes, oracle);
            scopes.pop();
        }
        Stmt::Expression(expr) => rename_expr(expr, scopes, oracle),
        Stmt::Break | Stmt::RawEmit(_) => {}
    }
}

fn rename_expr(expr: &mut Expr, scopes: &mut Scopes, oracle: &mut Oracle) {
    match expr {
        Expr::Variable(name) => {
            if let Some(fresh) = scopes.resolve(name) {
                *name = fresh.clone();
            }
        }
        Expr::MemberAccess { obj, .. } => rename_expr(obj, scopes, oracle),
        Expr::IndexAccess { obj, index } => {
            rename_expr(obj, scopes, oracle);
            rename_expr(index, scopes, oracle);
        }
        Expr::Call { callee, args } => {
            rename_expr(callee, scopes, oracle);
            for arg in args {
                rename_expr(arg, scopes, oracle);
            }
        }
        Expr::MethodCall { obj, args, .. } => {
            rename_expr(obj, scopes, oracle);
            for arg in args {
                rename_expr(arg, scopes, oracle);
            }
        }
        Expr::Binary { left, right, .. } => {
            rename_expr(left, scopes, oracle);
            rename_expr(right, scopes, oracle);
        }
        Expr::Unary { arg, .. } => rename_expr(arg, scopes, oracle),
        Expr::FunctionExpr { params, body, .. } => {
            scopes.push();
            for param in params {
                scopes.bind(param, oracle);
            }
            rename_block(body, scopes, oracle);
            scopes.pop();
        }
        Expr::Table { fields } => {
            for field in fields {
                match field {
                    // Named keys are table members, not variables.
                    Field::Named { val, .. } => rename_expr(val, scopes, oracle),
                    Field::Index { key, val } => {
                        rename_expr(key, scopes, oracle);
                        rename_expr(val, scopes, oracle);
                    }
                    Field::Array(val) => rename_expr(val, scopes, oracle),
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use crate::printer::print_chunk;
    use indoc::indoc;

    fn renamed(source: &[u8]) -> String {
        let mut chunk = parse_source(source).expect("parse");
        let mut oracle = Oracle::new(1);
        VariableRename
            .run(&mut chunk, &mut oracle)
            .expect("rename pass");
        print_chunk(&chunk)
    }

    #[test]
    fn locals_and_references_are_rewritten() {
        let output = renamed(b"local counter = 1 return counter + counter");
        assert!(!output.contains("counter"));
        let chunk = parse_source(output.as_bytes()).expect("reparse");
        let Stmt::Local { names, .. } = &chunk.stmts[0] else {
            panic!("expected local");
        };
        let fresh = &names[0];
        assert_eq!(output.matches(fresh.as_str()).count(), 3);
    }

    #[test]
    fn globals_stay_untouched() {
        let output = renamed(b"print(unknownGlobal)");
        assert!(output.contains("print"));
        assert!(output.contains("unknownGlobal"));
    }

    #[test]
    fn same_name_in_distinct_scopes_gets_distinct_fresh_names() {
        let output = renamed(indoc! {b"
            do local twin = 1 print(twin) end
            do local twin = 2 print(twin) end
        "});
        let chunk = parse_source(output.as_bytes()).expect("reparse");
        let mut fresh = Vec::new();
        for stmt in &chunk.stmts {
            let Stmt::Do(block) = stmt else {
                panic!("expected do block");
            };
            let Stmt::Local { names, .. } = &block.stmts[0] else {
                panic!("expected local");
            };
            fresh.push(names[0].clone());
        }
        assert_ne!(fresh[0], fresh[1]);
        assert!(!output.contains("twin"));
    }

    #[test]
    fn shadowing_resolves_to_the_nearest_declaration() {
        let output = renamed(indoc! {b"
            local depth = 1
            do
              local depth = 2
              print(depth)
            end
            print(depth)
        "});
        let chunk = parse_source(output.as_bytes()).expect("reparse");
        let Stmt::Local { names: outer, .. } = &chunk.stmts[0] else {
            panic!("expected local");
        };
        let Stmt::Do(block) = &chunk.stmts[1] else {
            panic!("expected do");
        };
        let Stmt::Local { names: inner, .. } = &block.stmts[0] else {
            panic!("expected inner local");
        };
        let Stmt::Expression(Expr::Call { args, .. }) = &block.stmts[1] else {
            panic!("expected print call");
        };
        assert_eq!(args[0], Expr::Variable(inner[0].clone()));
        let Stmt::Expression(Expr::Call { args, .. }) = &chunk.stmts[2] else {
            panic!("expected outer print call");
        };
        assert_eq!(args[0], Expr::Variable(outer[0].clone()));
        assert_ne!(inner[0], outer[0]);
    }

    #[test]
    fn local_initializer_sees_the_outer_binding() {
        let mut chunk = parse_source(b"local x = x").expect("parse");
        let mut oracle = Oracle::new(2);
        VariableRename
            .run(&mut chunk, &mut oracle)
            .expect("rename pass");
        let Stmt::Local { names, values } = &chunk.stmts[0] else {
            panic!("expected local");
        };
        assert_ne!(names[0], "x");
        // The initializer read the (unbound, hence global) outer x.
        assert_eq!(values[0], Expr::Variable("x".to_string()));
    }

    #[test]
    fn local_function_can_call_itself_by_its_fresh_name() {
        let output = renamed(b"local function fact(n) return fact(n - 1) end");
        assert!(!output.contains("fact"));
        let chunk = parse_source(output.as_bytes()).expect("reparse");
        let Stmt::FunctionDecl { name, body, .. } = &chunk.stmts[0] else {
            panic!("expected function declaration");
        };
        let Stmt::Return { exprs } = &body.stmts[0] else {
            panic!("expected return");
        };
        let Expr::Call { callee, .. } = &exprs[0] else {
            panic!("expected call");
        };
        assert_eq!(**callee, Expr::Variable(name.base.clone()));
    }

    #[test]
    fn repeat_condition_sees_body_locals() {
        let output = renamed(b"repeat local done = true until done");
        assert!(!output.contains("done"));
        let chunk = parse_source(output.as_bytes()).expect("reparse");
        let Stmt::Repeat { body, cond } = &chunk.stmts[0] else {
            panic!("expected repeat");
        };
        let Stmt::Local { names, .. } = &body.stmts[0] else {
            panic!("expected local");
        };
        assert_eq!(*cond, Expr::Variable(names[0].clone()));
    }

    #[test]
    fn loop_variables_are_renamed() {
        let output = renamed(indoc! {b"
            for index = 1, 3 do print(index) end
            for key, value in pairs(t) do print(key, value) end
        "});
        assert!(!output.contains("index"));
        assert!(!output.contains("key"));
        assert!(!output.contains("value"));
        assert!(output.contains("pairs"));
    }

    #[test]
    fn member_and_method_names_are_preserved() {
        let output = renamed(b"local box = {} box.lid = 1 box:open(box.lid)");
        assert!(!output.contains("box"));
        assert!(output.contains(".lid"));
        assert!(output.contains(":open"));
    }

    #[test]
    fn method_self_stays_literal() {
        let output = renamed(b"function widget:draw() return self end");
        assert!(output.contains("self"));
    }

    #[test]
    fn rename_is_deterministic_per_seed() {
        let mut first = parse_source(b"local a = 1 local b = 2 return a + b").expect("parse");
        let mut second = first.clone();
        VariableRename
            .run(&mut first, &mut Oracle::new(9))
            .expect("rename pass");
        VariableRename
            .run(&mut second, &mut Oracle::new(9))
            .expect("rename pass");
        assert_eq!(first, second);
    }
}
