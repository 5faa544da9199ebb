//! Virtualization of eligible function declarations.
//!
//! A function whose body stays inside the compilable subset is lowered to a
//! 32-bit instruction stream (low 16 bits opcode, next 8 operand A, high 8
//! operand B) and replaced by a self-contained interpreter: instruction
//! table, constant pool, callee trampolines, 16 oracle-named register
//! slots, and a fetch/dispatch loop. Opcode numbering is drawn from the
//! oracle per session. Jumps are forward-only, so the emitted loop
//! terminates structurally for every compiled stream.
//!
//! Compilable subset: single-name locals and assignments over fragment
//! locals, `if`/`elseif`/`else`, `return` of at most one value, expression
//! statement calls; expressions over literals, fragment locals, `+ - * / %`
//! and comparisons, unary minus, static callees (a global or a
//! dot-chain, or an enclosing local that the fragment itself does not
//! redefine), empty table constructors, and table reads/writes by key.
//! Anything outside the subset leaves the declaration untouched.

use std::collections::HashSet;

use crate::error::Result;
use crate::oracle::Oracle;
use crate::parser::ast::{BinOp, Block, Expr, Number, Stmt, UnOp};
use crate::pass::build::{array_table, assign, bin, call, function, index, local, member, num, string, unary, var};
use crate::pass::{Pass, visit};

pub struct VmWrap {
    pub randomize_opcodes: bool,
    pub randomize_slots: bool,
}

const REG_COUNT: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Load,
    Store,
    Call,
    Jump,
    Return,
    Compare,
    Math,
    Table,
}

const OP_COUNT: usize = 8;

/// LOAD source kinds (operand A high nibble).
const SRC_CONST: u8 = 0;
const SRC_ARG: u8 = 1;
const SRC_NIL: u8 = 2;
const SRC_TRUE: u8 = 3;
const SRC_FALSE: u8 = 4;

/// MATH sub-operations.
const MATH_ADD: u8 = 0;
const MATH_SUB: u8 = 1;
const MATH_MUL: u8 = 2;
const MATH_DIV: u8 = 3;
const MATH_MOD: u8 = 4;

/// COMPARE sub-operations.
const CMP_EQ: u8 = 0;
const CMP_NE: u8 = 1;
const CMP_LT: u8 = 2;
const CMP_LE: u8 = 3;
const CMP_GT: u8 = 4;
const CMP_GE: u8 = 5;

/// TABLE sub-operations.
const TAB_NEW: u8 = 0;
const TAB_GET: u8 = 1;
const TAB_SET: u8 = 2;

/// JUMP flags.
const JMP_ALWAYS: u8 = 0;
const JMP_IF_FALSY: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Instr {
    op: Op,
    a: u8,
    b: u8,
}

#[derive(Debug, Clone, PartialEq)]
enum Const {
    Num(Number),
    Str(Vec<u8>),
}

/// A compiled fragment before opcode numbering is applied.
#[derive(Debug, Clone)]
pub(crate) struct Fragment {
    code: Vec<Instr>,
    consts: Vec<Const>,
    callees: Vec<Expr>,
}

struct Ineligible;

type Compile<T> = std::result::Result<T, Ineligible>;

struct Compiler {
    code: Vec<Instr>,
    consts: Vec<Const>,
    callees: Vec<Expr>,
    locals: Vec<(String, u8)>,
    next_reg: u8,
}

impl Compiler {
    fn new() -> Self {
        Self {
            code: Vec::new(),
            consts: Vec::new(),
            callees: Vec::new(),
            locals: Vec::new(),
            next_reg: 0,
        }
    }

    fn emit(&mut self, op: Op, a: u8, b: u8) {
        self.code.push(Instr { op, a, b });
    }

    fn alloc_local(&mut self, name: &str) -> Compile<u8> {
        let reg = self.reg(self.next_reg)?;
        self.next_reg += 1;
        self.locals.push((name.to_string(), reg));
        Ok(reg)
    }

    fn reg(&self, candidate: u8) -> Compile<u8> {
        if candidate < REG_COUNT {
            Ok(candidate)
        } else {
            Err(Ineligible)
        }
    }

    fn lookup(&self, name: &str) -> Option<u8> {
        self.locals
            .iter()
            .rev()
            .find(|(local, _)| local == name)
            .map(|(_, reg)| *reg)
    }

    fn intern_const(&mut self, value: Const) -> Compile<u8> {
        if let Some(found) = self.consts.iter().position(|c| *c == value) {
            return Ok(found as u8);
        }
        if self.consts.len() >= 256 {
            return Err(Ineligible);
        }
        self.consts.push(value);
        Ok((self.consts.len() - 1) as u8)
    }

    fn intern_callee(&mut self, target: &Expr) -> Compile<u8> {
        if let Some(found) = self.callees.iter().position(|c| c == target) {
            return Ok(found as u8);
        }
        if self.callees.len() >= 256 {
            return Err(Ineligible);
        }
        self.callees.push(target.clone());
        Ok((self.callees.len() - 1) as u8)
    }

    /// A callee the trampoline table can name from the emitted scope: a
    /// bare variable or a dot-chain rooted in one, where the root is not a
    /// fragment-local register.
    fn static_callee(&self, callee: &Expr) -> Compile<()> {
        match callee {
            Expr::Variable(name) => {
                if self.lookup(name).is_some() {
                    Err(Ineligible)
                } else {
                    Ok(())
                }
            }
            Expr::MemberAccess { obj, .. } => self.static_callee(obj),
            _ => Err(Ineligible),
        }
    }

    fn compile_block(&mut self, block: &Block) -> Compile<()> {
        let scope_mark = self.locals.len();
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        self.locals.truncate(scope_mark);
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Compile<()> {
        match stmt {
            Stmt::Local { names, values } => {
                if names.len() != 1 || values.len() > 1 {
                    return Err(Ineligible);
                }
                // The initializer is evaluated before the name is bound.
                let scratch = self.reg(self.next_reg)?;
                match values.first() {
                    Some(value) => self.eval(value, scratch, scratch + 1)?,
                    None => self.emit(Op::Load, (SRC_NIL << 4) | scratch, 0),
                }
                let reg = self.alloc_local(&names[0])?;
                debug_assert_eq!(reg, scratch);
                Ok(())
            }
            Stmt::Assign { targets, values } => {
                if targets.len() != 1 || values.len() != 1 {
                    return Err(Ineligible);
                }
                match &targets[0] {
                    Expr::Variable(name) => {
                        // Evaluate into scratch first: the right-hand side
                        // may read the target register.
                        let reg = self.lookup(name).ok_or(Ineligible)?;
                        let scratch = self.reg(self.next_reg)?;
                        self.eval(&values[0], scratch, scratch + 1)?;
                        self.emit(Op::Store, reg, scratch);
                        Ok(())
                    }
                    Expr::IndexAccess { obj, index } => {
                        let base = self.next_reg;
                        let t_obj = self.reg(base)?;
                        let t_key = self.reg(base + 1)?;
                        let t_val = self.reg(base + 2)?;
                        self.eval(obj, t_obj, base + 1)?;
                        self.eval(index, t_key, base + 2)?;
                        self.eval(&values[0], t_val, base + 3)?;
                        self.emit(Op::Table, (TAB_SET << 4) | t_val, (t_obj << 4) | t_key);
                        Ok(())
                    }
                    _ => Err(Ineligible),
                }
            }
            Stmt::If {
                cond,
                then,
                elseifs,
                els,
            } => self.compile_if(cond, then, elseifs, els.as_ref()),
            Stmt::Return { exprs } => match exprs.len() {
                0 => {
                    self.emit(Op::Return, 0, 0);
                    Ok(())
                }
                1 => {
                    // `return g(...)` forwards every result of g; a single
                    // return register cannot express that.
                    if matches!(exprs[0], Expr::Call { .. }) {
                        return Err(Ineligible);
                    }
                    let scratch = self.reg(self.next_reg)?;
                    self.eval(&exprs[0], scratch, scratch + 1)?;
                    self.emit(Op::Return, 1, scratch);
                    Ok(())
                }
                _ => Err(Ineligible),
            },
            Stmt::Expression(expr @ Expr::Call { .. }) => {
                let scratch = self.reg(self.next_reg)?;
                self.eval(expr, scratch, scratch + 1)
            }
            _ => Err(Ineligible),
        }
    }

    fn compile_if(
        &mut self,
        cond: &Expr,
        then: &Block,
        elseifs: &[(Expr, Block)],
        els: Option<&Block>,
    ) -> Compile<()> {
        let scratch = self.reg(self.next_reg)?;
        self.eval(cond, scratch, scratch + 1)?;
        let skip_then = self.code.len();
        self.emit(Op::Jump, (JMP_IF_FALSY << 4) | scratch, 0);
        self.compile_block(then)?;

        let has_rest = !elseifs.is_empty() || els.is_some();
        if has_rest {
            let skip_rest = self.code.len();
            self.emit(Op::Jump, JMP_ALWAYS << 4, 0);
            self.patch_jump(skip_then)?;
            if let Some((elseif_cond, elseif_block)) = elseifs.first() {
                self.compile_if(elseif_cond, elseif_block, &elseifs[1..], els)?;
            } else if let Some(els) = els {
                self.compile_block(els)?;
            }
            self.patch_jump(skip_rest)?;
        } else {
            self.patch_jump(skip_then)?;
        }
        Ok(())
    }

    /// Points a pending jump at the next instruction. Targets are 1-based
    /// and always forward.
    fn patch_jump(&mut self, at: usize) -> Compile<()> {
        let target = self.code.len() + 1;
        if target > 255 {
            return Err(Ineligible);
        }
        self.code[at].b = target as u8;
        Ok(())
    }

    /// Evaluates `expr` into `dest`; registers at `top` and above are free
    /// scratch space.
    fn eval(&mut self, expr: &Expr, dest: u8, top: u8) -> Compile<()> {
        self.reg(dest)?;
        match expr {
            Expr::Number(value) => {
                let k = self.intern_const(Const::Num(*value))?;
                self.emit(Op::Load, (SRC_CONST << 4) | dest, k);
                Ok(())
            }
            Expr::String(bytes) => {
                let k = self.intern_const(Const::Str(bytes.clone()))?;
                self.emit(Op::Load, (SRC_CONST << 4) | dest, k);
                Ok(())
            }
            Expr::Boolean(true) => {
                self.emit(Op::Load, (SRC_TRUE << 4) | dest, 0);
                Ok(())
            }
            Expr::Boolean(false) => {
                self.emit(Op::Load, (SRC_FALSE << 4) | dest, 0);
                Ok(())
            }
            Expr::Nil => {
                self.emit(Op::Load, (SRC_NIL << 4) | dest, 0);
                Ok(())
            }
            Expr::Variable(name) => {
                let src = self.lookup(name).ok_or(Ineligible)?;
                self.emit(Op::Store, dest, src);
                Ok(())
            }
            Expr::Binary { op, left, right } => {
                let (opcode, sub) = lower_binop(*op).ok_or(Ineligible)?;
                self.eval(left, dest, top)?;
                let t = self.reg(top)?;
                self.eval(right, t, top + 1)?;
                self.emit(opcode, (sub << 4) | dest, (dest << 4) | t);
                Ok(())
            }
            Expr::Unary {
                op: UnOp::Neg,
                arg,
            } => {
                let zero = self.intern_const(Const::Num(Number::Int(0)))?;
                self.emit(Op::Load, (SRC_CONST << 4) | dest, zero);
                let t = self.reg(top)?;
                self.eval(arg, t, top + 1)?;
                self.emit(Op::Math, (MATH_SUB << 4) | dest, (dest << 4) | t);
                Ok(())
            }
            Expr::Call { callee, args } => {
                if args.len() > 15 {
                    return Err(Ineligible);
                }
                // A trailing call argument spreads all its results into the
                // argument list; register passing truncates it to one.
                if matches!(args.last(), Some(Expr::Call { .. })) {
                    return Err(Ineligible);
                }
                self.static_callee(callee)?;
                let callee_index = self.intern_callee(callee)?;
                for (i, arg) in args.iter().enumerate() {
                    let target = self.reg(dest + 1 + i as u8)?;
                    self.eval(arg, target, target + 1)?;
                }
                self.emit(
                    Op::Call,
                    ((args.len() as u8) << 4) | dest,
                    callee_index,
                );
                Ok(())
            }
            Expr::Table { fields } if fields.is_empty() => {
                self.emit(Op::Table, (TAB_NEW << 4) | dest, 0);
                Ok(())
            }
            Expr::IndexAccess { obj, index } => {
                self.eval(obj, dest, top)?;
                let t = self.reg(top)?;
                self.eval(index, t, top + 1)?;
                self.emit(Op::Table, (TAB_GET << 4) | dest, (dest << 4) | t);
                Ok(())
            }
            _ => Err(Ineligible),
        }
    }
}

fn lower_binop(op: BinOp) -> Option<(Op, u8)> {
    match op {
        BinOp::Add => Some((Op::Math, MATH_ADD)),
        BinOp::Sub => Some((Op::Math, MATH_SUB)),
        BinOp::Mul => Some((Op::Math, MATH_MUL)),
        BinOp::Div => Some((Op::Math, MATH_DIV)),
        BinOp::Mod => Some((Op::Math, MATH_MOD)),
        BinOp::Eq => Some((Op::Compare, CMP_EQ)),
        BinOp::Ne => Some((Op::Compare, CMP_NE)),
        BinOp::Lt => Some((Op::Compare, CMP_LT)),
        BinOp::Le => Some((Op::Compare, CMP_LE)),
        BinOp::Gt => Some((Op::Compare, CMP_GT)),
        BinOp::Ge => Some((Op::Compare, CMP_GE)),
        _ => None,
    }
}

/// Lowers a parameter list and body, or reports the construct that keeps
/// the fragment out of the subset by returning `None`.
pub(crate) fn try_compile(params: &[String], body: &Block) -> Option<Fragment> {
    let mut compiler = Compiler::new();
    let mut regs = Vec::with_capacity(params.len());
    for param in params {
        regs.push(compiler.alloc_local(param).ok()?);
    }
    for (i, reg) in regs.iter().enumerate() {
        if i > 255 {
            return None;
        }
        compiler.emit(Op::Load, (SRC_ARG << 4) | reg, i as u8);
    }
    compiler.compile_block(body).ok()?;
    if !matches!(compiler.code.last(), Some(Instr { op: Op::Return, .. })) {
        compiler.emit(Op::Return, 0, 0);
    }
    if compiler.code.len() > 254 {
        return None;
    }
    Some(Fragment {
        code: compiler.code,
        consts: compiler.consts,
        callees: compiler.callees,
    })
}

/// Distinct per-session numeric values for the eight symbolic opcodes.
fn opcode_values(oracle: &mut Oracle) -> [u16; OP_COUNT] {
    let mut seen = HashSet::new();
    let mut values = [0u16; OP_COUNT];
    for value in &mut values {
        loop {
            let candidate = (oracle.u32() & 0xFFFF) as u16;
            if candidate != 0 && seen.insert(candidate) {
                *value = candidate;
                break;
            }
        }
    }
    values
}

fn encode(instr: Instr, values: &[u16; OP_COUNT]) -> u32 {
    u32::from(values[instr.op as usize])
        | (u32::from(instr.a) << 16)
        | (u32::from(instr.b) << 24)
}

impl Pass for VmWrap {
    fn name(&self) -> &'static str {
        "vm-wrap"
    }

    fn run(&self, chunk: &mut Block, oracle: &mut Oracle) -> Result<()> {
        let session_values = opcode_values(oracle);
        let session_slots: Vec<String> = (0..REG_COUNT).map(|_| oracle.identifier()).collect();
        let mut wrapped = 0usize;
        visit::blocks_mut(chunk, &mut |block| {
            for stmt in &mut block.stmts {
                let Stmt::FunctionDecl {
                    name,
                    params,
                    is_vararg,
                    body,
                    ..
                } = stmt
                else {
                    continue;
                };
                if name.method.is_some() || *is_vararg {
                    continue;
                }
                let Some(fragment) = try_compile(params, body) else {
                    continue;
                };
                let values = if self.randomize_opcodes {
                    opcode_values(oracle)
                } else {
                    session_values
                };
                let slots = if self.randomize_slots {
                    (0..REG_COUNT).map(|_| oracle.identifier()).collect()
                } else {
                    session_slots.clone()
                };
                *body = emit_interpreter(&fragment, &values, &slots, oracle);
                params.clear();
                *is_vararg = true;
                wrapped += 1;
            }
        });
        tracing::debug!(wrapped, "functions virtualized");
        Ok(())
    }
}

/// The interpreter body: tables, register file, and the fetch/dispatch
/// loop, all as a plain tree so the printer guarantees parseable output.
fn emit_interpreter(
    fragment: &Fragment,
    values: &[u16; OP_COUNT],
    slots: &[String],
    oracle: &mut Oracle,
) -> Block {
    let ar = oracle.identifier();
    let mem = oracle.identifier();
    let pool = oracle.identifier();
    let fns = oracle.identifier();
    let names = oracle.identifier();
    let regs = oracle.identifier();
    let ip = oracle.identifier();
    let ins = oracle.identifier();
    let a_op = oracle.identifier();
    let a_a = oracle.identifier();
    let a_b = oracle.identifier();
    let v_sub = oracle.identifier();
    let v_dst = oracle.identifier();
    let v_lhs = oracle.identifier();
    let v_rhs = oracle.identifier();
    let v_args = oracle.identifier();
    let v_j = oracle.identifier();

    // regs[names[<idx expr> + 1]]
    let slot = |idx: Expr| index(var(&regs), index(var(&names), bin(BinOp::Add, idx, num(1))));
    let lo_nibble = |name: &str| bin(BinOp::BitAnd, var(name), num(15));
    let hi_nibble = |name: &str| bin(BinOp::Shr, var(name), num(4));
    let advance = || assign(var(&ip), bin(BinOp::Add, var(&ip), num(1)));
    let opcode_eq = |op: Op| bin(BinOp::Eq, var(&a_op), num(i64::from(values[op as usize])));

    let load_arm = Block::new(vec![
        local(&v_sub, hi_nibble(&a_a)),
        local(&v_dst, lo_nibble(&a_a)),
        Stmt::If {
            cond: bin(BinOp::Eq, var(&v_sub), num(i64::from(SRC_CONST))),
            then: Block::new(vec![assign(
                slot(var(&v_dst)),
                index(var(&pool), bin(BinOp::Add, var(&a_b), num(1))),
            )]),
            elseifs: vec![
                (
                    bin(BinOp::Eq, var(&v_sub), num(i64::from(SRC_ARG))),
                    Block::new(vec![assign(
                        slot(var(&v_dst)),
                        index(var(&ar), bin(BinOp::Add, var(&a_b), num(1))),
                    )]),
                ),
                (
                    bin(BinOp::Eq, var(&v_sub), num(i64::from(SRC_NIL))),
                    Block::new(vec![assign(slot(var(&v_dst)), Expr::Nil)]),
                ),
                (
                    bin(BinOp::Eq, var(&v_sub), num(i64::from(SRC_TRUE))),
                    Block::new(vec![assign(slot(var(&v_dst)), Expr::Boolean(true))]),
                ),
            ],
            els: Some(Block::new(vec![assign(
                slot(var(&v_dst)),
                Expr::Boolean(false),
            )])),
        },
        advance(),
    ]);

    let store_arm = Block::new(vec![
        assign(slot(lo_nibble(&a_a)), slot(lo_nibble(&a_b))),
        advance(),
    ]);

    let math_compare_arm = |pairs: Vec<(u8, BinOp)>| {
        let mut arms = pairs.into_iter();
        let (first_sub, first_op) = arms.next().expect("at least one sub-operation");
        let arm_body = |op: BinOp| {
            Block::new(vec![assign(
                slot(var(&v_dst)),
                bin(op, var(&v_lhs), var(&v_rhs)),
            )])
        };
        let mut elseifs = Vec::new();
        let mut rest: Vec<(u8, BinOp)> = arms.collect();
        let last_op = rest.pop().map(|(_, op)| op);
        for (sub, op) in rest {
            elseifs.push((
                bin(BinOp::Eq, var(&v_sub), num(i64::from(sub))),
                arm_body(op),
            ));
        }
        Block::new(vec![
            local(&v_sub, hi_nibble(&a_a)),
            local(&v_dst, lo_nibble(&a_a)),
            local(&v_lhs, slot(bin(BinOp::BitAnd, hi_nibble(&a_b), num(15)))),
            local(&v_rhs, slot(lo_nibble(&a_b))),
            Stmt::If {
                cond: bin(BinOp::Eq, var(&v_sub), num(i64::from(first_sub))),
                then: arm_body(first_op),
                elseifs,
                els: last_op.map(|op| arm_body(op)),
            },
            advance(),
        ])
    };

    let math_arm = math_compare_arm(vec![
        (MATH_ADD, BinOp::Add),
        (MATH_SUB, BinOp::Sub),
        (MATH_MUL, BinOp::Mul),
        (MATH_DIV, BinOp::Div),
        (MATH_MOD, BinOp::Mod),
    ]);
    let compare_arm = math_compare_arm(vec![
        (CMP_EQ, BinOp::Eq),
        (CMP_NE, BinOp::Ne),
        (CMP_LT, BinOp::Lt),
        (CMP_LE, BinOp::Le),
        (CMP_GT, BinOp::Gt),
        (CMP_GE, BinOp::Ge),
    ]);

    let table_arm = Block::new(vec![
        local(&v_sub, hi_nibble(&a_a)),
        local(&v_dst, lo_nibble(&a_a)),
        local(&v_lhs, bin(BinOp::BitAnd, hi_nibble(&a_b), num(15))),
        local(&v_rhs, lo_nibble(&a_b)),
        Stmt::If {
            cond: bin(BinOp::Eq, var(&v_sub), num(i64::from(TAB_NEW))),
            then: Block::new(vec![assign(
                slot(var(&v_dst)),
                Expr::Table { fields: vec![] },
            )]),
            elseifs: vec![(
                bin(BinOp::Eq, var(&v_sub), num(i64::from(TAB_GET))),
                Block::new(vec![assign(
                    slot(var(&v_dst)),
                    index(slot(var(&v_lhs)), slot(var(&v_rhs))),
                )]),
            )],
            els: Some(Block::new(vec![assign(
                index(slot(var(&v_lhs)), slot(var(&v_rhs))),
                slot(var(&v_dst)),
            )])),
        },
        advance(),
    ]);

    let jump_arm = Block::new(vec![Stmt::If {
        cond: bin(BinOp::Eq, hi_nibble(&a_a), num(i64::from(JMP_ALWAYS))),
        then: Block::new(vec![assign(var(&ip), var(&a_b))]),
        elseifs: vec![(
            unary(UnOp::Not, slot(lo_nibble(&a_a))),
            Block::new(vec![assign(var(&ip), var(&a_b))]),
        )],
        els: Some(Block::new(vec![advance()])),
    }]);

    let call_arm = Block::new(vec![
        local(&v_sub, hi_nibble(&a_a)),
        local(&v_dst, lo_nibble(&a_a)),
        local(&v_args, Expr::Table { fields: vec![] }),
        local(&v_j, num(1)),
        Stmt::While {
            cond: bin(BinOp::Le, var(&v_j), var(&v_sub)),
            body: Block::new(vec![
                assign(
                    index(var(&v_args), var(&v_j)),
                    slot(bin(BinOp::Add, var(&v_dst), var(&v_j))),
                ),
                assign(var(&v_j), bin(BinOp::Add, var(&v_j), num(1))),
            ]),
        },
        assign(
            slot(var(&v_dst)),
            call(
                index(var(&fns), bin(BinOp::Add, var(&a_b), num(1))),
                vec![call(
                    member(var("table"), "unpack"),
                    vec![var(&v_args), num(1), var(&v_sub)],
                )],
            ),
        ),
        advance(),
    ]);

    let return_arm = Block::new(vec![
        Stmt::If {
            cond: bin(BinOp::Eq, var(&a_a), num(1)),
            then: Block::new(vec![Stmt::Return {
                exprs: vec![slot(lo_nibble(&a_b))],
            }]),
            elseifs: vec![],
            els: None,
        },
        Stmt::Return { exprs: vec![] },
    ]);

    let dispatch = Stmt::If {
        cond: opcode_eq(Op::Load),
        then: load_arm,
        elseifs: vec![
            (opcode_eq(Op::Store), store_arm),
            (opcode_eq(Op::Math), math_arm),
            (opcode_eq(Op::Compare), compare_arm),
            (opcode_eq(Op::Table), table_arm),
            (opcode_eq(Op::Jump), jump_arm),
            (opcode_eq(Op::Call), call_arm),
        ],
        els: Some(return_arm),
    };

    let loop_body = Block::new(vec![
        local(&ins, index(var(&mem), var(&ip))),
        local(&a_op, bin(BinOp::BitAnd, var(&ins), num(65535))),
        local(
            &a_a,
            bin(BinOp::BitAnd, bin(BinOp::Shr, var(&ins), num(16)), num(255)),
        ),
        local(
            &a_b,
            bin(BinOp::BitAnd, bin(BinOp::Shr, var(&ins), num(24)), num(255)),
        ),
        dispatch,
    ]);

    let const_expr = |value: &Const| match value {
        Const::Num(Number::Int(v)) => num(*v),
        Const::Num(Number::Float(v)) => Expr::Number(Number::Float(*v)),
        Const::Str(bytes) => string(bytes.clone()),
    };
    let trampoline = |target: &Expr| {
        function(
            Vec::new(),
            true,
            vec![Stmt::Return {
                exprs: vec![Expr::Call {
                    callee: Box::new(target.clone()),
                    args: vec![Expr::Vararg],
                }],
            }],
        )
    };

    Block::new(vec![
        local(
            &ar,
            Expr::Table {
                fields: vec![crate::parser::ast::Field::Array(Expr::Vararg)],
            },
        ),
        local(
            &mem,
            array_table(
                fragment
                    .code
                    .iter()
                    .map(|&instr| num(i64::from(encode(instr, values))))
                    .collect(),
            ),
        ),
        local(
            &pool,
            array_table(fragment.consts.iter().map(const_expr).collect()),
        ),
        local(
            &fns,
            array_table(fragment.callees.iter().map(trampoline).collect()),
        ),
        local(
            &names,
            array_table(slots.iter().map(|name| string(name.as_bytes())).collect()),
        ),
        local(&regs, Expr::Table { fields: vec![] }),
        local(&ip, num(1)),
        Stmt::While {
            cond: bin(BinOp::Le, var(&ip), unary(UnOp::Len, var(&mem))),
            body: loop_body,
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use crate::printer::{print_chunk, print_expr};
    use indoc::indoc;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    /// Runtime values for the mirror interpreter, matching the subset the
    /// emitted interpreter can produce.
    #[derive(Debug, Clone, PartialEq)]
    enum Value {
        Nil,
        Bool(bool),
        Int(i64),
        Float(f64),
        Str(Vec<u8>),
        Table(Rc<RefCell<HashMap<i64, Value>>>),
    }

    impl Value {
        fn truthy(&self) -> bool {
            !matches!(self, Value::Nil | Value::Bool(false))
        }

        fn as_num(&self) -> f64 {
            match self {
                Value::Int(v) => *v as f64,
                Value::Float(v) => *v,
                other => panic!("arithmetic on {other:?}"),
            }
        }
    }

    type Builtin = Box<dyn Fn(&[Value]) -> Value>;

    fn math(sub: u8, left: &Value, right: &Value) -> Value {
        if let (Value::Int(a), Value::Int(b)) = (left, right) {
            match sub {
                MATH_ADD => return Value::Int(a.wrapping_add(*b)),
                MATH_SUB => return Value::Int(a.wrapping_sub(*b)),
                MATH_MUL => return Value::Int(a.wrapping_mul(*b)),
                MATH_MOD => return Value::Int(a.rem_euclid(*b)),
                _ => {}
            }
        }
        let (a, b) = (left.as_num(), right.as_num());
        match sub {
            MATH_ADD => Value::Float(a + b),
            MATH_SUB => Value::Float(a - b),
            MATH_MUL => Value::Float(a * b),
            MATH_DIV => Value::Float(a / b),
            MATH_MOD => Value::Float(a.rem_euclid(b)),
            other => panic!("bad math sub-op {other}"),
        }
    }

    fn compare(sub: u8, left: &Value, right: &Value) -> Value {
        let outcome = match sub {
            CMP_EQ | CMP_NE => {
                let equal = match (left, right) {
                    (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                        left.as_num() == right.as_num()
                    }
                    _ => left == right,
                };
                if sub == CMP_EQ { equal } else { !equal }
            }
            CMP_LT => left.as_num() < right.as_num(),
            CMP_LE => left.as_num() <= right.as_num(),
            CMP_GT => left.as_num() > right.as_num(),
            CMP_GE => left.as_num() >= right.as_num(),
            other => panic!("bad compare sub-op {other}"),
        };
        Value::Bool(outcome)
    }

    /// Executes a fragment the way the emitted interpreter does: 1-based
    /// ip, fetch, nibble decode, dispatch.
    fn run_fragment(
        fragment: &Fragment,
        args: Vec<Value>,
        builtins: &HashMap<String, Builtin>,
    ) -> Value {
        let mut regs: Vec<Value> = vec![Value::Nil; REG_COUNT as usize];
        let mut ip = 1usize;
        let mut steps = 0;
        while ip <= fragment.code.len() {
            steps += 1;
            assert!(steps <= 10_000, "interpreter failed to terminate");
            let Instr { op, a, b } = fragment.code[ip - 1];
            let (hi, lo) = (a >> 4, a & 15);
            let (bl, br) = ((b >> 4) & 15, b & 15);
            match op {
                Op::Load => {
                    regs[lo as usize] = match hi {
                        SRC_CONST => match &fragment.consts[b as usize] {
                            Const::Num(Number::Int(v)) => Value::Int(*v),
                            Const::Num(Number::Float(v)) => Value::Float(*v),
                            Const::Str(bytes) => Value::Str(bytes.clone()),
                        },
                        SRC_ARG => args.get(b as usize).cloned().unwrap_or(Value::Nil),
                        SRC_NIL => Value::Nil,
                        SRC_TRUE => Value::Bool(true),
                        _ => Value::Bool(false),
                    };
                    ip += 1;
                }
                Op::Store => {
                    regs[(a & 15) as usize] = regs[(b & 15) as usize].clone();
                    ip += 1;
                }
                Op::Math => {
                    regs[lo as usize] =
                        math(hi, &regs[bl as usize].clone(), &regs[br as usize].clone());
                    ip += 1;
                }
                Op::Compare => {
                    regs[lo as usize] = compare(hi, &regs[bl as usize], &regs[br as usize]);
                    ip += 1;
                }
                Op::Table => match hi {
                    TAB_NEW => {
                        regs[lo as usize] = Value::Table(Rc::new(RefCell::new(HashMap::new())));
                        ip += 1;
                    }
                    TAB_GET => {
                        let Value::Table(table) = regs[bl as usize].clone() else {
                            panic!("indexing a non-table");
                        };
                        let Value::Int(key) = regs[br as usize] else {
                            panic!("non-integer key in mirror");
                        };
                        let value = table.borrow().get(&key).cloned().unwrap_or(Value::Nil);
                        regs[lo as usize] = value;
                        ip += 1;
                    }
                    _ => {
                        let Value::Table(table) = regs[bl as usize].clone() else {
                            panic!("indexing a non-table");
                        };
                        let Value::Int(key) = regs[br as usize] else {
                            panic!("non-integer key in mirror");
                        };
                        table.borrow_mut().insert(key, regs[lo as usize].clone());
                        ip += 1;
                    }
                },
                Op::Jump => {
                    let taken = hi == JMP_ALWAYS || !regs[lo as usize].truthy();
                    if taken {
                        assert!(
                            (b as usize) > ip,
                            "jump target {b} is not forward of {ip}"
                        );
                        ip = b as usize;
                    } else {
                        ip += 1;
                    }
                }
                Op::Call => {
                    let key = print_expr(&fragment.callees[b as usize]);
                    let callee = builtins
                        .get(&key)
                        .unwrap_or_else(|| panic!("no mirror builtin for '{key}'"));
                    let call_args: Vec<Value> = (0..hi)
                        .map(|j| regs[(lo + 1 + j) as usize].clone())
                        .collect();
                    regs[lo as usize] = callee(&call_args);
                    ip += 1;
                }
                Op::Return => {
                    if a == 1 {
                        return regs[(b & 15) as usize].clone();
                    }
                    return Value::Nil;
                }
            }
        }
        Value::Nil
    }

    fn fragment_of(source: &[u8]) -> Fragment {
        let chunk = parse_source(source).expect("parse");
        let Stmt::FunctionDecl { params, body, .. } = &chunk.stmts[0] else {
            panic!("expected function declaration");
        };
        try_compile(params, body).expect("fragment should compile")
    }

    #[test]
    fn compiles_and_runs_binary_arithmetic() {
        let fragment = fragment_of(b"function f(a, b) return a + b end");
        let result = run_fragment(
            &fragment,
            vec![Value::Int(2), Value::Int(3)],
            &HashMap::new(),
        );
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn reassignment_reading_its_own_target_is_safe() {
        let fragment = fragment_of(b"function f(x) x = 1 + x return x end");
        let result = run_fragment(&fragment, vec![Value::Int(5)], &HashMap::new());
        assert_eq!(result, Value::Int(6));
    }

    #[test]
    fn compiles_locals_and_reassignment() {
        let fragment = fragment_of(indoc! {b"
            function f()
              local x = 2
              x = x * 10
              local y = x + 4
              return y
            end
        "});
        let result = run_fragment(&fragment, vec![], &HashMap::new());
        assert_eq!(result, Value::Int(24));
    }

    #[test]
    fn compiles_branches() {
        let fragment = fragment_of(indoc! {b"
            function f(n)
              if n < 10 then
                return 1
              elseif n < 100 then
                return 2
              else
                return 3
              end
            end
        "});
        for (input, expected) in [(5, 1), (50, 2), (500, 3)] {
            let result = run_fragment(&fragment, vec![Value::Int(input)], &HashMap::new());
            assert_eq!(result, Value::Int(expected), "input {input}");
        }
    }

    #[test]
    fn compiles_calls_through_trampolines() {
        let fragment = fragment_of(b"function f(n) return dbl(n) + 1 end");
        let mut builtins: HashMap<String, Builtin> = HashMap::new();
        builtins.insert(
            "dbl".to_string(),
            Box::new(|args| {
                let Value::Int(v) = args[0] else {
                    panic!("expected int");
                };
                Value::Int(v * 2)
            }),
        );
        let result = run_fragment(&fragment, vec![Value::Int(7)], &builtins);
        assert_eq!(result, Value::Int(15));
    }

    #[test]
    fn compiles_table_reads_and_writes() {
        let fragment = fragment_of(indoc! {b"
            function f()
              local t = {}
              t[1] = 5
              t[2] = t[1] * 3
              return t[2]
            end
        "});
        let result = run_fragment(&fragment, vec![], &HashMap::new());
        assert_eq!(result, Value::Int(15));
    }

    #[test]
    fn compiles_unary_minus_and_division() {
        let fragment = fragment_of(b"function f(a) return -a / 2 end");
        let result = run_fragment(&fragment, vec![Value::Int(9)], &HashMap::new());
        assert_eq!(result, Value::Float(-4.5));
    }

    #[test]
    fn falls_through_return_returns_nil() {
        let fragment = fragment_of(b"function f(n) if n then return 1 end end");
        let result = run_fragment(&fragment, vec![Value::Nil], &HashMap::new());
        assert_eq!(result, Value::Nil);
    }

    #[test]
    fn branch_scoped_locals_do_not_leak() {
        let fragment = fragment_of(indoc! {b"
            function f(c)
              local x = 1
              if c then
                local x = 2
                x = x + 10
              end
              return x
            end
        "});
        let result = run_fragment(&fragment, vec![Value::Bool(true)], &HashMap::new());
        assert_eq!(result, Value::Int(1));
    }

    #[test]
    fn jumps_are_forward_only() {
        let fragment = fragment_of(indoc! {b"
            function f(n)
              if n < 0 then
                return 0 - n
              else
                return n
              end
            end
        "});
        for (i, instr) in fragment.code.iter().enumerate() {
            if instr.op == Op::Jump {
                assert!(usize::from(instr.b) > i + 1);
            }
        }
    }

    #[test]
    fn out_of_subset_constructs_are_rejected() {
        let sources: &[&[u8]] = &[
            b"function f() while true do end return 1 end",
            b"function f() return ... end",
            b"function f() g = 1 end",
            b"function f() return 1, 2 end",
            b"function f() local a, b = 1, 2 end",
            b"function f() return a .. b end",
            b"function f() local g = function() end end",
            b"function f(t) return t:m() end",
            b"function f(t) local u = t u() end",
            b"function f() return g() end",
            b"function f() h(1, g()) end",
        ];
        for source in sources {
            let chunk = parse_source(source).expect("parse");
            let Stmt::FunctionDecl { params, body, .. } = &chunk.stmts[0] else {
                panic!("expected function declaration");
            };
            assert!(
                try_compile(params, body).is_none(),
                "should be ineligible: {}",
                String::from_utf8_lossy(source)
            );
        }
    }

    #[test]
    fn opcode_values_are_distinct_and_seeded() {
        let mut a = Oracle::new(1);
        let mut b = Oracle::new(1);
        let mut c = Oracle::new(2);
        let first = opcode_values(&mut a);
        assert_eq!(first, opcode_values(&mut b));
        assert_ne!(first, opcode_values(&mut c));
        let distinct: HashSet<u16> = first.iter().copied().collect();
        assert_eq!(distinct.len(), OP_COUNT);
    }

    #[test]
    fn pass_wraps_eligible_functions_and_output_parses() {
        let mut chunk = parse_source(indoc! {b"
            function add(a, b) return a + b end
            function skip() while true do break end end
            print(add(2, 3))
        "})
        .expect("parse");
        let mut oracle = Oracle::new(7);
        let pass = VmWrap {
            randomize_opcodes: false,
            randomize_slots: false,
        };
        pass.run(&mut chunk, &mut oracle).expect("pass");

        let Stmt::FunctionDecl {
            params, is_vararg, ..
        } = &chunk.stmts[0]
        else {
            panic!("expected wrapped declaration");
        };
        assert!(params.is_empty());
        assert!(*is_vararg);

        // The ineligible function keeps its body.
        let Stmt::FunctionDecl { body, .. } = &chunk.stmts[1] else {
            panic!("expected untouched declaration");
        };
        assert!(matches!(body.stmts[0], Stmt::While { .. }));

        let printed = print_chunk(&chunk);
        parse_source(printed.as_bytes())
            .unwrap_or_else(|e| panic!("emitted interpreter must parse: {e}\n{printed}"));
        assert!(printed.contains("table.unpack"));
    }

    #[test]
    fn local_function_wrapping_preserves_declaration_form() {
        let mut chunk =
            parse_source(b"local function triple(n) return n * 3 end print(triple(4))")
                .expect("parse");
        let mut oracle = Oracle::new(13);
        let pass = VmWrap {
            randomize_opcodes: true,
            randomize_slots: true,
        };
        pass.run(&mut chunk, &mut oracle).expect("pass");
        assert!(matches!(
            &chunk.stmts[0],
            Stmt::FunctionDecl { is_local: true, is_vararg: true, .. }
        ));
    }
}
