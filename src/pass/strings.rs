//! String literal encryption.
//!
//! Every string literal is replaced by a call to a fresh-named decoder
//! closure emitted once at the top of the chunk. Encoding composes three
//! invertible byte transforms (non-linear map, keyed position XOR,
//! substitution table); the decoder reverses them in reverse order. The
//! per-call key travels as the first call argument, masked with a session
//! constant baked into the decoder body.

use crate::bytes::{invert_sbox, nonlinear_encode, sbox, xor_keystream};
use crate::error::Result;
use crate::oracle::Oracle;
use crate::parser::ast::{BinOp, Block, Expr, Field, Stmt, UnOp};
use crate::pass::build::{array_table, assign, bin, call, function, index, local, member, num, unary, var};
use crate::pass::{Pass, visit};

pub struct StringEncryption;

/// Upper bound on payload bytes per decoder call. The target runtime caps
/// registers per function, which caps call arguments well below 256.
const CHUNK_BYTES: usize = 180;

impl Pass for StringEncryption {
    fn name(&self) -> &'static str {
        "string-encrypt"
    }

    fn run(&self, chunk: &mut Block, oracle: &mut Oracle) -> Result<()> {
        let table = sbox(oracle);
        let inverse = invert_sbox(&table);
        let mask = (oracle.u32() & 0xFF) as u8;
        let decoder = oracle.identifier();

        let mut replaced = 0usize;
        visit::exprs_mut(chunk, &mut |expr| {
            if let Expr::String(bytes) = expr {
                *expr = decoder_calls(&decoder, bytes, mask, &table, oracle);
                replaced += 1;
            }
        });

        tracing::debug!(literals = replaced, "encrypted string literals");
        if replaced > 0 {
            chunk
                .stmts
                .insert(0, decoder_stmt(&decoder, &inverse, mask, oracle));
        }
        Ok(())
    }
}

/// One decoder call per chunk, concatenated back together for literals
/// longer than a single call can carry. Each chunk gets its own key and
/// restarts the position keystream.
fn decoder_calls(
    decoder: &str,
    bytes: &[u8],
    mask: u8,
    table: &[u8; 256],
    oracle: &mut Oracle,
) -> Expr {
    let one_call = |payload: &[u8], oracle: &mut Oracle| {
        let key = (oracle.u32() & 0xFF) as u8;
        let encoded = encode(payload, key, table);
        let mut args = Vec::with_capacity(encoded.len() + 1);
        args.push(num(i64::from(key ^ mask)));
        args.extend(encoded.into_iter().map(|byte| num(i64::from(byte))));
        call(var(decoder), args)
    };

    if bytes.len() <= CHUNK_BYTES {
        return one_call(bytes, oracle);
    }
    let mut parts: Vec<Expr> = bytes
        .chunks(CHUNK_BYTES)
        .map(|part| one_call(part, oracle))
        .collect();
    let mut joined = parts.pop().expect("at least two chunks here");
    while let Some(part) = parts.pop() {
        joined = bin(BinOp::Concat, part, joined);
    }
    joined
}

/// Forward encoding of one literal under a per-call key.
pub fn encode(bytes: &[u8], key: u8, table: &[u8; 256]) -> Vec<u8> {
    bytes
        .iter()
        .enumerate()
        .map(|(i, &byte)| {
            let byte = nonlinear_encode(byte);
            let byte = xor_keystream(byte, key, i);
            table[usize::from(byte)]
        })
        .collect()
}

/// `local <name> = function(<k>, ...) ... end` reversing the three encode
/// stages. Built as a tree so the printer guarantees parseable output.
fn decoder_stmt(name: &str, inverse: &[u8; 256], mask: u8, oracle: &mut Oracle) -> Stmt {
    let k = oracle.identifier();
    let packed = oracle.identifier();
    let table = oracle.identifier();
    let out = oracle.identifier();
    let i = oracle.identifier();
    let b = oracle.identifier();

    let mask_term = |value: Expr| bin(BinOp::Mod, value, num(256));
    let body = vec![
        local(
            &packed,
            Expr::Table {
                fields: vec![Field::Array(Expr::Vararg)],
            },
        ),
        local(
            &table,
            array_table(inverse.iter().map(|&x| num(i64::from(x))).collect()),
        ),
        assign(var(&k), bin(BinOp::BitXor, var(&k), num(i64::from(mask)))),
        local(&out, Expr::Table { fields: vec![] }),
        local(&i, num(0)),
        Stmt::While {
            cond: bin(BinOp::Lt, var(&i), unary(UnOp::Len, var(&packed))),
            body: Block::new(vec![
                local(&b, index(var(&packed), bin(BinOp::Add, var(&i), num(1)))),
                // Stage 3 inverse: substitution table.
                assign(var(&b), index(var(&table), bin(BinOp::Add, var(&b), num(1)))),
                // Stage 2 inverse: keyed position XOR.
                assign(
                    var(&b),
                    bin(
                        BinOp::BitXor,
                        bin(BinOp::BitXor, var(&b), var(&k)),
                        mask_term(bin(BinOp::Mul, var(&i), num(17))),
                    ),
                ),
                // Stage 1 inverse, round by round.
                assign(
                    var(&b),
                    bin(BinOp::BitXor, var(&b), bin(BinOp::Shr, var(&b), num(5))),
                ),
                assign(var(&b), mask_term(bin(BinOp::Mul, var(&b), num(223)))),
                assign(
                    var(&b),
                    bin(
                        BinOp::BitXor,
                        bin(
                            BinOp::BitXor,
                            var(&b),
                            mask_term(bin(BinOp::Shl, var(&b), num(3))),
                        ),
                        mask_term(bin(BinOp::Shl, var(&b), num(6))),
                    ),
                ),
                assign(var(&b), mask_term(bin(BinOp::Mul, var(&b), num(197)))),
                assign(
                    var(&b),
                    bin(BinOp::BitXor, var(&b), bin(BinOp::Shr, var(&b), num(4))),
                ),
                assign(var(&b), mask_term(bin(BinOp::Mul, var(&b), num(183)))),
                assign(
                    index(var(&out), bin(BinOp::Add, var(&i), num(1))),
                    call(member(var("string"), "char"), vec![var(&b)]),
                ),
                assign(var(&i), bin(BinOp::Add, var(&i), num(1))),
            ]),
        },
        Stmt::Return {
            exprs: vec![call(member(var("table"), "concat"), vec![var(&out)])],
        },
    ];
    local(name, function(vec![k], true, body))
}
