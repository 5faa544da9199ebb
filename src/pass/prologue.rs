//! Anti-analysis prologue.
//!
//! Each enabled flag contributes one guard snippet, prepended to the
//! output as raw source. The snippets run in the target runtime and are
//! inert under normal conditions; they only ever declare fresh oracle
//! names, so they cannot shadow anything the program uses. Every snippet
//! must parse under this crate's own grammar, which the tests enforce.

use std::fmt::Write;

use crate::bytes::rolling_hash;
use crate::error::Result;
use crate::options::Techniques;
use crate::oracle::Oracle;
use crate::parser::ast::{Block, Stmt};
use crate::pass::Pass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Guard {
    AntiDebug,
    AntiTampering,
    IntegrityChecks,
    EnvironmentDetection,
    TimingProtection,
    MemoryProtection,
}

pub struct Prologue {
    guards: Vec<Guard>,
}

impl Prologue {
    pub fn from_techniques(techniques: &Techniques) -> Self {
        let mut guards = Vec::new();
        if techniques.anti_debug {
            guards.push(Guard::AntiDebug);
        }
        if techniques.anti_tampering {
            guards.push(Guard::AntiTampering);
        }
        if techniques.integrity_checks {
            guards.push(Guard::IntegrityChecks);
        }
        if techniques.environment_detection {
            guards.push(Guard::EnvironmentDetection);
        }
        if techniques.timing_protection {
            guards.push(Guard::TimingProtection);
        }
        if techniques.memory_protection {
            guards.push(Guard::MemoryProtection);
        }
        Self { guards }
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

impl Pass for Prologue {
    fn name(&self) -> &'static str {
        "prologue"
    }

    fn run(&self, chunk: &mut Block, oracle: &mut Oracle) -> Result<()> {
        for guard in self.guards.iter().rev() {
            let text = render(*guard, oracle);
            chunk.stmts.insert(0, Stmt::RawEmit(text));
        }
        tracing::debug!(guards = self.guards.len(), "prologue snippets attached");
        Ok(())
    }
}

fn render(guard: Guard, oracle: &mut Oracle) -> String {
    match guard {
        Guard::AntiDebug => anti_debug(oracle),
        Guard::AntiTampering => anti_tampering(oracle),
        Guard::IntegrityChecks => integrity_check(oracle),
        Guard::EnvironmentDetection => environment_detection(),
        Guard::TimingProtection => timing_protection(oracle),
        Guard::MemoryProtection => memory_protection(oracle),
    }
}

fn anti_debug(oracle: &mut Oracle) -> String {
    let dbg = oracle.identifier();
    let mut out = String::new();
    writeln!(out, "local {dbg} = debug").expect("write to string");
    writeln!(
        out,
        "if {dbg} and {dbg}.gethook and {dbg}.gethook() ~= nil then error(\"\") end"
    )
    .expect("write to string");
    out
}

/// Hashes an embedded marker and compares against the value computed at
/// emit time; editing the marker in the output breaks the comparison.
fn anti_tampering(oracle: &mut Oracle) -> String {
    let marker = oracle.identifier();
    let expected = rolling_hash(marker.as_bytes());
    let s = oracle.identifier();
    let c = oracle.identifier();
    let i = oracle.identifier();
    let mut out = String::new();
    writeln!(out, "local {s} = \"{marker}\"").expect("write to string");
    writeln!(out, "local {c} = 0").expect("write to string");
    writeln!(
        out,
        "for {i} = 1, #{s} do {c} = ({c} * 31 + {s}:byte({i})) % 4294967296 end"
    )
    .expect("write to string");
    writeln!(out, "if {c} ~= {expected} then error(\"\") end").expect("write to string");
    out
}

fn integrity_check(oracle: &mut Oracle) -> String {
    let f = oracle.identifier();
    let x = oracle.identifier();
    let mul = oracle.range(3, 41);
    let add = oracle.range(1, 251);
    let probe = oracle.range(2, 89);
    let expected = probe * mul + add;
    let mut out = String::new();
    writeln!(
        out,
        "local {f} = function({x}) return {x} * {mul} + {add} end"
    )
    .expect("write to string");
    writeln!(out, "if {f}({probe}) ~= {expected} then error(\"\") end").expect("write to string");
    out
}

fn environment_detection() -> String {
    "if type(getmetatable) ~= \"function\" or type(pcall) ~= \"function\" then error(\"\") end\n"
        .to_string()
}

fn timing_protection(oracle: &mut Oracle) -> String {
    let before = oracle.identifier();
    let after = oracle.identifier();
    let acc = oracle.identifier();
    let i = oracle.identifier();
    let rounds = oracle.range(64, 512);
    let mut out = String::new();
    writeln!(
        out,
        "local {before} = os and os.clock and os.clock() or 0"
    )
    .expect("write to string");
    writeln!(out, "local {acc} = 0").expect("write to string");
    writeln!(out, "for {i} = 1, {rounds} do {acc} = {acc} + {i} end").expect("write to string");
    writeln!(out, "local {after} = os and os.clock and os.clock() or 0").expect("write to string");
    writeln!(out, "if {after} - {before} > 5 then error(\"\") end").expect("write to string");
    out
}

fn memory_protection(oracle: &mut Oracle) -> String {
    let kb = oracle.identifier();
    let mut out = String::new();
    writeln!(
        out,
        "local {kb} = collectgarbage and collectgarbage(\"count\") or 0"
    )
    .expect("write to string");
    writeln!(out, "if {kb} > 4194304 then error(\"\") end").expect("write to string");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn all_guards() -> Vec<Guard> {
        vec![
            Guard::AntiDebug,
            Guard::AntiTampering,
            Guard::IntegrityChecks,
            Guard::EnvironmentDetection,
            Guard::TimingProtection,
            Guard::MemoryProtection,
        ]
    }

    #[test]
    fn every_snippet_parses_standalone() {
        let mut oracle = Oracle::new(3);
        for guard in all_guards() {
            let text = render(guard, &mut oracle);
            parse_source(text.as_bytes())
                .unwrap_or_else(|e| panic!("snippet {guard:?} must parse: {e}\n{text}"));
        }
    }

    #[test]
    fn tampering_constant_matches_the_marker_hash() {
        let mut oracle = Oracle::new(9);
        let text = anti_tampering(&mut oracle);
        // Extract the marker and expected value back out of the snippet.
        let marker = text
            .split('"')
            .nth(1)
            .expect("marker literal in snippet");
        let expected: u32 = text
            .split("~= ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .expect("expected constant in snippet")
            .parse()
            .expect("numeric constant");
        assert_eq!(rolling_hash(marker.as_bytes()), expected);
    }

    #[test]
    fn snippets_are_prepended_in_flag_order() {
        let techniques = Techniques {
            anti_debug: true,
            anti_tampering: true,
            memory_protection: true,
            ..Techniques::default()
        };
        let prologue = Prologue::from_techniques(&techniques);
        let mut chunk = parse_source(b"print(1)").expect("parse");
        let mut oracle = Oracle::new(4);
        prologue.run(&mut chunk, &mut oracle).expect("pass");
        assert_eq!(chunk.stmts.len(), 4);
        let Stmt::RawEmit(first) = &chunk.stmts[0] else {
            panic!("expected raw snippet");
        };
        assert!(first.contains("debug"));
        let Stmt::RawEmit(third) = &chunk.stmts[2] else {
            panic!("expected raw snippet");
        };
        assert!(third.contains("collectgarbage"));
    }

    #[test]
    fn disabled_flags_emit_nothing() {
        let prologue = Prologue::from_techniques(&Techniques::default());
        assert!(prologue.is_empty());
        let mut chunk = parse_source(b"print(1)").expect("parse");
        let before = chunk.clone();
        prologue
            .run(&mut chunk, &mut Oracle::new(1))
            .expect("pass");
        assert_eq!(chunk, before);
    }

    #[test]
    fn whole_prologue_output_parses_with_program_body() {
        let techniques = Techniques {
            anti_debug: true,
            anti_tampering: true,
            integrity_checks: true,
            environment_detection: true,
            timing_protection: true,
            memory_protection: true,
            ..Techniques::default()
        };
        let prologue = Prologue::from_techniques(&techniques);
        let mut chunk = parse_source(b"local x = 1 print(x)").expect("parse");
        let mut oracle = Oracle::new(77);
        prologue.run(&mut chunk, &mut oracle).expect("pass");
        let printed = crate::printer::print_chunk(&chunk);
        parse_source(printed.as_bytes())
            .unwrap_or_else(|e| panic!("prologue output must parse: {e}\n{printed}"));
    }
}
