//! AST-to-AST transformation passes.
//!
//! Each pass is a synchronous tree walk over an exclusively owned chunk;
//! the pipeline is assembled from the resolved technique set and runs the
//! passes in a fixed order. Passes surface errors unmodified and never
//! recover a sibling's failure.

pub(crate) mod build;
pub mod control_flow;
pub mod dead_code;
pub mod prologue;
pub mod rename;
pub mod strings;
pub mod visit;
pub mod vm_wrap;

use crate::error::Result;
use crate::options::Techniques;
use crate::oracle::Oracle;
use crate::parser::ast::Block;

pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&self, chunk: &mut Block, oracle: &mut Oracle) -> Result<()>;
}

/// Builds the ordered pass chain for one request. Renaming runs first so
/// later passes see stable fresh names; the anti-analysis prologue runs
/// last so its snippets end up above everything else untouched.
pub fn pipeline(techniques: &Techniques) -> Vec<Box<dyn Pass>> {
    let mut passes: Vec<Box<dyn Pass>> = Vec::new();
    if techniques.variable_renaming {
        passes.push(Box::new(rename::VariableRename));
    }
    if techniques.string_encryption {
        passes.push(Box::new(strings::StringEncryption));
    }
    if techniques.control_flow {
        passes.push(Box::new(control_flow::ControlFlow));
    }
    if techniques.dead_code {
        passes.push(Box::new(dead_code::DeadCode::default()));
    }
    if techniques.vm {
        passes.push(Box::new(vm_wrap::VmWrap {
            randomize_opcodes: techniques.opcode_randomization,
            randomize_slots: techniques.stack_randomization,
        }));
    }
    let prologue = prologue::Prologue::from_techniques(techniques);
    if !prologue.is_empty() {
        passes.push(Box::new(prologue));
    }
    passes
}
