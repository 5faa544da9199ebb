//! `luacloak` library crate.
//!
//! High-level layout:
//! - frontend: `lexer` + `parser` produce the shared tree (`parser::ast`)
//! - transformation passes under `pass`, all driven by the seeded `oracle`
//! - `printer` renders the tree back to source; `noise` roughs up the text
//! - `obfuscator` is the driver tying bounds, passes, and metadata together

pub mod bytes;
pub mod error;
pub mod lexer;
pub mod noise;
pub mod obfuscator;
pub mod options;
pub mod oracle;
pub mod parser;
pub mod pass;
pub mod printer;

pub use error::Error;
pub use obfuscator::{Obfuscation, obfuscate};
pub use options::{Options, Profile};
pub use parser::ast;
