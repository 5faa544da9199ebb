//! Pipeline driver: bounds, pass orchestration, and result assembly.
//!
//! One call owns one oracle, one token stream, and one tree from parse to
//! print; nothing is shared across requests. The pipeline is all or
//! nothing: any pass error aborts the request and no partial output is
//! ever produced.

use serde::Serialize;

use crate::bytes::rolling_hash;
use crate::error::{Error, Result};
use crate::lexer::{self, TokenKind};
use crate::noise;
use crate::options::Options;
use crate::oracle::Oracle;
use crate::parser;
use crate::pass;
use crate::printer;

/// Input source size ceiling.
pub const MAX_SOURCE_BYTES: usize = 5 * 1024 * 1024;

/// The textual noise pass may at most double the printed output.
const NOISE_CAP_FACTOR: usize = 2;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Obfuscation {
    pub code: String,
    pub original_size: usize,
    pub obfuscated_size: usize,
    pub expansion_ratio: String,
    pub security_level: String,
    pub checksum: String,
}

/// Runs the whole pipeline over `source` with the given options and seed.
/// Deterministic: the same `(source, options, seed)` triple produces
/// byte-identical output on every run and every process.
pub fn obfuscate(source: &[u8], options: &Options, seed: u64) -> Result<Obfuscation> {
    if source.len() > MAX_SOURCE_BYTES {
        return Err(Error::ResourceExceeded {
            what: "input size",
            limit: MAX_SOURCE_BYTES,
            actual: source.len(),
        });
    }
    let techniques = options.resolve()?;
    tracing::info!(
        level = techniques.level,
        bytes = source.len(),
        "starting obfuscation"
    );

    let tokens = lexer::tokenize(source);
    let mut oracle = Oracle::new(seed);
    // Every name the program mentions is off-limits for fresh identifiers.
    for token in &tokens {
        if token.kind == TokenKind::Identifier {
            oracle.reserve(&token.text());
        }
    }
    let mut chunk = parser::parse_tokens(tokens)?;

    for stage in pass::pipeline(&techniques) {
        tracing::debug!(pass = stage.name(), "running pass");
        stage.run(&mut chunk, &mut oracle)?;
    }

    let printed = printer::print_chunk(&chunk);
    let code = noise::apply(&printed, &mut oracle, printed.len() * NOISE_CAP_FACTOR);

    // The printer and every pass guarantee parseable output; a failure
    // here is a pipeline bug, not a user error.
    if parser::parse_source(code.as_bytes()).is_err() {
        return Err(Error::Internal { stage: "emit" });
    }

    let original_size = source.len();
    let obfuscated_size = code.len();
    let ratio = obfuscated_size as f64 / original_size.max(1) as f64 * 100.0;
    let checksum = format!("{:016x}", u64::from(rolling_hash(code.as_bytes())));
    tracing::info!(obfuscated_size, %checksum, "obfuscation finished");

    Ok(Obfuscation {
        code,
        original_size,
        obfuscated_size,
        expansion_ratio: format!("{ratio:.2}%"),
        security_level: techniques.security_level().to_string(),
        checksum,
    })
}
