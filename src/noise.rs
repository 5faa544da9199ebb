//! Final textual pass: cosmetic whitespace padding and trailing comment
//! noise over the printed output.
//!
//! Strictly semantics-free. The printer never emits multi-line string
//! literals, so appending a comment to any line is safe. Total growth is
//! capped so the result stays within the configured multiple of the
//! printed size.

use crate::oracle::Oracle;

const PAD_RATE: f64 = 0.25;
const COMMENT_RATE: f64 = 0.2;

/// Applies noise to `code`, never letting the result exceed `cap` bytes.
pub fn apply(code: &str, oracle: &mut Oracle, cap: usize) -> String {
    let mut out = String::with_capacity(code.len());
    for line in code.lines() {
        let mut rendered = line.to_string();
        if oracle.chance(PAD_RATE) {
            let pad = oracle.range(1, 4) as usize;
            rendered.extend(std::iter::repeat_n(' ', pad));
        }
        if oracle.chance(COMMENT_RATE) {
            let word = oracle.identifier();
            rendered.push_str(" -- ");
            rendered.push_str(&word);
        }
        // Fall back to the untouched line once the cap is reached.
        let growth = rendered.len() - line.len();
        if out.len() + rendered.len() + 1 > cap && growth > 0 {
            rendered.truncate(line.len());
        }
        out.push_str(&rendered);
        out.push('\n');
    }
    out
}
