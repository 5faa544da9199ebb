use thiserror::Error;

pub use crate::parser::ParseError;

/// Closed error set surfaced by the pipeline. Passes never recover a
/// sibling's failure; the driver maps these onto the external surface.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{what} limit exceeded: {actual} > {limit}")]
    ResourceExceeded {
        what: &'static str,
        limit: usize,
        actual: usize,
    },
    #[error("invalid option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },
    #[error("internal pipeline error in stage '{stage}'")]
    Internal { stage: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
