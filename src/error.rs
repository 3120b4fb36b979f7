//! Obfuscation error variants.

use std::{io, path::PathBuf};
use thiserror::Error;

/// Errors that abort an obfuscation run.
///
/// Annotation problems are not represented here: they are reported as
/// diagnostics against the offending function and downgrade the effective
/// option to disabled, while the run continues.
#[derive(Debug, Error)]
pub enum ObfuscationError {
    /// The configuration file does not exist.
    #[error("config file doesn't exist: {}", .0.display())]
    ConfigMissing(PathBuf),
    /// The configuration file could not be parsed as JSON.
    #[error("can not parse config file: {0}")]
    ConfigParse(#[from] serde_json::Error),
    /// The configuration root is not a JSON object.
    #[error("json root is not an object")]
    ConfigRoot,
    /// The RTTI scrambler is enabled but no random seed was configured.
    #[error("no random seed found in config file, but rtti scrambler enabled")]
    MissingRandomSeed,
    /// A structural assumption about the input IR does not hold.
    #[error("structural error: {0}")]
    Structural(String),
    /// I/O and OS related errors.
    #[error("unrecoverable error: {0}")]
    Io(#[from] io::Error),
}

impl ObfuscationError {
    /// Produce a structural error from any displayable cause.
    pub fn structural<S: Into<String>>(msg: S) -> Self {
        Self::Structural(msg.into())
    }
}

/// Runtime errors of the reference evaluator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    /// The step budget was exhausted; the program is assumed non-terminating.
    #[error("step limit exceeded")]
    StepLimit,
    /// An operand did not have the type the instruction requires.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// A load or store touched an address outside its memory object.
    #[error("memory access out of bounds")]
    OutOfBounds,
    /// An indirect branch target was not the address of a block in the
    /// current function.
    #[error("indirect branch to a foreign or malformed address")]
    BadIndirectTarget,
    /// A called operand did not evaluate to a function.
    #[error("called operand is not a function")]
    BadCallee,
    /// The evaluated IR is malformed (missing terminator, undefined value).
    #[error("malformed ir: {0}")]
    MalformedIr(String),
}
