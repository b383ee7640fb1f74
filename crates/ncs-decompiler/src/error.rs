//! Decompilation errors and diagnostics

use ncs_bytecode::{DecodeError, InstrId};
use thiserror::Error;

pub type DecompileResult<T> = Result<T, DecompileError>;

/// Pipeline-level errors
///
/// Any pass may fail with one of these; the driver records the failure as a
/// diagnostic and keeps going with whatever state it has. Only the driver
/// itself decides whether the final outcome is a reconstruction or a stub.
#[derive(Debug, Error)]
pub enum DecompileError {
    /// The container did not decode
    #[error("Decode error: {0}")]
    Decoder(#[from] DecodeError),

    /// No action table is loaded
    #[error("Actions data not loaded")]
    ActionsMissing,

    /// Simulated stack invariant broken
    #[error("Stack underflow at offset {offset}")]
    StackUnderflow { offset: u32 },

    /// The prototype fixed point left a subroutine unresolved
    #[error("Unresolved signature for subroutine {sub}")]
    UnresolvedSignature { sub: u32 },

    /// A jump resolves to an impossible destination
    #[error("Malformed control flow: jump at offset {offset} to {target}")]
    MalformedControlFlow { offset: u32, target: u32 },

    /// The printer produced no output for a non-empty tree
    #[error("Printer produced no output")]
    PrinterEmpty,
}

/// A failure local to one instruction transform
///
/// Transforms return these instead of panicking or throwing; the main pass
/// converts each into an `ErrorComment` node and keeps replaying the
/// subroutine.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Not enough symbolic stack entries for this opcode
    #[error("stack underflow")]
    StackUnderflow,

    /// The referenced slot did not resolve to a variable
    #[error("unresolved variable at stack offset {0}")]
    UnresolvedVariable(i32),

    /// The last tree child was not the expression kind the opcode needs
    #[error("expected a pending expression")]
    MissingExpression,

    /// Opcode arrived in a state it cannot handle
    #[error("unexpected state for {mnemonic}")]
    BadState { mnemonic: &'static str },

    /// A jump could not be classified
    #[error("unclassifiable jump to offset {0}")]
    UnclassifiableJump(u32),

    /// The instruction's analysis record is missing
    #[error("missing analysis for {0}")]
    MissingAnalysis(InstrId),
}

/// One recorded pipeline diagnostic
///
/// Collected by the driver across all passes and rendered by the CLI.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Pass or stage that recorded the diagnostic
    pub pass: &'static str,
    pub message: String,
}

impl Diagnostic {
    pub fn new(pass: &'static str, message: impl Into<String>) -> Self {
        Self {
            pass,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.pass, self.message)
    }
}
