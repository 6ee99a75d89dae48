//! Error types for the hardware buffer extraction pass

use thiserror::Error;

use crate::ir::{Expr, ForKind};
use crate::schedule::LoopLevel;

/// Result type for pass operations
pub type PassResult<T> = Result<T, PassError>;

/// Pass failures. All of them abort the whole invocation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PassError {
    #[error("Lexer error at position {position}: {message}")]
    LexerError { position: usize, message: String },

    #[error("Parser error: {message}")]
    ParseError { message: String },

    #[error("Stage `{stage}`: streaming loop `{loop_name}` is {kind}; hardware buffers need sequential streaming loops")]
    NonSequentialStreamingLoop {
        stage: String,
        loop_name: String,
        kind: ForKind,
    },

    #[error("Stage `{stage}`: access `{expr}` is not a static affine window ({reason})")]
    NonAffineAccess {
        stage: String,
        expr: String,
        reason: String,
    },

    #[error("Stage `{stage}`: store level `{store}` is not at or outside compute level `{compute}` ({reason})")]
    InconsistentLoopLevels {
        stage: String,
        store: LoopLevel,
        compute: LoopLevel,
        reason: String,
    },

    #[error("Stage `{stage}`: dimension {dim} has no finite extent (`{expr}`)")]
    UnboundedCapacity {
        stage: String,
        dim: usize,
        expr: String,
    },

    #[error("Stage `{stage}` references `{missing}`, which is not in the environment")]
    MissingStage { stage: String, missing: String },

    #[error("Stage `{stage}`: {message}")]
    SizingError { stage: String, message: String },

    #[error("Nesting is deeper than the limit of {limit}")]
    NestingTooDeep { limit: usize },
}

impl PassError {
    pub fn lexer(position: usize, msg: impl Into<String>) -> Self {
        PassError::LexerError {
            position,
            message: msg.into(),
        }
    }

    pub fn parse_error(msg: impl Into<String>) -> Self {
        PassError::ParseError {
            message: msg.into(),
        }
    }

    pub fn non_affine(stage: &str, expr: impl ToString, reason: impl Into<String>) -> Self {
        PassError::NonAffineAccess {
            stage: stage.to_string(),
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }

    pub fn inconsistent(
        stage: &str,
        store: &LoopLevel,
        compute: &LoopLevel,
        reason: impl Into<String>,
    ) -> Self {
        PassError::InconsistentLoopLevels {
            stage: stage.to_string(),
            store: store.clone(),
            compute: compute.clone(),
            reason: reason.into(),
        }
    }

    pub fn unbounded(stage: &str, dim: usize, expr: impl ToString) -> Self {
        PassError::UnboundedCapacity {
            stage: stage.to_string(),
            dim,
            expr: expr.to_string(),
        }
    }

    pub fn missing(stage: &str, missing: &str) -> Self {
        PassError::MissingStage {
            stage: stage.to_string(),
            missing: missing.to_string(),
        }
    }

    pub fn sizing(stage: &str, msg: impl Into<String>) -> Self {
        PassError::SizingError {
            stage: stage.to_string(),
            message: msg.into(),
        }
    }

    /// Name of the stage the failure belongs to, when there is one.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PassError::NonSequentialStreamingLoop { stage, .. }
            | PassError::NonAffineAccess { stage, .. }
            | PassError::InconsistentLoopLevels { stage, .. }
            | PassError::UnboundedCapacity { stage, .. }
            | PassError::MissingStage { stage, .. }
            | PassError::SizingError { stage, .. } => Some(stage),
            PassError::LexerError { .. }
            | PassError::ParseError { .. }
            | PassError::NestingTooDeep { .. } => None,
        }
    }
}

/// `fold_to_int` could not reduce the expression to a literal.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("`{0}` is not a compile-time constant")]
pub struct NotConstant(pub Expr);
