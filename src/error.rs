//! Engine-wide error taxonomy.
//!
//! Component modules define their own error enums close to the code that
//! raises them; this module classifies every failure into the five kinds the
//! propagation policy distinguishes, and tags it with the session phase in
//! which it occurred and the symbols involved.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failure, driving the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid config, unresolved derivation path, illegal parameter combos.
    /// Surfaced synchronously to the caller; never enters the streaming loop.
    Validation,
    /// Pause in live mode, out-of-order bar, double-wait on a subscription.
    /// Logged; the offending operation is rejected.
    StateViolation,
    /// Repository / calendar transient failures. Retried with bounded
    /// backoff; escalates to degraded after the retry budget.
    TransientExternal,
    /// Permanent repository error or unknown symbol at the source. Surfaced
    /// for the affected symbol; other symbols continue.
    PermanentExternal,
    /// TimeManager unreachable at boot, or every configured symbol failed
    /// provisioning. Transitions the coordinator to Terminating.
    FatalInit,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::StateViolation => write!(f, "state_violation"),
            Self::TransientExternal => write!(f, "transient_external"),
            Self::PermanentExternal => write!(f, "permanent_external"),
            Self::FatalInit => write!(f, "fatal_init"),
        }
    }
}

/// Session phase in which a failure occurred. Every user-visible failure
/// carries one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialization,
    PreSessionScanning,
    Streaming,
    QualityCheck,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization => write!(f, "initialization"),
            Self::PreSessionScanning => write!(f, "pre_session_scanning"),
            Self::Streaming => write!(f, "streaming"),
            Self::QualityCheck => write!(f, "quality_check"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

/// A classified engine failure: kind + phase + affected symbols + detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub phase: Phase,
    pub symbols: Vec<String>,
    pub detail: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, phase: Phase, detail: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            symbols: Vec::new(),
            detail: detail.into(),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbols.push(symbol.into());
        self
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols.extend(symbols.into_iter().map(Into::into));
        self
    }

    pub fn validation(phase: Phase, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, phase, detail)
    }

    pub fn fatal_init(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::FatalInit, Phase::Initialization, detail)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::FatalInit
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.symbols.is_empty() {
            write!(f, "[{}/{}] {}", self.phase, self.kind, self.detail)
        } else {
            write!(
                f,
                "[{}/{}] {} (symbols: {})",
                self.phase,
                self.kind,
                self.detail,
                self.symbols.join(", ")
            )
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_phase_kind_symbols() {
        let err = EngineError::validation(Phase::Initialization, "no derivation path")
            .with_symbol("AAPL");
        let text = err.to_string();
        assert!(text.contains("initialization"));
        assert!(text.contains("validation"));
        assert!(text.contains("AAPL"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(EngineError::fatal_init("calendar unreachable").is_fatal());
        assert!(!EngineError::validation(Phase::Streaming, "dup").is_fatal());
    }
}
