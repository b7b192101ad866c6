//! IR errors
//!
//! Every failure inside the pipeline is a compiler bug or an unsupported
//! construct, never a user-facing condition. They are propagated as
//! values so the session can report them and stop.

use thiserror::Error;
use vela_error::{Diagnostic, ErrorCode};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IrError {
    /// An invariant of the graph does not hold
    #[error("structural violation: {0}")]
    StructuralViolation(String),

    /// A reachable path that is not implemented
    #[error("unsupported construct: {0}")]
    UnsupportedConstruct(String),

    /// A parallel loop reads or writes a value in a way a kernel cannot
    #[error("kernel `{kernel}` rejects capture: {reason}")]
    RejectedCapture { kernel: String, reason: String },
}

impl IrError {
    pub fn code(&self) -> ErrorCode {
        match self {
            IrError::StructuralViolation(_) => ErrorCode::STRUCTURAL_VIOLATION,
            IrError::UnsupportedConstruct(_) => ErrorCode::UNSUPPORTED_CONSTRUCT,
            IrError::RejectedCapture { .. } => ErrorCode::REJECTED_CAPTURE,
        }
    }
}

impl From<IrError> for Diagnostic {
    fn from(err: IrError) -> Self {
        let code = err.code();
        Diagnostic::fatal(err.to_string()).with_code(code)
    }
}

pub type Result<T> = std::result::Result<T, IrError>;

/// Returns a `StructuralViolation` from the enclosing function
#[macro_export]
macro_rules! ir_bail {
    ($($arg:tt)+) => {
        return Err($crate::IrError::StructuralViolation(format!($($arg)+)))
    };
}

/// Returns a `StructuralViolation` unless the condition holds
#[macro_export]
macro_rules! ir_ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::ir_bail!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_error::Level;

    fn check(flag: bool) -> Result<u32> {
        ir_ensure!(flag, "flag was {}", flag);
        Ok(1)
    }

    #[test]
    fn test_ensure_macro() {
        assert_eq!(check(true), Ok(1));
        assert_eq!(
            check(false),
            Err(IrError::StructuralViolation("flag was false".into()))
        );
    }

    #[test]
    fn test_into_diagnostic() {
        let diagnostic: Diagnostic = IrError::UnsupportedConstruct("break in kernel".into()).into();
        assert_eq!(diagnostic.level, Level::Fatal);
        assert_eq!(diagnostic.code, Some(ErrorCode::UNSUPPORTED_CONSTRUCT));
        assert!(diagnostic.message.contains("break in kernel"));
    }
}
