//! Diagnostic - compiler messages
//!
//! A diagnostic has:
//! - A severity level
//! - An optional structured code (EI001, EC002, ...)
//! - An optional source location
//! - Free-form notes

use crate::location::SourceLocation;
use std::fmt;

/// Diagnostic severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Internal invariant failure - aborts the whole compilation
    Fatal,
    /// User error - aborts the current translation unit
    Error,
    /// Warning - does not prevent compilation
    Warning,
    /// Note - additional information
    Note,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Fatal => "fatal",
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Note => "note",
        }
    }

    /// Returns the ANSI code for coloring
    pub fn color_code(&self) -> &'static str {
        match self {
            Level::Fatal => "\x1b[1;35m",   // Bold Magenta
            Level::Error => "\x1b[1;31m",   // Bold Red
            Level::Warning => "\x1b[1;33m", // Bold Yellow
            Level::Note => "\x1b[1;36m",    // Bold Cyan
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    /// Category (I = IR internal, C = compile error from lowering)
    pub category: char,
    /// Error number
    pub number: u16,
}

impl ErrorCode {
    pub const fn new(category: char, number: u16) -> Self {
        Self { category, number }
    }

    // IR invariant failures
    pub const STRUCTURAL_VIOLATION: Self = Self::new('I', 1);
    pub const UNSUPPORTED_CONSTRUCT: Self = Self::new('I', 2);
    pub const REJECTED_CAPTURE: Self = Self::new('I', 3);

    // Lowering errors
    pub const TYPE_MISMATCH: Self = Self::new('C', 1);
    pub const UNKNOWN_SYMBOL: Self = Self::new('C', 2);
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}{:03}", self.category, self.number)
    }
}

/// A complete diagnostic
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub level: Level,
    pub code: Option<ErrorCode>,
    pub message: String,
    pub location: Option<SourceLocation>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            code: None,
            message: message.into(),
            location: None,
            notes: Vec::new(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(Level::Fatal, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Level::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Level::Warning, message)
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Renders the diagnostic as text
    pub fn render(&self, use_colors: bool) -> String {
        let reset = if use_colors { "\x1b[0m" } else { "" };
        let color = if use_colors { self.level.color_code() } else { "" };
        let bold = if use_colors { "\x1b[1m" } else { "" };
        let blue = if use_colors { "\x1b[1;34m" } else { "" };

        let mut output = String::new();
        output.push_str(color);
        output.push_str(self.level.as_str());
        if let Some(code) = &self.code {
            output.push_str(&format!("[{}]", code));
        }
        output.push_str(reset);
        output.push_str(&format!("{}: {}{}\n", bold, self.message, reset));

        if let Some(location) = &self.location {
            output.push_str(&format!(" {}-->{} {}\n", blue, reset, location));
        }

        for note in &self.notes {
            output.push_str(&format!("  = {}note{}: {}\n", bold, reset, note));
        }

        output
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_format() {
        assert_eq!(ErrorCode::STRUCTURAL_VIOLATION.to_string(), "EI001");
        assert_eq!(ErrorCode::TYPE_MISMATCH.to_string(), "EC001");
        assert_eq!(ErrorCode::UNKNOWN_SYMBOL.to_string(), "EC002");
    }

    #[test]
    fn test_render_without_colors() {
        let diagnostic = Diagnostic::error("mismatched types")
            .with_code(ErrorCode::TYPE_MISMATCH)
            .with_location(SourceLocation::new("main.vl", 2, 9))
            .with_note("expected `i64`, found `bool`");

        let output = diagnostic.render(false);
        assert!(output.starts_with("error[EC001]: mismatched types"));
        assert!(output.contains("--> main.vl:2:9"));
        assert!(output.contains("note: expected `i64`"));
        assert!(!output.contains('\x1b'));
    }
}
