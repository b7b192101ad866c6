//! vela-error - Diagnostics for the Vela compiler
//!
//! Two kinds of problems are reported through this crate:
//!
//! - compile errors found while lowering a translation unit. They are
//!   collected in [`Diagnostics`], and the unit is dropped;
//! - fatal IR violations found inside the pipeline. They are converted
//!   into a [`Diagnostic`] with [`Level::Fatal`] and abort compilation.
//!
//! # Example
//!
//! ```rust
//! use vela_error::{Diagnostic, Diagnostics, ErrorCode, SourceLocation};
//!
//! let mut diagnostics = Diagnostics::new();
//! diagnostics.push(
//!     Diagnostic::error("unknown symbol `foo`")
//!         .with_code(ErrorCode::UNKNOWN_SYMBOL)
//!         .with_location(SourceLocation::new("main.vl", 4, 2)),
//! );
//! assert!(diagnostics.has_errors());
//! ```

pub mod diagnostic;
pub mod location;

pub use diagnostic::{Diagnostic, ErrorCode, Level};
pub use location::{Located, SourceLocation};

/// Default Result type for operations that may fail with a diagnostic
pub type Result<T> = std::result::Result<T, Diagnostic>;

/// Collection of diagnostics accumulated while compiling a unit
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.items.push(Diagnostic::error(message));
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.items.push(Diagnostic::warning(message));
    }

    pub fn has_errors(&self) -> bool {
        self.items
            .iter()
            .any(|d| matches!(d.level, Level::Error | Level::Fatal))
    }

    pub fn error_count(&self) -> usize {
        self.items
            .iter()
            .filter(|d| matches!(d.level, Level::Error | Level::Fatal))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.items.extend(other.items);
    }

    /// Renders all diagnostics
    pub fn render(&self, use_colors: bool) -> String {
        self.items
            .iter()
            .map(|d| d.render(use_colors))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(diagnostic: Diagnostic) -> Self {
        Self {
            items: vec![diagnostic],
        }
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
