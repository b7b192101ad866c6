//! SourceLocation - where an IR node came from
//!
//! Lowering attaches a location to the nodes it creates so that
//! diagnostics raised deep inside the pipeline can still point back
//! at user source.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in a source file (1-indexed line and column)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SourceLocation {
    /// File name as given to the front end
    pub file: String,
    /// Line (1-indexed)
    pub line: u32,
    /// Column (1-indexed)
    pub column: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    /// Location for nodes synthesized by a pass
    pub fn synthetic() -> Self {
        Self::new("<generated>", 0, 0)
    }

    pub fn is_synthetic(&self) -> bool {
        self.line == 0
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_synthetic() {
            write!(f, "{}", self.file)
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        }
    }
}

/// Trait for things that may carry a source location
pub trait Located {
    fn location(&self) -> Option<&SourceLocation>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let loc = SourceLocation::new("main.vl", 3, 7);
        assert_eq!(loc.to_string(), "main.vl:3:7");
        assert_eq!(SourceLocation::synthetic().to_string(), "<generated>");
    }
}
