//! Leveled message log kept by the relocation engine
//!
//! Every entry is mirrored to the `log` facade so `RUST_LOG` shows the same
//! messages the caller can inspect after a run.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Level {
    Trace,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Trace => "trace",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.level, self.message)
    }
}

/// Append-only during a run; cleared only by the owner between runs
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, level: Level, message: impl Into<String>) {
        let message = message.into();
        match level {
            Level::Trace => log::trace!("{}", message),
            Level::Info => log::info!("{}", message),
            Level::Warning => log::warn!("{}", message),
            Level::Error => log::error!("{}", message),
        }
        self.entries.push(Diagnostic { level, message });
    }

    pub fn trace(&mut self, message: impl Into<String>) {
        self.push(Level::Trace, message);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(Level::Info, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.push(Level::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(Level::Error, message);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, level: Level) -> usize {
        self.entries.iter().filter(|d| d.level == level).count()
    }

    /// Any error-level entry recorded since position `mark`
    pub fn has_errors_since(&self, mark: usize) -> bool {
        self.entries[mark.min(self.entries.len())..]
            .iter()
            .any(|d| d.level == Level::Error)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn entries_keep_order_and_levels() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.info("tracing entry $C000");
        diagnostics.warning("entry $C010 timed out");
        diagnostics.error("zero-page window too small");

        let levels: Vec<Level> = diagnostics.entries().iter().map(|d| d.level).collect();
        assert_eq!(levels, vec![Level::Info, Level::Warning, Level::Error]);
        assert_eq!(diagnostics.count(Level::Warning), 1);
        assert!(diagnostics.has_errors_since(0));
        assert!(!diagnostics.has_errors_since(3));
        assert_eq!(
            diagnostics.entries()[1].to_string(),
            "warning: entry $C010 timed out"
        );

        diagnostics.clear();
        assert!(diagnostics.is_empty());
    }
}
