//! Logger handles passed into the stateful components.
//!
//! A [Logger] carries the `log` target its owner writes to. Components receive a handle at
//! construction instead of reaching for global state, so an application can route the broker,
//! each connection and the client to different targets of whatever `log` backend it installs.
use core::fmt;
use log::Level;

/// A named handle onto the `log` facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logger {
    target: String,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("omnimq")
    }
}

impl Logger {
    /// Construct a logger writing to the provided target.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Derive a logger for a sub-component. The source is appended to the target as a path
    /// segment, e.g. `omnimq::broker`.
    pub fn with_source(&self, source: &str) -> Self {
        Self {
            target: format!("{}::{}", self.target, source),
        }
    }

    /// The `log` target messages are written to.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn enabled(&self, level: Level) -> bool {
        log::log_enabled!(target: &self.target, level)
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        log::log!(target: &self.target, level, "{}", args);
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Trace, args)
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args)
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args)
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args)
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_sources() {
        let logger = Logger::new("omnimq").with_source("broker").with_source("client-1");
        assert_eq!(logger.target(), "omnimq::broker::client-1");
        logger.debug(format_args!("reachable without a backend"));
    }
}
