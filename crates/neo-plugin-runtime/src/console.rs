//! Console shim mapping print-style calls onto the bridge log sink.

use std::fmt::{self, Display};

use crate::bridge::Bridge;
use crate::host::LogLevel;

/// `console.*` style logging for a plugin.
///
/// Arguments are stringified and joined with a single space.
#[derive(Debug, Clone)]
pub struct Console {
    bridge: Bridge,
}

impl Console {
    pub fn new(bridge: Bridge) -> Self {
        Self { bridge }
    }

    pub fn log(&self, args: &[&dyn Display]) {
        self.print(LogLevel::Info, args);
    }

    pub fn info(&self, args: &[&dyn Display]) {
        self.print(LogLevel::Info, args);
    }

    pub fn warn(&self, args: &[&dyn Display]) {
        self.print(LogLevel::Warn, args);
    }

    pub fn error(&self, args: &[&dyn Display]) {
        self.print(LogLevel::Error, args);
    }

    pub fn debug(&self, args: &[&dyn Display]) {
        self.print(LogLevel::Debug, args);
    }

    pub fn trace(&self, args: &[&dyn Display]) {
        self.print(LogLevel::Trace, args);
    }

    fn print(&self, level: LogLevel, args: &[&dyn Display]) {
        // Formatted lazily so a panicking argument is caught by the log sink.
        self.bridge.log().write(level, Joined(args));
    }
}

/// Arguments rendered with a single space between them.
struct Joined<'a>(&'a [&'a dyn Display]);

impl Display for Joined<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            Display::fmt(arg, f)?;
        }
        Ok(())
    }
}
