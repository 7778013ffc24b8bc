//! Window durations written as `"<value>[ ]<unit>"`.

use std::{fmt, str::FromStr, sync::LazyLock, time::Duration};

use regex::Regex;
use serde::{Deserialize, Deserializer, de};

static WINDOW_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s?(ms|s|m|h|d)$").expect("window pattern is a valid regex"));

/// Unit of a [`Window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowUnit {
    /// Milliseconds.
    Milliseconds,
    /// Seconds.
    Seconds,
    /// Minutes.
    Minutes,
    /// Hours.
    Hours,
    /// Days.
    Days,
}

impl WindowUnit {
    fn millis(self) -> u64 {
        match self {
            WindowUnit::Milliseconds => 1,
            WindowUnit::Seconds => 1_000,
            WindowUnit::Minutes => 60_000,
            WindowUnit::Hours => 3_600_000,
            WindowUnit::Days => 86_400_000,
        }
    }
}

impl AsRef<str> for WindowUnit {
    fn as_ref(&self) -> &str {
        match self {
            WindowUnit::Milliseconds => "ms",
            WindowUnit::Seconds => "s",
            WindowUnit::Minutes => "m",
            WindowUnit::Hours => "h",
            WindowUnit::Days => "d",
        }
    }
}

/// A limiting window such as `10 s` or `1h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    value: u64,
    unit: WindowUnit,
}

/// Errors produced when parsing a [`Window`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    /// The string is not `<digits>[ ]<unit>` with a known unit.
    #[error("Unable to parse window '{0}', expected a number followed by one of ms, s, m, h or d")]
    Malformed(String),
    /// The window has no length.
    #[error("Window '{0}' must be longer than zero")]
    Empty(String),
}

impl Window {
    /// Create a window, rejecting zero lengths.
    pub fn new(value: u64, unit: WindowUnit) -> Result<Self, WindowError> {
        let window = Self { value, unit };

        if value == 0 {
            return Err(WindowError::Empty(window.to_string()));
        }

        Ok(window)
    }

    pub(crate) const fn from_parts(value: u64, unit: WindowUnit) -> Self {
        Self { value, unit }
    }

    /// Window of whole milliseconds.
    pub fn millis(value: u64) -> Result<Self, WindowError> {
        Self::new(value, WindowUnit::Milliseconds)
    }

    /// Window of whole seconds.
    pub fn seconds(value: u64) -> Result<Self, WindowError> {
        Self::new(value, WindowUnit::Seconds)
    }

    /// The window normalized to milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.value.saturating_mul(self.unit.millis())
    }

    /// The window as a [`Duration`].
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.as_millis())
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit.as_ref())
    }
}

impl FromStr for Window {
    type Err = WindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || WindowError::Malformed(s.to_string());
        let captures = WINDOW_PATTERN.captures(s.trim()).ok_or_else(malformed)?;

        let value = captures[1].parse::<u64>().map_err(|_| malformed())?;

        let unit = match &captures[2] {
            "ms" => WindowUnit::Milliseconds,
            "s" => WindowUnit::Seconds,
            "m" => WindowUnit::Minutes,
            "h" => WindowUnit::Hours,
            "d" => WindowUnit::Days,
            _ => return Err(malformed()),
        };

        Self::new(value, unit)
    }
}

impl<'de> Deserialize<'de> for Window {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
