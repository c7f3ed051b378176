//! Two-level result type for best-effort operations.
//!
//! Cache and artifact-store calls never fail their caller, but they still need to report
//! *why* a value is missing. `Outcome::Degraded` carries that reason while `Result::Err`
//! stays reserved for fatal errors (strict startup, invalid arguments).

use std::fmt;

/// Why a best-effort operation fell back to its neutral result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degraded {
    /// The component never connected, or was disconnected.
    NotConnected,
    /// The backend returned an error after connecting.
    Backend(String),
    /// A stored value could not be encoded or decoded.
    Codec(String),
}

impl fmt::Display for Degraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degraded::NotConnected => write!(f, "not connected"),
            Degraded::Backend(msg) => write!(f, "backend error: {}", msg),
            Degraded::Codec(msg) => write!(f, "codec error: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T> {
    Ok(T),
    Degraded(Degraded),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded(_))
    }

    pub fn degraded_reason(&self) -> Option<&Degraded> {
        match self {
            Outcome::Degraded(reason) => Some(reason),
            Outcome::Ok(_) => None,
        }
    }

    /// Returns the value, or `fallback` when degraded.
    pub fn value_or(self, fallback: T) -> T {
        match self {
            Outcome::Ok(v) => v,
            Outcome::Degraded(_) => fallback,
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(v) => Some(v),
            Outcome::Degraded(_) => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Ok(v) => Outcome::Ok(f(v)),
            Outcome::Degraded(reason) => Outcome::Degraded(reason),
        }
    }
}

impl<T: Default> Outcome<T> {
    pub fn value_or_default(self) -> T {
        self.value_or(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_or_default() {
        let hit: Outcome<Option<u32>> = Outcome::Ok(Some(3));
        assert_eq!(hit.value_or_default(), Some(3));

        let down: Outcome<Option<u32>> = Outcome::Degraded(Degraded::NotConnected);
        assert!(down.is_degraded());
        assert_eq!(down.value_or_default(), None);
    }

    #[test]
    fn test_map_keeps_reason() {
        let down: Outcome<u64> = Outcome::Degraded(Degraded::Backend("timeout".into()));
        let mapped = down.map(|n| n * 2);
        assert_eq!(
            mapped.degraded_reason(),
            Some(&Degraded::Backend("timeout".into()))
        );
        assert_eq!(
            mapped.degraded_reason().map(|r| r.to_string()).as_deref(),
            Some("backend error: timeout")
        );
    }
}
