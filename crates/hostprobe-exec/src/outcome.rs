//! Tagged results for operations that can come back empty.
//!
//! A remote probe that returns nothing is not the same as one that failed:
//! the first is worth retrying, the second is not. [`Outcome`] keeps the two
//! apart instead of collapsing both into an empty value.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;

/// Result of an invocation after empty-result classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Outcome<T> {
    /// Usable, non-empty value.
    Ok(T),
    /// The operation succeeded but produced nothing usable.
    Empty,
    /// The operation failed.
    Error(String),
}

impl<T> Outcome<T> {
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The value, if any.
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(v) => Some(v),
            Self::Empty | Self::Error(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Ok(v) => Outcome::Ok(f(v)),
            Self::Empty => Outcome::Empty,
            Self::Error(e) => Outcome::Error(e),
        }
    }

    /// Failure reason for non-`Ok` outcomes.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Ok(_) => None,
            Self::Empty => Some("empty result".to_string()),
            Self::Error(e) => Some(e.clone()),
        }
    }
}

impl<T: Emptiness> Outcome<T> {
    /// Classify a raw result: errors stay errors, empty values become `Empty`.
    pub fn classify<E: fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(v) if v.is_empty_result() => Self::Empty,
            Ok(v) => Self::Ok(v),
            Err(e) => Self::Error(e.to_string()),
        }
    }
}

/// Whether a value counts as an empty (possibly transient) result.
pub trait Emptiness {
    fn is_empty_result(&self) -> bool;
}

/// Whitespace-only text is empty: a shell that produced nothing but a newline
/// produced nothing.
impl Emptiness for String {
    fn is_empty_result(&self) -> bool {
        self.trim().is_empty()
    }
}

impl Emptiness for &str {
    fn is_empty_result(&self) -> bool {
        self.trim().is_empty()
    }
}

/// `null` and key-less objects are empty. Arrays never are, even when empty.
impl Emptiness for serde_json::Value {
    fn is_empty_result(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

impl<T: Emptiness> Emptiness for Option<T> {
    fn is_empty_result(&self) -> bool {
        self.as_ref().is_none_or(Emptiness::is_empty_result)
    }
}

impl<T> Emptiness for Vec<T> {
    fn is_empty_result(&self) -> bool {
        false
    }
}

impl<K, V, S> Emptiness for HashMap<K, V, S> {
    fn is_empty_result(&self) -> bool {
        self.is_empty()
    }
}

impl<K, V> Emptiness for BTreeMap<K, V> {
    fn is_empty_result(&self) -> bool {
        self.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_emptiness() {
        assert!(json!(null).is_empty_result());
        assert!(json!({}).is_empty_result());
        assert!(!json!({"ok": true}).is_empty_result());
        assert!(!json!([]).is_empty_result());
        assert!(!json!(0).is_empty_result());
        assert!(!json!("").is_empty_result());
    }

    #[test]
    fn string_emptiness() {
        assert!(String::new().is_empty_result());
        assert!("  \n".to_string().is_empty_result());
        assert!(!"host-1\n".to_string().is_empty_result());
    }

    #[test]
    fn option_and_collections() {
        assert!(None::<String>.is_empty_result());
        assert!(Some(String::new()).is_empty_result());
        assert!(!Some("x".to_string()).is_empty_result());
        assert!(!Vec::<u8>::new().is_empty_result());
        assert!(HashMap::<String, String>::new().is_empty_result());
    }

    #[test]
    fn classify_keeps_errors_distinct() {
        let ok: Outcome<String> = Outcome::classify(Ok::<_, String>("up".into()));
        assert_eq!(ok, Outcome::Ok("up".into()));

        let empty: Outcome<String> = Outcome::classify(Ok::<_, String>(String::new()));
        assert_eq!(empty, Outcome::Empty);

        let err: Outcome<String> = Outcome::classify(Err::<String, _>("boom"));
        assert_eq!(err, Outcome::Error("boom".into()));
    }

    #[test]
    fn failure_reason() {
        assert_eq!(Outcome::Ok(1).failure_reason(), None);
        assert_eq!(
            Outcome::<u8>::Empty.failure_reason().as_deref(),
            Some("empty result")
        );
        assert_eq!(
            Outcome::<u8>::Error("x".into()).failure_reason().as_deref(),
            Some("x")
        );
    }
}
