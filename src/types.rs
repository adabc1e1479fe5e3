//! Core types for the state system.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Dense identifier of an attribute-tree node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Quark(pub u32);

impl Quark {
    /// Parent of every top-level attribute. Never assigned to a node.
    pub const ROOT: Quark = Quark(u32::MAX);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_root(self) -> bool {
        self == Quark::ROOT
    }
}

impl fmt::Debug for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "Quark(ROOT)")
        } else {
            write!(f, "Quark({})", self.0)
        }
    }
}

impl fmt::Display for Quark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "ROOT")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Application-defined value carried opaquely by the state system.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomValue {
    /// Distinguishes custom encodings; part of the value kind.
    pub tag: u8,
    pub payload: Vec<u8>,
}

/// Discriminant of a [`StateValue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Int,
    Long,
    Double,
    String,
    Custom(u8),
}

/// Value held by an attribute over an interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub enum StateValue {
    #[default]
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Custom(CustomValue),
}

impl StateValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            StateValue::Null => ValueKind::Null,
            StateValue::Int(_) => ValueKind::Int,
            StateValue::Long(_) => ValueKind::Long,
            StateValue::Double(_) => ValueKind::Double,
            StateValue::String(_) => ValueKind::String,
            StateValue::Custom(c) => ValueKind::Custom(c.tag),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            StateValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            StateValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            StateValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_custom(&self) -> Option<&CustomValue> {
        match self {
            StateValue::Custom(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Null => write!(f, "null"),
            StateValue::Int(v) => write!(f, "{}", v),
            StateValue::Long(v) => write!(f, "{}L", v),
            StateValue::Double(v) => write!(f, "{}", v),
            StateValue::String(v) => write!(f, "\"{}\"", v),
            StateValue::Custom(c) => write!(f, "custom<{}>[{} bytes]", c.tag, c.payload.len()),
        }
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        StateValue::Int(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Long(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Double(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::String(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::String(v)
    }
}

impl From<CustomValue> for StateValue {
    fn from(v: CustomValue) -> Self {
        StateValue::Custom(v)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(StateValue::Null)
    }
}

/// A closed, timestamped value of one attribute. `end` is inclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateInterval {
    pub quark: Quark,
    pub start: i64,
    pub end: i64,
    pub value: StateValue,
}

impl StateInterval {
    pub fn new(quark: Quark, start: i64, end: i64, value: StateValue) -> Self {
        Self {
            quark,
            start,
            end,
            value,
        }
    }

    /// Whether `t` falls within `[start, end]`.
    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }

    /// Whether the interval overlaps `[t1, t2]`.
    pub fn intersects(&self, t1: i64, t2: i64) -> bool {
        self.start <= t2 && t1 <= self.end
    }
}

impl fmt::Display for StateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}] quark {} = {}",
            self.start, self.end, self.quark, self.value
        )
    }
}

/// Build lifecycle of a state system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildState {
    Building,
    Built,
    Cancelled,
    Disposed,
}

impl BuildState {
    /// Whether waiters on the build should be released.
    pub fn is_finished(self) -> bool {
        !matches!(self, BuildState::Building)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kinds() {
        assert_eq!(StateValue::from(3).kind(), ValueKind::Int);
        assert_eq!(StateValue::from(3i64).kind(), ValueKind::Long);
        assert_eq!(StateValue::from(1.5).kind(), ValueKind::Double);
        assert_eq!(StateValue::from("run").kind(), ValueKind::String);
        assert_eq!(StateValue::from(None::<i32>).kind(), ValueKind::Null);

        let custom = CustomValue {
            tag: 7,
            payload: vec![1, 2],
        };
        assert_eq!(StateValue::from(custom).kind(), ValueKind::Custom(7));
    }

    #[test]
    fn test_interval_bounds() {
        let interval = StateInterval::new(Quark(0), 10, 19, StateValue::from("A"));
        assert!(interval.contains(10));
        assert!(interval.contains(19));
        assert!(!interval.contains(20));
        assert!(interval.intersects(0, 10));
        assert!(interval.intersects(19, 40));
        assert!(!interval.intersects(20, 40));
    }

    #[test]
    fn test_root_quark_display() {
        assert_eq!(Quark::ROOT.to_string(), "ROOT");
        assert_eq!(format!("{:?}", Quark(4)), "Quark(4)");
    }
}
