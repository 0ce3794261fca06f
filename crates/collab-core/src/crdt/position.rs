use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A fractional position identifier in a [`CrdtText`](super::CrdtText)
///
/// Positions are allocated densely: inserting between two neighbours
/// takes their midpoint, so an identifier can always be produced without
/// shifting existing elements. Positions are never reused; a tombstoned
/// element keeps its position so concurrent inserts anchored to it still
/// order correctly.
///
/// Two concurrent midpoint allocations in the same gap can produce the
/// same raw value. Element ordering therefore always pairs a `Position`
/// with the creating operation's id as a tie-break; `Position` equality
/// alone never decides element order.
// TODO: f64 midpoints exhaust after ~50 repeated inserts into the same
// gap; switch to an unbounded digit-vector identifier if that shows up
// in practice.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Position(f64);

impl std::fmt::Debug for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Position {}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Position {
    pub(crate) const LOWER: f64 = 0.0;
    pub(crate) const UPPER: f64 = 32768.0;

    /// Returns a new position between two existing positions
    ///
    /// `None` on either side means the corresponding sequence sentinel.
    pub fn between(left: Option<Position>, right: Option<Position>) -> Self {
        Self(
            (left.map(|p| p.0).unwrap_or(Position::LOWER)
                + right.map(|p| p.0).unwrap_or(Position::UPPER))
                / 2.0,
        )
    }

    /// Creates a `Position` from a raw `f64` value
    ///
    /// Returns `None` if the value is outside the valid range.
    pub fn from_raw(value: f64) -> Option<Position> {
        (Position::LOWER..=Position::UPPER)
            .contains(&value)
            .then_some(Self(value))
    }

    /// Returns the raw `f64` value of the position
    pub fn as_raw(&self) -> f64 {
        self.0
    }
}
