//! Interval algebra for keystream byte ranges
//!
//! Half-open `[start, end)` ranges tagged by conversation. All byte-range
//! arithmetic in the crate lives here; extension and consumption are the only
//! two ways an interval ever changes. Operators are total on their
//! preconditions and fail with `Error::InvalidInterval` otherwise.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ConversationId;

/// Half-open byte range `[start, end)` of one conversation's keystream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    #[serde(rename = "conversationId")]
    pub conversation_id: ConversationId,
    #[serde(rename = "startIndex")]
    pub start: u64,
    #[serde(rename = "endIndex")]
    pub end: u64,
}

impl Interval {
    /// Build an interval, checking `start <= end`
    pub fn new(conversation_id: impl Into<ConversationId>, start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidInterval(format!(
                "start {} exceeds end {}",
                start, end
            )));
        }
        Ok(Self {
            conversation_id: conversation_id.into(),
            start,
            end,
        })
    }

    /// The empty interval `[0, 0)`
    pub fn empty(conversation_id: impl Into<ConversationId>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            start: 0,
            end: 0,
        }
    }

    /// The interval `[0, n)`
    pub fn from_length(conversation_id: impl Into<ConversationId>, n: u64) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            start: 0,
            end: n,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// `self + segment`: append an adjoining segment at the end
    pub fn extend(&self, segment: &Interval) -> Result<Interval> {
        self.check_same_conversation(segment)?;
        if segment.start != self.end {
            return Err(Error::InvalidInterval(format!(
                "extension segment {} does not adjoin {}",
                segment, self
            )));
        }
        Interval::new(self.conversation_id.clone(), self.start, segment.end)
    }

    /// `self - segment`: remove an adjoining segment from the start
    pub fn consume(&self, segment: &Interval) -> Result<Interval> {
        self.check_same_conversation(segment)?;
        if segment.start != self.start {
            return Err(Error::InvalidInterval(format!(
                "consumption segment {} does not start at {}",
                segment, self
            )));
        }
        if segment.end > self.end {
            return Err(Error::InvalidInterval(format!(
                "consumption segment {} over-consumes {}",
                segment, self
            )));
        }
        Interval::new(self.conversation_id.clone(), segment.end, self.end)
    }

    /// The head segment of `n` bytes, suitable as a `consume` operand
    pub fn consume_segment(&self, n: u64) -> Result<Interval> {
        if n > self.len() {
            return Err(Error::InvalidInterval(format!(
                "cannot take {} bytes from {}",
                n, self
            )));
        }
        Interval::new(self.conversation_id.clone(), self.start, self.start + n)
    }

    /// The adjoining segment of `n` bytes past the end, suitable as an `extend` operand
    pub fn extend_segment(&self, n: u64) -> Interval {
        Self {
            conversation_id: self.conversation_id.clone(),
            start: self.end,
            end: self.end + n,
        }
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.conversation_id == other.conversation_id
            && self.start <= other.start
            && other.end <= self.end
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.conversation_id == other.conversation_id
            && self.start < other.end
            && other.start < self.end
    }

    fn check_same_conversation(&self, other: &Interval) -> Result<()> {
        if self.conversation_id != other.conversation_id {
            return Err(Error::InvalidInterval(format!(
                "conversation mismatch: {} vs {}",
                self.conversation_id, other.conversation_id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iv(start: u64, end: u64) -> Interval {
        Interval::new("conv", start, end).unwrap()
    }

    #[test]
    fn test_construction() {
        assert!(Interval::new("conv", 5, 3).is_err());
        assert_eq!(Interval::empty("conv").len(), 0);
        assert_eq!(Interval::from_length("conv", 42).len(), 42);
    }

    #[test]
    fn test_extend_and_consume() {
        let base = iv(0, 100);
        let extended = base.extend(&iv(100, 150)).unwrap();
        assert_eq!(extended, iv(0, 150));

        let consumed = extended.consume(&iv(0, 30)).unwrap();
        assert_eq!(consumed, iv(30, 150));

        // non-adjoining operands fail
        assert!(base.extend(&iv(101, 150)).is_err());
        assert!(base.consume(&iv(1, 10)).is_err());
        // over-consumption fails
        assert!(base.consume(&iv(0, 101)).is_err());
    }

    #[test]
    fn test_algebra_laws() {
        // (I + S) - S' = I' where S' is the head of the extension
        let i = iv(10, 50);
        let s = i.extend_segment(20);
        let grown = i.extend(&s).unwrap();
        assert_eq!(grown, iv(10, 70));

        let head = grown.consume_segment(40).unwrap();
        let rest = grown.consume(&head).unwrap();
        assert_eq!(rest, iv(50, 70));
    }

    #[test]
    fn test_conversation_mismatch() {
        let a = Interval::new("a", 0, 10).unwrap();
        let b = Interval::new("b", 10, 20).unwrap();
        assert!(matches!(a.extend(&b), Err(Error::InvalidInterval(_))));
    }

    #[test]
    fn test_contains_overlaps() {
        let outer = iv(0, 100);
        assert!(outer.contains(&iv(10, 20)));
        assert!(outer.contains(&outer.clone()));
        assert!(!outer.contains(&iv(90, 110)));

        assert!(iv(0, 10).overlaps(&iv(9, 20)));
        assert!(!iv(0, 10).overlaps(&iv(10, 20)));

        let other = Interval::new("other", 0, 100).unwrap();
        assert!(!outer.contains(&other));
        assert!(!outer.overlaps(&other));
    }

    #[test]
    fn test_consume_segment_bounds() {
        let i = iv(5, 15);
        assert_eq!(i.consume_segment(10).unwrap(), iv(5, 15));
        assert!(i.consume_segment(11).is_err());
        assert_eq!(i.extend_segment(5), iv(15, 20));
    }
}
