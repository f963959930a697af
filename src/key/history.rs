//! Append-only log of keystream extension and consumption operations
//!
//! The history is the audit trail behind the no-reuse guarantee: the current
//! interval is always the `after` of the last operation, consumption segments
//! chain into a contiguous prefix, and `validate` re-derives every transition
//! through the interval algebra.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::interval::Interval;
use crate::utils::now_ms;
use crate::ConversationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Extension,
    Consumption,
}

/// One immutable history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub timestamp: u64,
    pub kind: OperationKind,
    pub segment: Interval,
    pub before: Interval,
    pub after: Interval,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
}

/// Ordered operation log for one conversation's keystream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyHistory {
    conversation_id: ConversationId,
    operations: Vec<Operation>,
}

impl KeyHistory {
    pub fn new(conversation_id: impl Into<ConversationId>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            operations: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Current interval: the `after` of the last operation, or empty
    pub fn current(&self) -> Interval {
        self.operations
            .last()
            .map(|op| op.after.clone())
            .unwrap_or_else(|| Interval::empty(self.conversation_id.clone()))
    }

    /// Absolute offset the log starts at (non-zero for migrated keys)
    pub fn origin(&self) -> u64 {
        self.operations
            .first()
            .map(|op| op.before.start)
            .unwrap_or(0)
    }

    /// Total bytes recorded as consumed
    pub fn consumed_total(&self) -> u64 {
        self.operations
            .iter()
            .filter(|op| op.kind == OperationKind::Consumption)
            .map(|op| op.segment.len())
            .sum()
    }

    /// Append an extension; the segment must adjoin the current end
    pub fn record_extension(
        &mut self,
        segment: Interval,
        reason: impl Into<String>,
        kex_id: Option<String>,
    ) -> Result<()> {
        let before = self.current();
        let after = before.extend(&segment)?;
        self.operations.push(Operation {
            timestamp: now_ms(),
            kind: OperationKind::Extension,
            segment,
            before,
            after,
            reason: reason.into(),
            ref_id: kex_id,
        });
        Ok(())
    }

    /// Seed an empty log with an extension whose `before` sits at `origin`.
    ///
    /// Used for migrated keys whose prior history was lost; the log then
    /// starts mid-stream instead of at byte zero.
    pub fn record_migrated(&mut self, segment: Interval, origin: u64) -> Result<()> {
        if !self.operations.is_empty() {
            return Err(Error::InvalidState(
                "migrated record only seeds an empty history".into(),
            ));
        }
        let before = Interval::new(segment.conversation_id.clone(), origin, origin)?;
        let after = before.extend(&segment)?;
        self.operations.push(Operation {
            timestamp: now_ms(),
            kind: OperationKind::Extension,
            segment,
            before,
            after,
            reason: "migrated".into(),
            ref_id: None,
        });
        Ok(())
    }

    /// Append a consumption; the segment must start at the current start
    pub fn record_consumption(
        &mut self,
        segment: Interval,
        reason: impl Into<String>,
        message_id: Option<String>,
    ) -> Result<()> {
        let before = self.current();
        let after = before.consume(&segment)?;
        self.operations.push(Operation {
            timestamp: now_ms(),
            kind: OperationKind::Consumption,
            segment,
            before,
            after,
            reason: reason.into(),
            ref_id: message_id,
        });
        Ok(())
    }

    /// Walk the log and re-check every transition.
    ///
    /// Consumption contiguity (no gaps, no overlaps, prefix from the origin)
    /// follows from each operation re-deriving `after` through the algebra
    /// and from the `before == previous.after` chain.
    pub fn validate(&self) -> Result<()> {
        let mut state = self
            .operations
            .first()
            .map(|op| op.before.clone())
            .unwrap_or_else(|| Interval::empty(self.conversation_id.clone()));

        for (idx, op) in self.operations.iter().enumerate() {
            if op.before != state {
                return Err(Error::KeyCorrupted(format!(
                    "operation {} expected before {}, log says {}",
                    idx, state, op.before
                )));
            }
            let derived = match op.kind {
                OperationKind::Extension => state.extend(&op.segment)?,
                OperationKind::Consumption => state.consume(&op.segment)?,
            };
            if op.after != derived {
                return Err(Error::KeyCorrupted(format!(
                    "operation {} recorded after {}, algebra derives {}",
                    idx, op.after, derived
                )));
            }
            state = derived;
        }
        Ok(())
    }

    /// Human-readable dump, one line per operation.
    ///
    /// `t_<ms> : key = [s,e) <op> [a,b) by <reason>`
    pub fn format(&self) -> String {
        let mut out = String::new();
        for op in &self.operations {
            let symbol = match op.kind {
                OperationKind::Extension => "+",
                OperationKind::Consumption => "-",
            };
            out.push_str(&format!(
                "t_{} : key = {} {} {} by {}\n",
                op.timestamp, op.before, symbol, op.segment, op.reason
            ));
        }
        out
    }
}
