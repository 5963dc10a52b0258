//! Shared approval policy consulted before any transition out of the
//! initial state.

use crate::types::Urgency;

/// Pure decision object; no side effects, no storage access.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApprovalGate;

impl ApprovalGate {
    /// CRITICAL requests skip the normal hospital-to-bank negotiation
    /// but an explicit admin approval record is still required before
    /// stock moves; emergency speed does not remove accountability.
    /// Other urgencies negotiate directly without an admin gate.
    pub fn request_requires_admin(&self, urgency: Urgency) -> bool {
        matches!(urgency, Urgency::Critical)
    }

    /// Every donation drive needs an admin sign-off before it may start.
    pub fn drive_requires_admin(&self) -> bool {
        true
    }
}
