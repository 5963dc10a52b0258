use chrono::Duration;

/// Tunables consulted by the stock ledger and the delayed-emergency sweep.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Post-adjust unit count below this raises a CRITICAL_SHORTAGE alert.
    pub critical_threshold: u32,
    /// Post-adjust unit count below this (but at or above critical)
    /// raises a LOW_STOCK alert.
    pub low_threshold: u32,
    /// A CRITICAL request still waiting for approval or assignment after
    /// this long triggers a DELAYED_EMERGENCY alert.
    pub delayed_emergency_after: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            critical_threshold: 5,
            low_threshold: 10,
            delayed_emergency_after: Duration::minutes(30),
        }
    }
}
