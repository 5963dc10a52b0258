//! Atomic per-bank, per-group unit accounting.
//!
//! `adjust` is the only write path for stock anywhere in the crate; both
//! state machines go through it. The counter lives inside the bank
//! document, so the read-modify-write is one conditional update: the
//! guard re-checks the balance on every retry and a would-go-negative
//! outcome aborts with no partial write.

use crate::alert::{AlertEngine, AlertType, Severity};
use crate::audit::{AuditEntry, AuditLedger, AuditStatus, ChangeSet};
use crate::bank::{load_bank, store_bank_cas, BANK_TREE};
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::types::{stock_status, Actor, BloodGroup, EntityType, StockStatus, TimeStamp};
use std::sync::Arc;

/// Point-in-time view of one bank's counters. Derived from a single
/// document read, so it can never mix values from two concurrent adjusts.
#[derive(Debug, Clone, PartialEq)]
pub struct StockSnapshot {
    pub bank_code: String,
    pub groups: [GroupSnapshot; 8],
    pub total_units_available: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSnapshot {
    pub group: BloodGroup,
    pub units_available: u32,
    pub status: StockStatus,
}

#[derive(Clone)]
pub struct StockLedger {
    banks: sled::Tree,
    audit: AuditLedger,
    alerts: AlertEngine,
    config: LedgerConfig,
}

impl StockLedger {
    pub fn new(
        db: Arc<sled::Db>,
        audit: AuditLedger,
        alerts: AlertEngine,
        config: LedgerConfig,
    ) -> anyhow::Result<Self> {
        let banks = db.open_tree(BANK_TREE)?;
        Ok(Self {
            banks,
            audit,
            alerts,
            config,
        })
    }

    /// Apply `delta` (negative for issue, positive for credit) to one
    /// group's counter. Linearized against concurrent adjusts by the
    /// compare-and-swap loop; returns the post-adjust unit count.
    pub fn adjust(
        &self,
        bank_code: &str,
        group: BloodGroup,
        delta: i64,
        actor: &Actor,
    ) -> anyhow::Result<u32> {
        if delta == 0 {
            return Err(LedgerError::Validation("adjust delta must be non-zero".into()).into());
        }
        let stock_id = format!("{bank_code}/{group}");

        loop {
            let (old, mut bank) = load_bank(&self.banks, bank_code)?;
            let current = bank.stock.get(group).units_available;
            let next = current as i64 + delta;

            if next < 0 {
                self.audit.append(AuditEntry::new(
                    EntityType::BloodStock,
                    &stock_id,
                    "ADJUST",
                    actor,
                    ChangeSet::default(),
                    AuditStatus::Failure,
                    format!("adjust by {delta} refused: only {current} units available"),
                ))?;
                return Err(LedgerError::InsufficientStock {
                    bank_code: bank_code.to_string(),
                    group,
                    available: current,
                    requested: (-delta) as u32,
                }
                .into());
            }
            if next > u32::MAX as i64 {
                self.audit.append(AuditEntry::new(
                    EntityType::BloodStock,
                    &stock_id,
                    "ADJUST",
                    actor,
                    ChangeSet::default(),
                    AuditStatus::Failure,
                    format!("adjust by {delta} refused: counter overflow"),
                ))?;
                return Err(LedgerError::Validation(format!(
                    "adjust by {delta} would overflow the {group} counter"
                ))
                .into());
            }

            let record = bank.stock.get_mut(group);
            record.units_available = next as u32;
            record.last_updated_at = TimeStamp::new();
            record.last_updated_by = actor.id.clone();

            if store_bank_cas(&self.banks, bank_code, &old, &bank)? {
                let new_units = next as u32;
                self.audit.append(AuditEntry::new(
                    EntityType::BloodStock,
                    &stock_id,
                    "ADJUST",
                    actor,
                    ChangeSet::transition(current.to_string(), new_units.to_string()),
                    AuditStatus::Success,
                    format!("stock adjusted by {delta}"),
                ))?;
                tracing::debug!(
                    bank = bank_code,
                    group = group.as_str(),
                    delta,
                    new_units,
                    "stock adjusted"
                );
                // The adjust is already committed and audited at this
                // point. Threshold alerting is advisory, so a failure
                // to raise one must not read as a failed adjust and
                // trigger a caller's rollback of a debit that landed.
                if let Err(err) = self.evaluate_thresholds(bank_code, group, new_units) {
                    tracing::warn!(
                        bank = bank_code,
                        group = group.as_str(),
                        %err,
                        "threshold alert could not be raised"
                    );
                }
                return Ok(new_units);
            }
            // Lost the race against another adjust on this bank;
            // re-read and re-check the guard.
        }
    }

    fn evaluate_thresholds(
        &self,
        bank_code: &str,
        group: BloodGroup,
        units: u32,
    ) -> anyhow::Result<()> {
        let stock_id = format!("{bank_code}/{group}");
        if units < self.config.critical_threshold {
            self.alerts.raise(
                AlertType::CriticalShortage,
                Severity::Critical,
                EntityType::BloodStock,
                stock_id,
                format!("{group} stock at bank {bank_code} down to {units} units"),
            )?;
        } else if units < self.config.low_threshold {
            self.alerts.raise(
                AlertType::LowStock,
                Severity::Medium,
                EntityType::BloodStock,
                stock_id,
                format!("{group} stock at bank {bank_code} low: {units} units"),
            )?;
        }
        Ok(())
    }

    /// All eight counters plus the derived total, from one read.
    pub fn snapshot(&self, bank_code: &str) -> anyhow::Result<StockSnapshot> {
        let (_, bank) = load_bank(&self.banks, bank_code)?;
        let groups = std::array::from_fn(|i| {
            let group = BloodGroup::ALL[i];
            let units = bank.stock.get(group).units_available;
            GroupSnapshot {
                group,
                units_available: units,
                status: stock_status(units),
            }
        });
        Ok(StockSnapshot {
            bank_code: bank_code.to_string(),
            groups,
            total_units_available: bank.stock.total_units(),
        })
    }

    /// Units currently on hand for one group.
    pub fn units_available(&self, bank_code: &str, group: BloodGroup) -> anyhow::Result<u32> {
        let (_, bank) = load_bank(&self.banks, bank_code)?;
        Ok(bank.stock.get(group).units_available)
    }
}
