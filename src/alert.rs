//! Threshold and event driven notices for dashboard consumption.
//!
//! Alerts are raised by whichever component observes a breach; dispatch
//! to users happens elsewhere. Duplicate alerts for repeated breaches are
//! acceptable, so `raise` makes no idempotency promise. The only
//! mutations after creation are `mark_read` and `archive`.

use crate::error::LedgerError;
use crate::types::{EntityType, TimeStamp};
use crate::utils;
use chrono::Utc;
use std::sync::Arc;

const ALERT_TREE: &str = "alerts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AlertType {
    #[n(0)]
    CriticalShortage,
    #[n(1)]
    LowStock,
    #[n(2)]
    DelayedEmergency,
    #[n(3)]
    NgoFallbackTriggered,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::CriticalShortage => "CRITICAL_SHORTAGE",
            AlertType::LowStock => "LOW_STOCK",
            AlertType::DelayedEmergency => "DELAYED_EMERGENCY",
            AlertType::NgoFallbackTriggered => "NGO_FALLBACK_TRIGGERED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Severity {
    #[n(0)]
    Low,
    #[n(1)]
    Medium,
    #[n(2)]
    High,
    #[n(3)]
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AlertStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Archived,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Alert {
    #[n(0)]
    pub alert_id: String,
    #[n(1)]
    pub alert_type: AlertType,
    #[n(2)]
    pub severity: Severity,
    #[n(3)]
    pub entity_type: EntityType,
    #[n(4)]
    pub entity_id: String,
    #[n(5)]
    pub message: String,
    #[n(6)]
    pub is_read: bool,
    #[n(7)]
    pub status: AlertStatus,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
}

/// Counts exposed to the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertSummary {
    pub total_active: usize,
    pub unread: usize,
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
}

#[derive(Clone)]
pub struct AlertEngine {
    tree: sled::Tree,
}

impl AlertEngine {
    pub fn new(db: Arc<sled::Db>) -> anyhow::Result<Self> {
        let tree = db.open_tree(ALERT_TREE)?;
        Ok(Self { tree })
    }

    pub fn raise(
        &self,
        alert_type: AlertType,
        severity: Severity,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        message: impl Into<String>,
    ) -> anyhow::Result<Alert> {
        let alert = Alert {
            alert_id: utils::new_uuid_to_bech32("alert")?,
            alert_type,
            severity,
            entity_type,
            entity_id: entity_id.into(),
            message: message.into(),
            is_read: false,
            status: AlertStatus::Active,
            created_at: TimeStamp::new(),
        };
        self.tree
            .insert(alert.alert_id.as_bytes(), minicbor::to_vec(&alert)?)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        tracing::info!(
            alert_id = %alert.alert_id,
            kind = alert.alert_type.as_str(),
            entity = %alert.entity_id,
            "alert raised"
        );
        Ok(alert)
    }

    pub fn mark_read(&self, alert_id: &str) -> anyhow::Result<Alert> {
        self.update(alert_id, |alert| alert.is_read = true)
    }

    pub fn archive(&self, alert_id: &str) -> anyhow::Result<Alert> {
        self.update(alert_id, |alert| alert.status = AlertStatus::Archived)
    }

    fn update(&self, alert_id: &str, apply: impl FnOnce(&mut Alert)) -> anyhow::Result<Alert> {
        let bytes = self
            .tree
            .get(alert_id.as_bytes())
            .map_err(|e| LedgerError::Storage(e.to_string()))?
            .ok_or_else(|| LedgerError::NotFound {
                entity: "alert",
                id: alert_id.to_string(),
            })?;
        let mut alert: Alert = minicbor::decode(&bytes)?;
        apply(&mut alert);
        self.tree
            .insert(alert_id.as_bytes(), minicbor::to_vec(&alert)?)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(alert)
    }

    pub fn unread_count(&self) -> anyhow::Result<usize> {
        Ok(self.summary()?.unread)
    }

    /// Count alerts of a given type, read or not, active or archived.
    pub fn count_of_type(&self, alert_type: AlertType) -> anyhow::Result<usize> {
        let mut count = 0;
        for item in self.tree.iter() {
            let (_, value) = item.map_err(|e| LedgerError::Storage(e.to_string()))?;
            let alert: Alert = minicbor::decode(&value)?;
            if alert.alert_type == alert_type {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Active alert counts by severity plus the unread total.
    pub fn summary(&self) -> anyhow::Result<AlertSummary> {
        let mut summary = AlertSummary::default();
        for item in self.tree.iter() {
            let (_, value) = item.map_err(|e| LedgerError::Storage(e.to_string()))?;
            let alert: Alert = minicbor::decode(&value)?;
            if alert.status != AlertStatus::Active {
                continue;
            }
            summary.total_active += 1;
            if !alert.is_read {
                summary.unread += 1;
            }
            match alert.severity {
                Severity::Low => summary.low += 1,
                Severity::Medium => summary.medium += 1,
                Severity::High => summary.high += 1,
                Severity::Critical => summary.critical += 1,
            }
        }
        Ok(summary)
    }
}
