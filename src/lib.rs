//! Blood resource allocation and audit ledger.
//!
//! Tracks a blood bank's per-group unit inventory, runs hospital
//! requests and NGO donation drives through their approval/fulfillment
//! lifecycles, and records every state transition in an append-only
//! audit trail that also drives threshold alerts. Authentication,
//! registration approval and notification dispatch live with the
//! surrounding application; this crate only consumes an actor identity
//! for attribution and a verified-bank fact for assignment.

pub mod alert;
pub mod audit;
pub mod bank;
pub mod config;
pub mod drive;
pub mod error;
pub mod gate;
pub mod request;
pub mod stock;
pub mod types;
pub mod utils;

use std::sync::Arc;

use alert::AlertEngine;
use audit::AuditLedger;
use bank::BankDirectory;
use config::LedgerConfig;
use drive::DriveService;
use request::RequestService;
use stock::StockLedger;

/// Convenience bundle wiring every component over one sled database.
/// Components share the audit ledger and alert engine; callers that
/// want finer control can construct the services individually.
#[derive(Clone)]
pub struct Ledger {
    pub banks: BankDirectory,
    pub stock: StockLedger,
    pub requests: RequestService,
    pub drives: DriveService,
    pub audit: AuditLedger,
    pub alerts: AlertEngine,
}

impl Ledger {
    pub fn open(db: Arc<sled::Db>, config: LedgerConfig) -> anyhow::Result<Self> {
        let audit = AuditLedger::new(db.clone())?;
        let alerts = AlertEngine::new(db.clone())?;
        let banks = BankDirectory::new(db.clone(), audit.clone())?;
        let stock = StockLedger::new(db.clone(), audit.clone(), alerts.clone(), config.clone())?;
        let requests = RequestService::new(
            db.clone(),
            stock.clone(),
            audit.clone(),
            alerts.clone(),
            config.clone(),
        )?;
        let drives = DriveService::new(db, stock.clone(), audit.clone())?;
        Ok(Self {
            banks,
            stock,
            requests,
            drives,
            audit,
            alerts,
        })
    }
}
