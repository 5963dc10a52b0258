//! Blood bank records and the admin lifecycle that verifies them.
//!
//! A bank document embeds its entire stock table plus cumulative
//! statistics, so every stock or stats change is a single-document
//! compare-and-swap and a snapshot can never observe a torn write.

use crate::audit::{AuditEntry, AuditLedger, AuditStatus, ChangeSet};
use crate::error::LedgerError;
use crate::types::{Actor, BloodGroup, EntityType, TimeStamp};
use chrono::Utc;
use std::sync::Arc;

pub(crate) const BANK_TREE: &str = "banks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum BankStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Verified,
    #[n(2)]
    Rejected,
    #[n(3)]
    Suspended,
}

impl BankStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BankStatus::Pending => "PENDING",
            BankStatus::Verified => "VERIFIED",
            BankStatus::Rejected => "REJECTED",
            BankStatus::Suspended => "SUSPENDED",
        }
    }
}

/// Per-group unit counter. Every mutation stamps who touched it last.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct StockRecord {
    #[n(0)]
    pub units_available: u32,
    #[n(1)]
    pub last_updated_at: TimeStamp<Utc>,
    #[n(2)]
    pub last_updated_by: String,
}

/// Fixed eight-entry table indexed by [`BloodGroup`]. A fixed array
/// rules out missing or misspelled group keys entirely.
#[derive(Debug, Clone, PartialEq)]
pub struct StockTable([StockRecord; 8]);

impl StockTable {
    pub fn empty(created_by: &str) -> Self {
        Self(std::array::from_fn(|_| StockRecord {
            units_available: 0,
            last_updated_at: TimeStamp::new(),
            last_updated_by: created_by.to_string(),
        }))
    }

    pub fn get(&self, group: BloodGroup) -> &StockRecord {
        &self.0[group.index()]
    }

    pub fn get_mut(&mut self, group: BloodGroup) -> &mut StockRecord {
        &mut self.0[group.index()]
    }

    pub fn total_units(&self) -> u64 {
        self.0.iter().map(|r| r.units_available as u64).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BloodGroup, &StockRecord)> {
        BloodGroup::ALL.iter().map(|g| (*g, &self.0[g.index()]))
    }
}

impl<C> minicbor::Encode<C> for StockTable {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.array(8)?;
        for record in &self.0 {
            record.encode(e, ctx)?;
        }
        Ok(())
    }
}

impl<'b, C> minicbor::Decode<'b, C> for StockTable {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        ctx: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        let len = d.array()?;
        if len != Some(8) {
            return Err(minicbor::decode::Error::message(
                "stock table must hold exactly eight groups",
            ));
        }
        let mut records = Vec::with_capacity(8);
        for _ in 0..8 {
            records.push(StockRecord::decode(d, ctx)?);
        }
        records
            .try_into()
            .map(StockTable)
            .map_err(|_| minicbor::decode::Error::message("stock table length mismatch"))
    }
}

/// Durable bank document, keyed by its organization code (e.g. `BB-001`).
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct BloodBank {
    #[n(0)]
    pub code: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub location: String,
    #[n(3)]
    pub status: BankStatus,
    #[n(4)]
    pub stock: StockTable,
    #[n(5)]
    pub total_units_issued: u64,
    #[n(6)]
    pub total_requests_fulfilled: u64,
    #[n(7)]
    pub total_ngo_drives_supported: u64,
    #[n(8)]
    pub total_donations_received: u64,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
}

/// Read the bank document together with its raw bytes, the expected
/// "old" value for a subsequent compare-and-swap.
pub(crate) fn load_bank(
    tree: &sled::Tree,
    code: &str,
) -> anyhow::Result<(sled::IVec, BloodBank)> {
    let bytes = tree
        .get(code.as_bytes())
        .map_err(|e| LedgerError::Storage(e.to_string()))?
        .ok_or_else(|| LedgerError::NotFound {
            entity: "blood bank",
            id: code.to_string(),
        })?;
    let bank: BloodBank = minicbor::decode(&bytes)?;
    Ok((bytes, bank))
}

/// Single conditional write of the bank document. Returns `false` when a
/// concurrent writer got there first and the caller must re-read.
pub(crate) fn store_bank_cas(
    tree: &sled::Tree,
    code: &str,
    old: &sled::IVec,
    bank: &BloodBank,
) -> anyhow::Result<bool> {
    let new = minicbor::to_vec(bank)?;
    let swap = tree
        .compare_and_swap(code.as_bytes(), Some(old), Some(new))
        .map_err(|e| LedgerError::Storage(e.to_string()))?;
    Ok(swap.is_ok())
}

/// Admin-facing lifecycle of bank organizations. Registration lands a
/// bank in PENDING; only the approval actions here move it on, and each
/// action writes exactly one audit entry.
#[derive(Clone)]
pub struct BankDirectory {
    banks: sled::Tree,
    audit: AuditLedger,
}

impl BankDirectory {
    pub fn new(db: Arc<sled::Db>, audit: AuditLedger) -> anyhow::Result<Self> {
        let banks = db.open_tree(BANK_TREE)?;
        Ok(Self { banks, audit })
    }

    pub fn register(
        &self,
        code: &str,
        name: &str,
        location: &str,
        actor: &Actor,
    ) -> anyhow::Result<BloodBank> {
        if code.trim().is_empty() {
            return Err(LedgerError::Validation("bank code must not be empty".into()).into());
        }
        let bank = BloodBank {
            code: code.to_string(),
            name: name.to_string(),
            location: location.to_string(),
            status: BankStatus::Pending,
            stock: StockTable::empty(&actor.id),
            total_units_issued: 0,
            total_requests_fulfilled: 0,
            total_ngo_drives_supported: 0,
            total_donations_received: 0,
            created_at: TimeStamp::new(),
        };

        let encoded = minicbor::to_vec(&bank)?;
        // None as the expected old value makes duplicate registration a
        // clean conflict instead of an overwrite.
        let swap = self
            .banks
            .compare_and_swap(code.as_bytes(), None as Option<&[u8]>, Some(encoded))
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        if swap.is_err() {
            return Err(
                LedgerError::Validation(format!("bank code already registered: {code}")).into(),
            );
        }

        self.audit.append(AuditEntry::new(
            EntityType::BloodBank,
            code,
            "REGISTER",
            actor,
            ChangeSet::created(BankStatus::Pending.as_str()),
            AuditStatus::Success,
            format!("bank {name} registered at {location}"),
        ))?;
        tracing::info!(bank = code, "bank registered");
        Ok(bank)
    }

    pub fn verify(&self, code: &str, actor: &Actor) -> anyhow::Result<BloodBank> {
        self.transition(code, actor, "VERIFY", BankStatus::Verified, &[
            BankStatus::Pending,
            BankStatus::Suspended,
        ])
    }

    pub fn reject(&self, code: &str, actor: &Actor) -> anyhow::Result<BloodBank> {
        self.transition(code, actor, "REJECT", BankStatus::Rejected, &[
            BankStatus::Pending,
        ])
    }

    pub fn suspend(&self, code: &str, actor: &Actor) -> anyhow::Result<BloodBank> {
        self.transition(code, actor, "SUSPEND", BankStatus::Suspended, &[
            BankStatus::Verified,
        ])
    }

    fn transition(
        &self,
        code: &str,
        actor: &Actor,
        action: &str,
        to: BankStatus,
        allowed_from: &[BankStatus],
    ) -> anyhow::Result<BloodBank> {
        let (old, mut bank) = load_bank(&self.banks, code)?;
        let from = bank.status;
        if !allowed_from.contains(&from) {
            self.audit.append(AuditEntry::new(
                EntityType::BloodBank,
                code,
                action,
                actor,
                ChangeSet::default(),
                AuditStatus::Failure,
                format!("{action} refused in status {}", from.as_str()),
            ))?;
            return Err(LedgerError::Precondition(format!(
                "bank {code} is {}, cannot {action}",
                from.as_str()
            ))
            .into());
        }

        bank.status = to;
        if !store_bank_cas(&self.banks, code, &old, &bank)? {
            return Err(
                LedgerError::Precondition(format!("bank {code} was concurrently modified")).into(),
            );
        }

        self.audit.append(AuditEntry::new(
            EntityType::BloodBank,
            code,
            action,
            actor,
            ChangeSet::transition(from.as_str(), to.as_str()),
            AuditStatus::Success,
            format!("bank status {} -> {}", from.as_str(), to.as_str()),
        ))?;
        tracing::info!(bank = code, from = from.as_str(), to = to.as_str(), "bank status changed");
        Ok(bank)
    }

    pub fn get(&self, code: &str) -> anyhow::Result<BloodBank> {
        Ok(load_bank(&self.banks, code)?.1)
    }

    /// The "verified organization" existence check consumed by the
    /// request and drive machines.
    pub fn is_verified(&self, code: &str) -> anyhow::Result<bool> {
        match self.banks.get(code.as_bytes()) {
            Ok(Some(bytes)) => {
                let bank: BloodBank = minicbor::decode(&bytes)?;
                Ok(bank.status == BankStatus::Verified)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(LedgerError::Storage(e.to_string()).into()),
        }
    }
}
