//! NGO donation drive lifecycle.
//!
//! Collections accumulate inside the drive document while it is ONGOING
//! and only reach the stock ledger at `complete`, so an abandoned drive
//! can never inflate inventory. Completion credits every collected group
//! as an all-or-nothing batch: if any credit fails the ones already
//! applied are reversed and the drive stays ONGOING.

use crate::audit::{AuditEntry, AuditLedger, AuditStatus, ChangeSet};
use crate::bank::{load_bank, store_bank_cas, BankStatus, BANK_TREE};
use crate::error::LedgerError;
use crate::gate::ApprovalGate;
use crate::stock::StockLedger;
use crate::types::{Actor, BloodGroup, EntityType, TimeStamp};
use crate::utils;
use chrono::Utc;
use std::sync::Arc;

const DRIVE_TREE: &str = "drives";

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum DriveStatus {
    #[n(0)]
    Planned,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Ongoing,
    #[n(4)]
    Completed,
    #[n(5)]
    Cancelled,
}

impl DriveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DriveStatus::Planned => "PLANNED",
            DriveStatus::Approved => "APPROVED",
            DriveStatus::Rejected => "REJECTED",
            DriveStatus::Ongoing => "ONGOING",
            DriveStatus::Completed => "COMPLETED",
            DriveStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DriveStatus::Completed | DriveStatus::Rejected | DriveStatus::Cancelled
        )
    }
}

/// Units collected per group during the drive, fixed eight slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedUnits([u32; 8]);

impl CollectedUnits {
    pub fn get(&self, group: BloodGroup) -> u32 {
        self.0[group.index()]
    }

    pub fn add(&mut self, group: BloodGroup, units: u32) {
        self.0[group.index()] += units;
    }

    pub fn total(&self) -> u64 {
        self.0.iter().map(|u| *u as u64).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BloodGroup, u32)> + '_ {
        BloodGroup::ALL.iter().map(|g| (*g, self.0[g.index()]))
    }
}

impl<C> minicbor::Encode<C> for CollectedUnits {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.array(8)?;
        for units in &self.0 {
            e.u32(*units)?;
        }
        Ok(())
    }
}

impl<'b, C> minicbor::Decode<'b, C> for CollectedUnits {
    fn decode(
        d: &mut minicbor::Decoder<'b>,
        _: &mut C,
    ) -> Result<Self, minicbor::decode::Error> {
        let len = d.array()?;
        if len != Some(8) {
            return Err(minicbor::decode::Error::message(
                "collected units must hold exactly eight groups",
            ));
        }
        let mut units = [0u32; 8];
        for slot in &mut units {
            *slot = d.u32()?;
        }
        Ok(CollectedUnits(units))
    }
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct DonationDrive {
    #[n(0)]
    pub drive_id: String,
    #[n(1)]
    pub bank_code: String,
    #[n(2)]
    pub ngo_id: String,
    #[n(3)]
    pub status: DriveStatus,
    #[n(4)]
    pub collected: CollectedUnits,
    #[n(5)]
    pub total_donors_participated: u32,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
    #[n(7)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub started_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub closed_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub closed_reason: Option<String>,
}

impl DonationDrive {
    /// Derived sum over the per-group tallies.
    pub fn total_units_collected(&self) -> u64 {
        self.collected.total()
    }
}

#[derive(Clone)]
pub struct DriveService {
    drives: sled::Tree,
    banks: sled::Tree,
    stock: StockLedger,
    audit: AuditLedger,
    gate: ApprovalGate,
}

impl DriveService {
    pub fn new(
        db: Arc<sled::Db>,
        stock: StockLedger,
        audit: AuditLedger,
    ) -> anyhow::Result<Self> {
        let drives = db.open_tree(DRIVE_TREE)?;
        let banks = db.open_tree(BANK_TREE)?;
        Ok(Self {
            drives,
            banks,
            stock,
            audit,
            gate: ApprovalGate,
        })
    }

    fn load(&self, drive_id: &str) -> anyhow::Result<(sled::IVec, DonationDrive)> {
        let bytes = self
            .drives
            .get(drive_id.as_bytes())
            .map_err(|e| LedgerError::Storage(e.to_string()))?
            .ok_or_else(|| LedgerError::NotFound {
                entity: "donation drive",
                id: drive_id.to_string(),
            })?;
        let drive: DonationDrive = minicbor::decode(&bytes)?;
        Ok((bytes, drive))
    }

    fn store_cas(&self, old: &sled::IVec, drive: &DonationDrive) -> anyhow::Result<bool> {
        let new = minicbor::to_vec(drive)?;
        let swap = self
            .drives
            .compare_and_swap(drive.drive_id.as_bytes(), Some(old), Some(new))
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(swap.is_ok())
    }

    fn audit_drive(
        &self,
        drive_id: &str,
        action: &str,
        actor: &Actor,
        changes: ChangeSet,
        status: AuditStatus,
        description: String,
    ) -> anyhow::Result<()> {
        self.audit.append(AuditEntry::new(
            EntityType::DonationDrive,
            drive_id,
            action,
            actor,
            changes,
            status,
            description,
        ))?;
        Ok(())
    }

    fn precondition_failure<T>(
        &self,
        drive_id: &str,
        action: &str,
        actor: &Actor,
        detail: String,
    ) -> anyhow::Result<T> {
        self.audit_drive(
            drive_id,
            action,
            actor,
            ChangeSet::default(),
            AuditStatus::Failure,
            detail.clone(),
        )?;
        Err(LedgerError::Precondition(detail).into())
    }

    pub fn create(
        &self,
        bank_code: &str,
        ngo_id: &str,
        actor: &Actor,
    ) -> anyhow::Result<DonationDrive> {
        let (_, bank) = load_bank(&self.banks, bank_code)?;
        if bank.status != BankStatus::Verified {
            return Err(
                LedgerError::Validation(format!("bank {bank_code} is not verified")).into(),
            );
        }
        let drive = DonationDrive {
            drive_id: utils::new_uuid_to_bech32("drive")?,
            bank_code: bank_code.to_string(),
            ngo_id: ngo_id.to_string(),
            status: DriveStatus::Planned,
            collected: CollectedUnits::default(),
            total_donors_participated: 0,
            created_at: TimeStamp::new(),
            approved_at: None,
            started_at: None,
            closed_at: None,
            closed_reason: None,
        };
        self.drives
            .insert(drive.drive_id.as_bytes(), minicbor::to_vec(&drive)?)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        self.audit_drive(
            &drive.drive_id,
            "CREATE",
            actor,
            ChangeSet::created(DriveStatus::Planned.as_str()),
            AuditStatus::Success,
            format!("drive planned by NGO {ngo_id} for bank {bank_code}"),
        )?;
        tracing::info!(drive = %drive.drive_id, bank = bank_code, "drive planned");
        Ok(drive)
    }

    pub fn approve(&self, drive_id: &str, actor: &Actor) -> anyhow::Result<DonationDrive> {
        // Gate check is nominally redundant (drives always need admin
        // sign-off) but keeps the policy in one place.
        debug_assert!(self.gate.drive_requires_admin());
        let (old, mut drive) = self.load(drive_id)?;
        let from = drive.status;
        if from != DriveStatus::Planned {
            return self.precondition_failure(
                drive_id,
                "APPROVE",
                actor,
                format!("drive {drive_id} is {}, cannot approve", from.as_str()),
            );
        }
        drive.status = DriveStatus::Approved;
        drive.approved_at = Some(TimeStamp::new());
        self.commit_transition(old, drive, from, "APPROVE", actor, None)
    }

    pub fn reject(
        &self,
        drive_id: &str,
        reason: &str,
        actor: &Actor,
    ) -> anyhow::Result<DonationDrive> {
        let (old, mut drive) = self.load(drive_id)?;
        let from = drive.status;
        if from != DriveStatus::Planned {
            return self.precondition_failure(
                drive_id,
                "REJECT",
                actor,
                format!("drive {drive_id} is {}, cannot reject", from.as_str()),
            );
        }
        if reason.trim().is_empty() {
            self.audit_drive(
                drive_id,
                "REJECT",
                actor,
                ChangeSet::default(),
                AuditStatus::Failure,
                "reject refused: a reason is required".into(),
            )?;
            return Err(
                LedgerError::Validation("a non-empty reason is required to reject".into()).into(),
            );
        }
        drive.status = DriveStatus::Rejected;
        drive.closed_at = Some(TimeStamp::new());
        drive.closed_reason = Some(reason.to_string());
        self.commit_transition(old, drive, from, "REJECT", actor, Some(reason.to_string()))
    }

    pub fn start(&self, drive_id: &str, actor: &Actor) -> anyhow::Result<DonationDrive> {
        let (old, mut drive) = self.load(drive_id)?;
        let from = drive.status;
        if from != DriveStatus::Approved {
            return self.precondition_failure(
                drive_id,
                "START",
                actor,
                format!("drive {drive_id} is {}, cannot start", from.as_str()),
            );
        }
        drive.status = DriveStatus::Ongoing;
        drive.started_at = Some(TimeStamp::new());
        self.commit_transition(old, drive, from, "START", actor, None)
    }

    /// Tally units collected at the drive. Repeatable while ONGOING and
    /// deliberately does not touch the stock ledger.
    pub fn record_collection(
        &self,
        drive_id: &str,
        group: BloodGroup,
        units: u32,
        actor: &Actor,
    ) -> anyhow::Result<DonationDrive> {
        if units == 0 {
            return Err(
                LedgerError::Validation("collected units must be positive".into()).into(),
            );
        }
        // Concurrent recorders commute, so retry the swap on contention.
        loop {
            let (old, mut drive) = self.load(drive_id)?;
            if drive.status != DriveStatus::Ongoing {
                return self.precondition_failure(
                    drive_id,
                    "RECORD_COLLECTION",
                    actor,
                    format!(
                        "drive {drive_id} is {}, collections need ONGOING",
                        drive.status.as_str()
                    ),
                );
            }
            let before = drive.collected.get(group);
            drive.collected.add(group, units);
            if self.store_cas(&old, &drive)? {
                self.audit_drive(
                    drive_id,
                    "RECORD_COLLECTION",
                    actor,
                    ChangeSet::transition(before.to_string(), drive.collected.get(group).to_string()),
                    AuditStatus::Success,
                    format!("collected {units} units of {group}"),
                )?;
                return Ok(drive);
            }
        }
    }

    /// Close the drive and credit every collected group to the bank.
    /// The COMPLETED status is claimed first so a concurrent complete
    /// cannot double-credit; if any per-group credit fails, the applied
    /// ones are reversed and the claim is rolled back.
    pub fn complete(
        &self,
        drive_id: &str,
        total_donors_participated: u32,
        actor: &Actor,
    ) -> anyhow::Result<DonationDrive> {
        let (old, original) = self.load(drive_id)?;
        let from = original.status;
        if from != DriveStatus::Ongoing {
            return self.precondition_failure(
                drive_id,
                "COMPLETE",
                actor,
                format!("drive {drive_id} is {}, cannot complete", from.as_str()),
            );
        }

        let mut claimed = original.clone();
        claimed.status = DriveStatus::Completed;
        claimed.total_donors_participated = total_donors_participated;
        claimed.closed_at = Some(TimeStamp::new());

        let claimed_bytes = minicbor::to_vec(&claimed)?;
        let swap = self
            .drives
            .compare_and_swap(drive_id.as_bytes(), Some(&old), Some(claimed_bytes))
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        if swap.is_err() {
            return self.precondition_failure(
                drive_id,
                "COMPLETE",
                actor,
                format!("drive {drive_id} was concurrently modified"),
            );
        }

        let mut applied: Vec<(BloodGroup, u32)> = Vec::new();
        let mut failed: Option<anyhow::Error> = None;
        for (group, units) in original.collected.iter() {
            if units == 0 {
                continue;
            }
            match self
                .stock
                .adjust(&original.bank_code, group, units as i64, actor)
            {
                Ok(_) => applied.push((group, units)),
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failed {
            // Compensate: reverse every credit that did land, undo the
            // status claim so the drive stays ONGOING, and record the
            // attempt. A reversal can itself fail if a concurrent
            // fulfill consumed the credited units in the window; the
            // remaining reversals still run and the failure surfaces
            // only after the claim is undone and the entry written.
            let mut compensation_err: Option<anyhow::Error> = None;
            for (group, units) in applied.into_iter().rev() {
                if let Err(reversal_err) =
                    self.stock
                        .adjust(&original.bank_code, group, -(units as i64), actor)
                {
                    tracing::error!(
                        drive = drive_id,
                        group = group.as_str(),
                        %reversal_err,
                        "credit reversal failed"
                    );
                    if compensation_err.is_none() {
                        compensation_err = Some(reversal_err);
                    }
                }
            }
            let rollback =
                self.rollback_complete_claim(drive_id, original.total_donors_participated);

            self.audit_drive(
                drive_id,
                "COMPLETE",
                actor,
                ChangeSet::default(),
                AuditStatus::Failure,
                format!("batch credit failed and was rolled back: {err}"),
            )?;
            rollback?;

            if let Some(compensation_err) = compensation_err {
                return Err(compensation_err
                    .context("batch credit failed and part of the compensation did not apply"));
            }
            return Err(err);
        }

        let credited = original.total_units_collected();
        loop {
            let (bank_old, mut bank) = load_bank(&self.banks, &original.bank_code)?;
            bank.total_ngo_drives_supported += 1;
            bank.total_donations_received += credited;
            if store_bank_cas(&self.banks, &original.bank_code, &bank_old, &bank)? {
                break;
            }
        }

        self.audit_drive(
            drive_id,
            "COMPLETE",
            actor,
            ChangeSet::transition(from.as_str(), DriveStatus::Completed.as_str()),
            AuditStatus::Success,
            format!(
                "drive completed: {credited} units credited, {total_donors_participated} donors"
            ),
        )?;
        tracing::info!(
            drive = drive_id,
            bank = %original.bank_code,
            units = credited,
            "drive completed"
        );
        Ok(claimed)
    }

    /// Undo a COMPLETED claim after a failed batch credit. Retried
    /// against fresh bytes until the restore lands or the claim is
    /// already gone.
    fn rollback_complete_claim(&self, drive_id: &str, donors_before: u32) -> anyhow::Result<()> {
        loop {
            let bytes = match self
                .drives
                .get(drive_id.as_bytes())
                .map_err(|e| LedgerError::Storage(e.to_string()))?
            {
                Some(bytes) => bytes,
                None => return Ok(()),
            };
            let mut drive: DonationDrive = minicbor::decode(&bytes)?;
            if drive.status != DriveStatus::Completed {
                return Ok(());
            }
            drive.status = DriveStatus::Ongoing;
            drive.total_donors_participated = donors_before;
            drive.closed_at = None;
            if self.store_cas(&bytes, &drive)? {
                return Ok(());
            }
        }
    }

    pub fn cancel(
        &self,
        drive_id: &str,
        reason: &str,
        actor: &Actor,
    ) -> anyhow::Result<DonationDrive> {
        let (old, mut drive) = self.load(drive_id)?;
        let from = drive.status;
        if from.is_terminal() {
            return self.precondition_failure(
                drive_id,
                "CANCEL",
                actor,
                format!("drive {drive_id} is already {}", from.as_str()),
            );
        }
        if reason.trim().is_empty() {
            self.audit_drive(
                drive_id,
                "CANCEL",
                actor,
                ChangeSet::default(),
                AuditStatus::Failure,
                "cancel refused: a reason is required".into(),
            )?;
            return Err(
                LedgerError::Validation("a non-empty reason is required to cancel".into()).into(),
            );
        }
        drive.status = DriveStatus::Cancelled;
        drive.closed_at = Some(TimeStamp::new());
        drive.closed_reason = Some(reason.to_string());
        self.commit_transition(old, drive, from, "CANCEL", actor, Some(reason.to_string()))
    }

    pub fn get(&self, drive_id: &str) -> anyhow::Result<DonationDrive> {
        Ok(self.load(drive_id)?.1)
    }

    fn commit_transition(
        &self,
        old: sled::IVec,
        drive: DonationDrive,
        from: DriveStatus,
        action: &str,
        actor: &Actor,
        detail: Option<String>,
    ) -> anyhow::Result<DonationDrive> {
        if !self.store_cas(&old, &drive)? {
            return self.precondition_failure(
                &drive.drive_id,
                action,
                actor,
                format!("drive {} was concurrently modified", drive.drive_id),
            );
        }
        let description = detail
            .unwrap_or_else(|| format!("status {} -> {}", from.as_str(), drive.status.as_str()));
        self.audit_drive(
            &drive.drive_id,
            action,
            actor,
            ChangeSet::transition(from.as_str(), drive.status.as_str()),
            AuditStatus::Success,
            description,
        )?;
        tracing::info!(
            drive = %drive.drive_id,
            from = from.as_str(),
            to = drive.status.as_str(),
            "drive transition"
        );
        Ok(drive)
    }
}
