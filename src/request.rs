//! Hospital blood request lifecycle.
//!
//! A request moves PENDING (or PENDING_ADMIN_APPROVAL when the gate
//! fires) -> APPROVED -> ASSIGNED -> PROCESSING -> FULFILLED, with
//! REJECTED and CANCELLED reachable from any non-terminal state. Every
//! transition is a single compare-and-swap that carries its own status
//! precondition, so a losing writer is rejected whole, never partially
//! applied. Only `fulfill` touches the stock ledger.

use crate::alert::{AlertEngine, AlertType, Severity};
use crate::audit::{AuditEntry, AuditLedger, AuditStatus, ChangeSet};
use crate::bank::{load_bank, store_bank_cas, BankStatus, BANK_TREE};
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::gate::ApprovalGate;
use crate::stock::StockLedger;
use crate::types::{Actor, BloodGroup, EntityType, Role, TimeStamp, Urgency};
use crate::utils;
use chrono::Utc;
use std::sync::Arc;

const REQUEST_TREE: &str = "requests";

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    PendingAdminApproval,
    #[n(2)]
    Approved,
    #[n(3)]
    Assigned,
    #[n(4)]
    Processing,
    #[n(5)]
    Fulfilled,
    #[n(6)]
    Rejected,
    #[n(7)]
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::PendingAdminApproval => "PENDING_ADMIN_APPROVAL",
            RequestStatus::Approved => "APPROVED",
            RequestStatus::Assigned => "ASSIGNED",
            RequestStatus::Processing => "PROCESSING",
            RequestStatus::Fulfilled => "FULFILLED",
            RequestStatus::Rejected => "REJECTED",
            RequestStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Fulfilled | RequestStatus::Rejected | RequestStatus::Cancelled
        )
    }
}

/// One entry of the append-only communication log.
#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct Note {
    #[n(0)]
    pub author: String,
    #[n(1)]
    pub role: Role,
    #[n(2)]
    pub message: String,
    #[n(3)]
    pub at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, minicbor::Encode, minicbor::Decode)]
pub struct HospitalBloodRequest {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    pub hospital_id: String,
    /// Bank code, set by `assign`.
    #[n(2)]
    pub blood_bank: Option<String>,
    #[n(3)]
    pub blood_group: BloodGroup,
    #[n(4)]
    pub units_requested: u32,
    #[n(5)]
    pub urgency: Urgency,
    #[n(6)]
    pub status: RequestStatus,
    #[n(7)]
    pub units_fulfilled: u32,
    #[n(8)]
    pub notes: Vec<Note>,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
    #[n(10)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub assigned_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub processing_at: Option<TimeStamp<Utc>>,
    #[n(13)]
    pub closed_at: Option<TimeStamp<Utc>>,
}

impl HospitalBloodRequest {
    fn push_note(&mut self, actor: &Actor, message: impl Into<String>) {
        self.notes.push(Note {
            author: actor.id.clone(),
            role: actor.role,
            message: message.into(),
            at: TimeStamp::new(),
        });
    }
}

#[derive(Clone)]
pub struct RequestService {
    requests: sled::Tree,
    banks: sled::Tree,
    stock: StockLedger,
    audit: AuditLedger,
    alerts: AlertEngine,
    gate: ApprovalGate,
    config: LedgerConfig,
}

impl RequestService {
    pub fn new(
        db: Arc<sled::Db>,
        stock: StockLedger,
        audit: AuditLedger,
        alerts: AlertEngine,
        config: LedgerConfig,
    ) -> anyhow::Result<Self> {
        let requests = db.open_tree(REQUEST_TREE)?;
        let banks = db.open_tree(BANK_TREE)?;
        Ok(Self {
            requests,
            banks,
            stock,
            audit,
            alerts,
            gate: ApprovalGate,
            config,
        })
    }

    fn load(&self, request_id: &str) -> anyhow::Result<(sled::IVec, HospitalBloodRequest)> {
        let bytes = self
            .requests
            .get(request_id.as_bytes())
            .map_err(|e| LedgerError::Storage(e.to_string()))?
            .ok_or_else(|| LedgerError::NotFound {
                entity: "hospital request",
                id: request_id.to_string(),
            })?;
        let request: HospitalBloodRequest = minicbor::decode(&bytes)?;
        Ok((bytes, request))
    }

    /// Conditional write against the previously read bytes. The status
    /// precondition travels inside `old`, so two racing transitions can
    /// never both land.
    fn store_cas(
        &self,
        old: &sled::IVec,
        request: &HospitalBloodRequest,
    ) -> anyhow::Result<bool> {
        let new = minicbor::to_vec(request)?;
        let swap = self
            .requests
            .compare_and_swap(request.request_id.as_bytes(), Some(old), Some(new))
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(swap.is_ok())
    }

    fn audit_transition(
        &self,
        request_id: &str,
        action: &str,
        actor: &Actor,
        changes: ChangeSet,
        status: AuditStatus,
        description: String,
    ) -> anyhow::Result<()> {
        self.audit.append(AuditEntry::new(
            EntityType::HospitalRequest,
            request_id,
            action,
            actor,
            changes,
            status,
            description,
        ))?;
        Ok(())
    }

    fn precondition_failure(
        &self,
        request: &HospitalBloodRequest,
        action: &str,
        actor: &Actor,
        detail: String,
    ) -> anyhow::Result<HospitalBloodRequest> {
        self.audit_transition(
            &request.request_id,
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
        hospital_id: &str,
        blood_group: BloodGroup,
        units_requested: u32,
        urgency: Urgency,
        actor: &Actor,
    ) -> anyhow::Result<HospitalBloodRequest> {
        if units_requested == 0 {
            return Err(
                LedgerError::Validation("units requested must be positive".into()).into(),
            );
        }
        let status = if self.gate.request_requires_admin(urgency) {
            RequestStatus::PendingAdminApproval
        } else {
            RequestStatus::Pending
        };
        let request = HospitalBloodRequest {
            request_id: utils::new_uuid_to_bech32("req")?,
            hospital_id: hospital_id.to_string(),
            blood_bank: None,
            blood_group,
            units_requested,
            urgency,
            status,
            units_fulfilled: 0,
            notes: vec![],
            created_at: TimeStamp::new(),
            approved_at: None,
            assigned_at: None,
            processing_at: None,
            closed_at: None,
        };
        self.requests
            .insert(request.request_id.as_bytes(), minicbor::to_vec(&request)?)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        self.audit_transition(
            &request.request_id,
            "CREATE",
            actor,
            ChangeSet::created(status.as_str()),
            AuditStatus::Success,
            format!(
                "{} request for {} x{} by hospital {hospital_id}",
                urgency.as_str(),
                blood_group,
                units_requested
            ),
        )?;
        tracing::info!(
            request = %request.request_id,
            urgency = urgency.as_str(),
            group = blood_group.as_str(),
            "request created"
        );
        Ok(request)
    }

    pub fn approve(
        &self,
        request_id: &str,
        actor: &Actor,
    ) -> anyhow::Result<HospitalBloodRequest> {
        let (old, mut request) = self.load(request_id)?;
        let from = request.status;
        if !matches!(
            from,
            RequestStatus::Pending | RequestStatus::PendingAdminApproval
        ) {
            return self.precondition_failure(
                &request,
                "APPROVE",
                actor,
                format!("request {request_id} is {}, cannot approve", from.as_str()),
            );
        }
        request.status = RequestStatus::Approved;
        request.approved_at = Some(TimeStamp::new());
        self.commit_transition(old, request, from, "APPROVE", actor, None)
    }

    pub fn assign(
        &self,
        request_id: &str,
        bank_code: &str,
        actor: &Actor,
    ) -> anyhow::Result<HospitalBloodRequest> {
        let (old, mut request) = self.load(request_id)?;
        let from = request.status;
        if from != RequestStatus::Approved {
            return self.precondition_failure(
                &request,
                "ASSIGN",
                actor,
                format!("request {request_id} is {}, cannot assign", from.as_str()),
            );
        }
        let (_, bank) = load_bank(&self.banks, bank_code)?;
        if bank.status != BankStatus::Verified {
            self.audit_transition(
                request_id,
                "ASSIGN",
                actor,
                ChangeSet::default(),
                AuditStatus::Failure,
                format!("bank {bank_code} is not verified"),
            )?;
            return Err(
                LedgerError::Validation(format!("bank {bank_code} is not verified")).into(),
            );
        }
        request.status = RequestStatus::Assigned;
        request.blood_bank = Some(bank_code.to_string());
        request.assigned_at = Some(TimeStamp::new());
        self.commit_transition(
            old,
            request,
            from,
            "ASSIGN",
            actor,
            Some(format!("assigned to bank {bank_code}")),
        )
    }

    pub fn start_processing(
        &self,
        request_id: &str,
        actor: &Actor,
    ) -> anyhow::Result<HospitalBloodRequest> {
        let (old, mut request) = self.load(request_id)?;
        let from = request.status;
        if from != RequestStatus::Assigned {
            return self.precondition_failure(
                &request,
                "START_PROCESSING",
                actor,
                format!(
                    "request {request_id} is {}, cannot start processing",
                    from.as_str()
                ),
            );
        }
        request.status = RequestStatus::Processing;
        request.processing_at = Some(TimeStamp::new());
        self.commit_transition(old, request, from, "START_PROCESSING", actor, None)
    }

    /// Issue units against the assigned bank's stock and close the
    /// request. The terminal status is claimed first so a concurrent
    /// fulfill cannot double-debit; the claim is rolled back if the
    /// stock debit fails.
    pub fn fulfill(
        &self,
        request_id: &str,
        units_fulfilled: u32,
        batch_info: &str,
        actor: &Actor,
    ) -> anyhow::Result<HospitalBloodRequest> {
        let (old, original) = self.load(request_id)?;
        let from = original.status;
        if from != RequestStatus::Processing {
            return self.precondition_failure(
                &original,
                "FULFILL",
                actor,
                format!("request {request_id} is {}, cannot fulfill", from.as_str()),
            );
        }
        if units_fulfilled == 0 || units_fulfilled > original.units_requested {
            self.audit_transition(
                request_id,
                "FULFILL",
                actor,
                ChangeSet::default(),
                AuditStatus::Failure,
                format!(
                    "invalid fulfilled amount {units_fulfilled} for {} requested",
                    original.units_requested
                ),
            )?;
            return Err(LedgerError::Validation(format!(
                "units fulfilled must be between 1 and {}",
                original.units_requested
            ))
            .into());
        }
        let bank_code = original.blood_bank.clone().ok_or_else(|| {
            LedgerError::Precondition(format!("request {request_id} has no bank assigned"))
        })?;

        let mut claimed = original.clone();
        claimed.status = RequestStatus::Fulfilled;
        claimed.units_fulfilled = units_fulfilled;
        claimed.closed_at = Some(TimeStamp::new());
        claimed.push_note(actor, format!("fulfilled {units_fulfilled} units; {batch_info}"));

        let claimed_bytes = minicbor::to_vec(&claimed)?;
        let swap = self
            .requests
            .compare_and_swap(request_id.as_bytes(), Some(&old), Some(claimed_bytes))
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        if swap.is_err() {
            return self.precondition_failure(
                &original,
                "FULFILL",
                actor,
                format!("request {request_id} was concurrently modified"),
            );
        }

        if let Err(err) =
            self.stock
                .adjust(&bank_code, original.blood_group, -(units_fulfilled as i64), actor)
        {
            // Undo the claim. add_note and purge carry no status
            // precondition, so the claimed bytes may have changed in the
            // window; re-read until the restore lands, keeping any notes
            // that arrived meanwhile. The FAILURE entry is written before
            // a rollback storage error may propagate.
            let rollback = self.rollback_fulfill_claim(request_id, original.notes.len());

            self.audit_transition(
                request_id,
                "FULFILL",
                actor,
                ChangeSet::default(),
                AuditStatus::Failure,
                format!("stock debit failed: {err}"),
            )?;
            rollback?;

            if let Some(LedgerError::InsufficientStock { .. }) =
                err.downcast_ref::<LedgerError>()
            {
                self.alerts.raise(
                    AlertType::NgoFallbackTriggered,
                    Severity::High,
                    EntityType::HospitalRequest,
                    request_id,
                    format!(
                        "bank {bank_code} short of {}; retry with another bank or an NGO drive",
                        original.blood_group
                    ),
                )?;
            }
            return Err(err);
        }

        // Cumulative statistics on the owning bank; increments commute,
        // so the loop just retries on contention.
        loop {
            let (bank_old, mut bank) = load_bank(&self.banks, &bank_code)?;
            bank.total_units_issued += units_fulfilled as u64;
            bank.total_requests_fulfilled += 1;
            if store_bank_cas(&self.banks, &bank_code, &bank_old, &bank)? {
                break;
            }
        }

        self.audit_transition(
            request_id,
            "FULFILL",
            actor,
            ChangeSet::transition(from.as_str(), RequestStatus::Fulfilled.as_str()),
            AuditStatus::Success,
            format!("fulfilled {units_fulfilled} units from bank {bank_code}; {batch_info}"),
        )?;
        tracing::info!(
            request = request_id,
            bank = %bank_code,
            units = units_fulfilled,
            "request fulfilled"
        );
        Ok(claimed)
    }

    /// Restore a request whose FULFILLED claim must be undone because
    /// the stock debit failed. Retried against fresh bytes so notes
    /// appended in the window survive; the claim note at
    /// `claim_note_idx` does not.
    fn rollback_fulfill_claim(
        &self,
        request_id: &str,
        claim_note_idx: usize,
    ) -> anyhow::Result<()> {
        loop {
            let bytes = match self
                .requests
                .get(request_id.as_bytes())
                .map_err(|e| LedgerError::Storage(e.to_string()))?
            {
                Some(bytes) => bytes,
                // Purged in the window; the trail already has the
                // history and there is nothing left to restore.
                None => return Ok(()),
            };
            let mut request: HospitalBloodRequest = minicbor::decode(&bytes)?;
            if request.status != RequestStatus::Fulfilled {
                return Ok(());
            }
            request.status = RequestStatus::Processing;
            request.units_fulfilled = 0;
            request.closed_at = None;
            if claim_note_idx < request.notes.len() {
                request.notes.remove(claim_note_idx);
            }
            if self.store_cas(&bytes, &request)? {
                return Ok(());
            }
        }
    }

    pub fn reject(
        &self,
        request_id: &str,
        reason: &str,
        actor: &Actor,
    ) -> anyhow::Result<HospitalBloodRequest> {
        self.close(request_id, RequestStatus::Rejected, "REJECT", reason, actor)
    }

    pub fn cancel(
        &self,
        request_id: &str,
        reason: &str,
        actor: &Actor,
    ) -> anyhow::Result<HospitalBloodRequest> {
        self.close(request_id, RequestStatus::Cancelled, "CANCEL", reason, actor)
    }

    fn close(
        &self,
        request_id: &str,
        to: RequestStatus,
        action: &str,
        reason: &str,
        actor: &Actor,
    ) -> anyhow::Result<HospitalBloodRequest> {
        let (old, mut request) = self.load(request_id)?;
        let from = request.status;
        if from.is_terminal() {
            return self.precondition_failure(
                &request,
                action,
                actor,
                format!("request {request_id} is already {}", from.as_str()),
            );
        }
        if reason.trim().is_empty() {
            self.audit_transition(
                request_id,
                action,
                actor,
                ChangeSet::default(),
                AuditStatus::Failure,
                format!("{action} refused: a reason is required"),
            )?;
            return Err(LedgerError::Validation(format!(
                "a non-empty reason is required to {action}"
            ))
            .into());
        }
        request.status = to;
        request.closed_at = Some(TimeStamp::new());
        request.push_note(actor, reason);
        self.commit_transition(old, request, from, action, actor, Some(reason.to_string()))
    }

    /// Append to the communication log without changing status.
    pub fn add_note(
        &self,
        request_id: &str,
        message: &str,
        actor: &Actor,
    ) -> anyhow::Result<HospitalBloodRequest> {
        if message.trim().is_empty() {
            return Err(LedgerError::Validation("note must not be empty".into()).into());
        }
        let (old, mut request) = self.load(request_id)?;
        request.push_note(actor, message);
        if !self.store_cas(&old, &request)? {
            return Err(LedgerError::Precondition(format!(
                "request {request_id} was concurrently modified"
            ))
            .into());
        }
        self.audit_transition(
            request_id,
            "ADD_NOTE",
            actor,
            ChangeSet::default(),
            AuditStatus::Success,
            message.to_string(),
        )?;
        Ok(request)
    }

    /// Admin removal of the request document. The audit trail keeps the
    /// full history; only the live record disappears.
    pub fn purge(&self, request_id: &str, reason: &str, actor: &Actor) -> anyhow::Result<()> {
        if reason.trim().is_empty() {
            return Err(
                LedgerError::Validation("a non-empty reason is required to purge".into()).into(),
            );
        }
        let (_, request) = self.load(request_id)?;
        self.requests
            .remove(request_id.as_bytes())
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        self.audit_transition(
            request_id,
            "PURGE",
            actor,
            ChangeSet {
                before: Some(request.status.as_str().to_string()),
                after: None,
            },
            AuditStatus::Success,
            reason.to_string(),
        )?;
        tracing::warn!(request = request_id, "request purged");
        Ok(())
    }

    /// Raise a DELAYED_EMERGENCY alert for every CRITICAL request that
    /// has sat in PENDING/PENDING_ADMIN_APPROVAL/APPROVED longer than the
    /// configured window. The requests themselves are left untouched;
    /// reassignment is the surrounding escalation process's call.
    pub fn sweep_delayed(&self) -> anyhow::Result<usize> {
        let mut raised = 0;
        for item in self.requests.iter() {
            let (_, value) = item.map_err(|e| LedgerError::Storage(e.to_string()))?;
            let request: HospitalBloodRequest = minicbor::decode(&value)?;
            if request.urgency != Urgency::Critical {
                continue;
            }
            if !matches!(
                request.status,
                RequestStatus::Pending
                    | RequestStatus::PendingAdminApproval
                    | RequestStatus::Approved
            ) {
                continue;
            }
            if request.created_at.age() <= self.config.delayed_emergency_after {
                continue;
            }
            self.alerts.raise(
                AlertType::DelayedEmergency,
                Severity::Critical,
                EntityType::HospitalRequest,
                &request.request_id,
                format!(
                    "critical request for {} x{} still {} after the escalation window",
                    request.blood_group,
                    request.units_requested,
                    request.status.as_str()
                ),
            )?;
            raised += 1;
        }
        Ok(raised)
    }

    pub fn get(&self, request_id: &str) -> anyhow::Result<HospitalBloodRequest> {
        Ok(self.load(request_id)?.1)
    }

    fn commit_transition(
        &self,
        old: sled::IVec,
        request: HospitalBloodRequest,
        from: RequestStatus,
        action: &str,
        actor: &Actor,
        detail: Option<String>,
    ) -> anyhow::Result<HospitalBloodRequest> {
        if !self.store_cas(&old, &request)? {
            return self.precondition_failure(
                &request,
                action,
                actor,
                format!(
                    "request {} was concurrently modified",
                    request.request_id
                ),
            );
        }
        let description = detail.unwrap_or_else(|| {
            format!("status {} -> {}", from.as_str(), request.status.as_str())
        });
        self.audit_transition(
            &request.request_id,
            action,
            actor,
            ChangeSet::transition(from.as_str(), request.status.as_str()),
            AuditStatus::Success,
            description,
        )?;
        tracing::info!(
            request = %request.request_id,
            from = from.as_str(),
            to = request.status.as_str(),
            "request transition"
        );
        Ok(request)
    }
}
