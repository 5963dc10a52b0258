use assert_matches::assert_matches;
use blood_ledger::alert::AlertType;
use blood_ledger::audit::{AuditEntry, AuditQuery, AuditStatus};
use blood_ledger::bank::BankStatus;
use blood_ledger::config::LedgerConfig;
use blood_ledger::drive::DriveStatus;
use blood_ledger::error::LedgerError;
use blood_ledger::request::RequestStatus;
use blood_ledger::types::{Actor, BloodGroup, EntityType, Role, TimeStamp, Urgency};
use blood_ledger::Ledger;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

// Sled uses file-based locking to prevent concurrent access, so each test
// gets its own database under a temp dir for simplified cleanup.
fn open_ledger(name: &str, config: LedgerConfig) -> anyhow::Result<(TempDir, Ledger)> {
    let temp_dir = tempdir()?;
    let db = sled::open(temp_dir.path().join(name))?;
    let ledger = Ledger::open(Arc::new(db), config)?;
    Ok((temp_dir, ledger))
}

fn admin() -> Actor {
    Actor::new("admin_1", Role::Admin)
}

fn hospital() -> Actor {
    Actor::new("hosp_1", Role::Hospital)
}

fn bank_staff() -> Actor {
    Actor::new("bank_staff_1", Role::BloodBank)
}

fn ngo() -> Actor {
    Actor::new("ngo_1", Role::Ngo)
}

/// Register and verify a bank, then seed one group's stock.
fn seeded_bank(
    ledger: &Ledger,
    code: &str,
    group: BloodGroup,
    units: i64,
) -> anyhow::Result<()> {
    ledger
        .banks
        .register(code, "City Blood Bank", "Sector 4", &admin())?;
    ledger.banks.verify(code, &admin())?;
    if units > 0 {
        ledger.stock.adjust(code, group, units, &bank_staff())?;
    }
    Ok(())
}

#[test]
fn critical_request_short_stock_then_drive_replenishes() -> anyhow::Result<()> {
    let (_tmp, ledger) = open_ledger("critical_flow.db", LedgerConfig::default())?;
    seeded_bank(&ledger, "BB-001", BloodGroup::OPos, 3)?;

    // CRITICAL urgency still needs an explicit admin approval record.
    let request = ledger.requests.create(
        "hosp_1",
        BloodGroup::OPos,
        5,
        Urgency::Critical,
        &hospital(),
    )?;
    assert_eq!(request.status, RequestStatus::PendingAdminApproval);

    let request = ledger.requests.approve(&request.request_id, &admin())?;
    assert_eq!(request.status, RequestStatus::Approved);
    let request = ledger.requests.assign(&request.request_id, "BB-001", &admin())?;
    let request = ledger
        .requests
        .start_processing(&request.request_id, &bank_staff())?;
    assert_eq!(request.status, RequestStatus::Processing);

    // Only 3 units on hand: the debit must fail with no mutation.
    let err = ledger
        .requests
        .fulfill(&request.request_id, 5, "batch 77-A", &bank_staff())
        .unwrap_err();
    assert_matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::InsufficientStock {
            available: 3,
            requested: 5,
            ..
        })
    );
    assert_eq!(ledger.stock.units_available("BB-001", BloodGroup::OPos)?, 3);
    assert_eq!(
        ledger.requests.get(&request.request_id)?.status,
        RequestStatus::Processing
    );
    assert_eq!(
        ledger.alerts.count_of_type(AlertType::NgoFallbackTriggered)?,
        1
    );

    // An NGO drive replenishes the same bank.
    let drive = ledger.drives.create("BB-001", "ngo_1", &ngo())?;
    assert_eq!(drive.status, DriveStatus::Planned);
    let drive = ledger.drives.approve(&drive.drive_id, &admin())?;
    let drive = ledger.drives.start(&drive.drive_id, &bank_staff())?;
    let drive = ledger
        .drives
        .record_collection(&drive.drive_id, BloodGroup::OPos, 10, &ngo())?;
    assert_eq!(drive.collected.get(BloodGroup::OPos), 10);
    assert_eq!(ledger.stock.units_available("BB-001", BloodGroup::OPos)?, 3);

    let drive = ledger.drives.complete(&drive.drive_id, 12, &ngo())?;
    assert_eq!(drive.status, DriveStatus::Completed);
    assert_eq!(drive.total_units_collected(), 10);
    assert_eq!(ledger.stock.units_available("BB-001", BloodGroup::OPos)?, 13);

    // The pending request now goes through; 13 - 5 = 8 sits above the
    // critical threshold but below low, so only LOW_STOCK fires.
    let critical_before = ledger.alerts.count_of_type(AlertType::CriticalShortage)?;
    let low_before = ledger.alerts.count_of_type(AlertType::LowStock)?;

    let request = ledger
        .requests
        .fulfill(&request.request_id, 5, "batch 77-B", &bank_staff())?;
    assert_eq!(request.status, RequestStatus::Fulfilled);
    assert_eq!(request.units_fulfilled, 5);
    assert_eq!(ledger.stock.units_available("BB-001", BloodGroup::OPos)?, 8);
    assert_eq!(
        ledger.alerts.count_of_type(AlertType::CriticalShortage)?,
        critical_before
    );
    assert_eq!(
        ledger.alerts.count_of_type(AlertType::LowStock)?,
        low_before + 1
    );

    // Cumulative statistics land on the owning bank.
    let bank = ledger.banks.get("BB-001")?;
    assert_eq!(bank.total_units_issued, 5);
    assert_eq!(bank.total_requests_fulfilled, 1);
    assert_eq!(bank.total_ngo_drives_supported, 1);
    assert_eq!(bank.total_donations_received, 10);

    Ok(())
}

#[test]
fn fulfill_twice_debits_stock_exactly_once() -> anyhow::Result<()> {
    let (_tmp, ledger) = open_ledger("double_fulfill.db", LedgerConfig::default())?;
    seeded_bank(&ledger, "BB-002", BloodGroup::ANeg, 10)?;

    let request = ledger.requests.create(
        "hosp_1",
        BloodGroup::ANeg,
        5,
        Urgency::Medium,
        &hospital(),
    )?;
    assert_eq!(request.status, RequestStatus::Pending);
    ledger.requests.approve(&request.request_id, &bank_staff())?;
    ledger
        .requests
        .assign(&request.request_id, "BB-002", &admin())?;
    ledger
        .requests
        .start_processing(&request.request_id, &bank_staff())?;

    ledger
        .requests
        .fulfill(&request.request_id, 5, "batch 12", &bank_staff())?;

    let err = ledger
        .requests
        .fulfill(&request.request_id, 5, "batch 12 again", &bank_staff())
        .unwrap_err();
    assert_matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::Precondition(_))
    );
    assert_eq!(ledger.stock.units_available("BB-002", BloodGroup::ANeg)?, 5);

    Ok(())
}

#[test]
fn failed_fulfill_restores_processing_and_keeps_earlier_notes() -> anyhow::Result<()> {
    let (_tmp, ledger) = open_ledger("fulfill_rollback.db", LedgerConfig::default())?;
    seeded_bank(&ledger, "BB-009", BloodGroup::BNeg, 2)?;

    let request = ledger.requests.create(
        "hosp_1",
        BloodGroup::BNeg,
        4,
        Urgency::High,
        &hospital(),
    )?;
    ledger.requests.approve(&request.request_id, &bank_staff())?;
    ledger
        .requests
        .assign(&request.request_id, "BB-009", &admin())?;
    ledger
        .requests
        .start_processing(&request.request_id, &bank_staff())?;
    ledger
        .requests
        .add_note(&request.request_id, "courier booked for tomorrow", &hospital())?;

    let err = ledger
        .requests
        .fulfill(&request.request_id, 4, "batch 31", &bank_staff())
        .unwrap_err();
    assert_matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::InsufficientStock { .. })
    );

    // Back to the pre-claim state: nothing booked, the fulfilment note
    // gone, earlier notes intact.
    let request = ledger.requests.get(&request.request_id)?;
    assert_eq!(request.status, RequestStatus::Processing);
    assert_eq!(request.units_fulfilled, 0);
    assert!(request.closed_at.is_none());
    let messages: Vec<&str> = request.notes.iter().map(|n| n.message.as_str()).collect();
    assert_eq!(messages, ["courier booked for tomorrow"]);

    // The failed attempt is still on the trail.
    let entries = ledger.audit.query(
        &AuditQuery::new()
            .for_entity(EntityType::HospitalRequest, &request.request_id)
            .with_action("FULFILL"),
    )?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AuditStatus::Failure);

    Ok(())
}

#[test]
fn cancelled_drive_leaves_stock_untouched() -> anyhow::Result<()> {
    let (_tmp, ledger) = open_ledger("cancelled_drive.db", LedgerConfig::default())?;
    seeded_bank(&ledger, "BB-003", BloodGroup::APos, 20)?;

    let before = ledger.stock.snapshot("BB-003")?;

    let drive = ledger.drives.create("BB-003", "ngo_1", &ngo())?;
    ledger.drives.approve(&drive.drive_id, &admin())?;
    ledger.drives.start(&drive.drive_id, &bank_staff())?;
    ledger
        .drives
        .record_collection(&drive.drive_id, BloodGroup::APos, 7, &ngo())?;
    ledger
        .drives
        .record_collection(&drive.drive_id, BloodGroup::BNeg, 3, &ngo())?;

    let drive = ledger
        .drives
        .cancel(&drive.drive_id, "venue fell through", &ngo())?;
    assert_eq!(drive.status, DriveStatus::Cancelled);
    assert_eq!(drive.closed_reason.as_deref(), Some("venue fell through"));

    // Collections never reached the ledger.
    assert_eq!(ledger.stock.snapshot("BB-003")?, before);

    Ok(())
}

#[test]
fn failed_batch_credit_rolls_back_and_drive_stays_ongoing() -> anyhow::Result<()> {
    let (_tmp, ledger) = open_ledger("credit_rollback.db", LedgerConfig::default())?;
    seeded_bank(&ledger, "BB-004", BloodGroup::APos, 5)?;
    // Saturate B+ so its credit overflows after A+ has already applied.
    ledger
        .stock
        .adjust("BB-004", BloodGroup::BPos, u32::MAX as i64, &bank_staff())?;

    let drive = ledger.drives.create("BB-004", "ngo_1", &ngo())?;
    ledger.drives.approve(&drive.drive_id, &admin())?;
    ledger.drives.start(&drive.drive_id, &bank_staff())?;
    ledger
        .drives
        .record_collection(&drive.drive_id, BloodGroup::APos, 4, &ngo())?;
    ledger
        .drives
        .record_collection(&drive.drive_id, BloodGroup::BPos, 1, &ngo())?;

    let err = ledger.drives.complete(&drive.drive_id, 6, &ngo()).unwrap_err();
    assert_matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::Validation(_))
    );

    // Full rollback: both counters at pre-complete values, drive ONGOING.
    assert_eq!(ledger.stock.units_available("BB-004", BloodGroup::APos)?, 5);
    assert_eq!(
        ledger.stock.units_available("BB-004", BloodGroup::BPos)?,
        u32::MAX
    );
    assert_eq!(
        ledger.drives.get(&drive.drive_id)?.status,
        DriveStatus::Ongoing
    );

    // The failed completion attempt is recorded against the drive.
    let entries = ledger.audit.query(
        &AuditQuery::new()
            .for_entity(EntityType::DonationDrive, &drive.drive_id)
            .with_action("COMPLETE"),
    )?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, AuditStatus::Failure);

    Ok(())
}

#[test]
fn audit_history_is_newest_first_with_one_entry_per_attempt() -> anyhow::Result<()> {
    let (_tmp, ledger) = open_ledger("audit_order.db", LedgerConfig::default())?;
    seeded_bank(&ledger, "BB-005", BloodGroup::ONeg, 0)?;

    let request = ledger.requests.create(
        "hosp_1",
        BloodGroup::ONeg,
        2,
        Urgency::Low,
        &hospital(),
    )?;
    ledger.requests.approve(&request.request_id, &bank_staff())?;
    ledger
        .requests
        .assign(&request.request_id, "BB-005", &admin())?;
    // A second approve is a precondition failure and still audited.
    let _ = ledger
        .requests
        .approve(&request.request_id, &bank_staff())
        .unwrap_err();

    let entries = ledger.audit.query(
        &AuditQuery::new().for_entity(EntityType::HospitalRequest, &request.request_id),
    )?;
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(actions, ["APPROVE", "ASSIGN", "APPROVE", "CREATE"]);
    assert_eq!(entries[0].status, AuditStatus::Failure);
    assert_eq!(entries[1].status, AuditStatus::Success);
    for entry in &entries {
        assert!(entry.verify()?);
    }

    // Filters compose: only this actor's entries.
    let by_admin = ledger.audit.query(
        &AuditQuery::new()
            .for_entity(EntityType::HospitalRequest, &request.request_id)
            .by_actor("admin_1"),
    )?;
    assert_eq!(by_admin.len(), 1);
    assert_eq!(by_admin[0].action, "ASSIGN");

    Ok(())
}

#[test]
fn audit_query_paginates_and_honours_date_ranges() -> anyhow::Result<()> {
    let (_tmp, ledger) = open_ledger("audit_paging.db", LedgerConfig::default())?;
    seeded_bank(&ledger, "BB-008", BloodGroup::APos, 0)?;
    let staff = bank_staff();

    // Seven single-unit credits; the middle three land inside a
    // captured time window. The sleeps keep the window boundaries
    // clear of the neighbouring entries on coarse clocks.
    for _ in 0..2 {
        ledger.stock.adjust("BB-008", BloodGroup::APos, 1, &staff)?;
    }
    std::thread::sleep(std::time::Duration::from_millis(5));
    let window_start = TimeStamp::new();
    for _ in 0..3 {
        ledger.stock.adjust("BB-008", BloodGroup::APos, 1, &staff)?;
    }
    let window_end = TimeStamp::new();
    std::thread::sleep(std::time::Duration::from_millis(5));
    for _ in 0..2 {
        ledger.stock.adjust("BB-008", BloodGroup::APos, 1, &staff)?;
    }

    let stock_query = || AuditQuery::new().for_entity(EntityType::BloodStock, "BB-008/A+");

    // Newest-first, three per page: counters 7..1 split 3/3/1.
    let after = |entries: &[AuditEntry]| -> Vec<String> {
        entries
            .iter()
            .map(|e| e.changes.after.clone().unwrap_or_default())
            .collect()
    };
    let page0 = ledger.audit.query(&stock_query().page(0, 3))?;
    assert_eq!(after(&page0), ["7", "6", "5"]);
    let page1 = ledger.audit.query(&stock_query().page(1, 3))?;
    assert_eq!(after(&page1), ["4", "3", "2"]);
    let page2 = ledger.audit.query(&stock_query().page(2, 3))?;
    assert_eq!(after(&page2), ["1"]);
    assert!(ledger.audit.query(&stock_query().page(3, 3))?.is_empty());

    // The window catches exactly the middle three, still newest-first.
    let windowed = ledger
        .audit
        .query(&stock_query().between(window_start, window_end))?;
    assert_eq!(after(&windowed), ["5", "4", "3"]);

    Ok(())
}

#[test]
fn rejection_requires_a_reason() -> anyhow::Result<()> {
    let (_tmp, ledger) = open_ledger("reject_reason.db", LedgerConfig::default())?;

    let request = ledger.requests.create(
        "hosp_1",
        BloodGroup::BPos,
        4,
        Urgency::High,
        &hospital(),
    )?;

    let err = ledger
        .requests
        .reject(&request.request_id, "  ", &admin())
        .unwrap_err();
    assert_matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::Validation(_))
    );
    assert_eq!(
        ledger.requests.get(&request.request_id)?.status,
        RequestStatus::Pending
    );

    let rejected = ledger
        .requests
        .reject(&request.request_id, "no matching donor window", &admin())?;
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(
        rejected.notes.last().map(|n| n.message.as_str()),
        Some("no matching donor window")
    );

    Ok(())
}

#[test]
fn assignment_requires_a_verified_bank() -> anyhow::Result<()> {
    let (_tmp, ledger) = open_ledger("unverified_bank.db", LedgerConfig::default())?;
    ledger
        .banks
        .register("BB-006", "New Bank", "Sector 9", &admin())?;
    assert!(!ledger.banks.is_verified("BB-006")?);

    let request = ledger.requests.create(
        "hosp_1",
        BloodGroup::AbNeg,
        1,
        Urgency::Low,
        &hospital(),
    )?;
    ledger.requests.approve(&request.request_id, &bank_staff())?;

    let err = ledger
        .requests
        .assign(&request.request_id, "BB-006", &admin())
        .unwrap_err();
    assert_matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::Validation(_))
    );
    assert_eq!(
        ledger.requests.get(&request.request_id)?.status,
        RequestStatus::Approved
    );

    // A drive against an unverified bank is refused the same way.
    let err = ledger.drives.create("BB-006", "ngo_1", &ngo()).unwrap_err();
    assert_matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::Validation(_))
    );

    ledger.banks.verify("BB-006", &admin())?;
    assert!(ledger.banks.is_verified("BB-006")?);
    let assigned = ledger
        .requests
        .assign(&request.request_id, "BB-006", &admin())?;
    assert_eq!(assigned.status, RequestStatus::Assigned);

    Ok(())
}

#[test]
fn stalled_critical_requests_raise_delayed_emergency() -> anyhow::Result<()> {
    let config = LedgerConfig {
        delayed_emergency_after: chrono::Duration::zero(),
        ..LedgerConfig::default()
    };
    let (_tmp, ledger) = open_ledger("delayed.db", config)?;

    ledger.requests.create(
        "hosp_1",
        BloodGroup::OPos,
        2,
        Urgency::Critical,
        &hospital(),
    )?;
    ledger.requests.create(
        "hosp_1",
        BloodGroup::OPos,
        2,
        Urgency::Low,
        &hospital(),
    )?;
    std::thread::sleep(std::time::Duration::from_millis(10));

    // Only the critical one is flagged, and it is left untouched.
    assert_eq!(ledger.requests.sweep_delayed()?, 1);
    assert_eq!(
        ledger.alerts.count_of_type(AlertType::DelayedEmergency)?,
        1
    );

    Ok(())
}

#[test]
fn bank_lifecycle_is_audited() -> anyhow::Result<()> {
    let (_tmp, ledger) = open_ledger("bank_lifecycle.db", LedgerConfig::default())?;

    let bank = ledger
        .banks
        .register("BB-007", "Regional Bank", "Sector 2", &admin())?;
    assert_eq!(bank.status, BankStatus::Pending);
    ledger.banks.verify("BB-007", &admin())?;
    let bank = ledger.banks.suspend("BB-007", &admin())?;
    assert_eq!(bank.status, BankStatus::Suspended);

    let entries = ledger
        .audit
        .query(&AuditQuery::new().for_entity(EntityType::BloodBank, "BB-007"))?;
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(actions, ["SUSPEND", "VERIFY", "REGISTER"]);

    // Suspending twice is a precondition failure.
    let err = ledger.banks.suspend("BB-007", &admin()).unwrap_err();
    assert_matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::Precondition(_))
    );

    Ok(())
}

#[test]
fn purge_removes_the_document_but_keeps_the_trail() -> anyhow::Result<()> {
    let (_tmp, ledger) = open_ledger("purge.db", LedgerConfig::default())?;

    let request = ledger.requests.create(
        "hosp_1",
        BloodGroup::AbNeg,
        1,
        Urgency::Low,
        &hospital(),
    )?;
    ledger
        .requests
        .cancel(&request.request_id, "duplicate entry", &hospital())?;
    ledger
        .requests
        .purge(&request.request_id, "data retention request", &admin())?;

    let err = ledger.requests.get(&request.request_id).unwrap_err();
    assert_matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::NotFound { .. })
    );

    let entries = ledger.audit.query(
        &AuditQuery::new().for_entity(EntityType::HospitalRequest, &request.request_id),
    )?;
    let actions: Vec<&str> = entries.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(actions, ["PURGE", "CANCEL", "CREATE"]);

    Ok(())
}
