use crate::types::BloodGroup;

/// Failure taxonomy for every ledger operation. Services return
/// `anyhow::Result`; callers that need to branch on the kind downcast
/// with `err.downcast_ref::<LedgerError>()`.
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("insufficient stock of {group} at bank {bank_code}: {available} available, {requested} requested")]
    InsufficientStock {
        bank_code: String,
        group: BloodGroup,
        available: u32,
        requested: u32,
    },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("audit append failed: {0}")]
    AuditWriteFailed(String),
}
