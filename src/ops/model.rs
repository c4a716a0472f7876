//! Operation data model
//!
//! An operation is one submission against one session: a single bill, a
//! pre-parsed CSV batch, or an auto-selected set of expiring bills. Items
//! carry their own terminal state so a batch can succeed partially.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::driver::{EligibilityFilter, ExtensionParams};

/// What kind of submission produced this operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Single,
    BatchCsv,
    AutoSelect,
}

/// Operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// Per-item state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Succeeded | ItemState::Failed | ItemState::Skipped
        )
    }
}

/// Closed failure taxonomy. Every terminal failure carries exactly one of
/// these tags; nothing is swallowed untagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Validation,
    SessionNotAuthenticated,
    SessionExpired,
    ConcurrencyConflict,
    CaptchaTimeout,
    TransientPortal,
    BusinessRejection,
    DriverFault,
}

/// A tagged failure message.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub kind: FailureKind,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One bill inside an operation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationItem {
    /// The e-way bill number
    pub ref_id: String,
    pub params: ExtensionParams,
    /// Extension attempts made so far; never exceeds maxRetries + 1
    pub attempts: u32,
    pub state: ItemState,
    pub last_error: Option<ItemError>,
}

impl OperationItem {
    pub fn new(ref_id: String, params: ExtensionParams) -> Self {
        Self {
            ref_id,
            params,
            attempts: 0,
            state: ItemState::Pending,
            last_error: None,
        }
    }
}

/// Succeeded/failed/skipped counts; always sums to the item count once
/// the operation is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Summary {
    pub fn of(items: &[OperationItem]) -> Self {
        let mut summary = Summary::default();
        for item in items {
            match item.state {
                ItemState::Succeeded => summary.succeeded += 1,
                ItemState::Failed => summary.failed += 1,
                ItemState::Skipped => summary.skipped += 1,
                _ => {}
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// One extension operation bound to one session.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub session_id: String,
    pub items: Vec<OperationItem>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: Summary,
    /// Operation-level failure tag when status is Failed
    pub error: Option<ItemError>,
}

impl Operation {
    pub fn new(op_type: OperationType, session_id: &str, items: Vec<OperationItem>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            status: OperationStatus::Pending,
            session_id: session_id.to_string(),
            items,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            summary: Summary::default(),
            error: None,
        }
    }
}

/// One row of a submission payload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillItemSpec {
    pub ewb_number: String,
    #[serde(flatten)]
    pub params: ExtensionParams,
}

/// Auto-select payload: the filter plus the parameters applied to every
/// selected bill.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSelectSpec {
    #[serde(default)]
    pub filter: EligibilityFilter,
    #[serde(default)]
    pub defaults: ExtensionParams,
}

/// Submission payload, one variant per operation type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmitRequest {
    Single(BillItemSpec),
    BatchCsv(Vec<BillItemSpec>),
    AutoSelect(AutoSelectSpec),
}

impl SubmitRequest {
    pub fn op_type(&self) -> OperationType {
        match self {
            SubmitRequest::Single(_) => OperationType::Single,
            SubmitRequest::BatchCsv(_) => OperationType::BatchCsv,
            SubmitRequest::AutoSelect(_) => OperationType::AutoSelect,
        }
    }
}

/// Rejected before any session interaction; no operation record exists.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),
}

/// E-way bill numbers are 11-12 digit numerics.
pub fn validate_ewb_number(ewb_number: &str) -> Result<(), String> {
    let trimmed = ewb_number.trim();
    if trimmed.is_empty() {
        return Err("E-way bill number is empty".to_string());
    }
    if !(11..=12).contains(&trimmed.len()) || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!(
            "E-way bill number '{}' is not an 11-12 digit number",
            trimmed
        ));
    }
    Ok(())
}

/// Shape-level validation applied before any session interaction.
///
/// A malformed Single payload or an unusable batch is refused here. A
/// batch with well-formed shape but individually bad rows is accepted;
/// those rows fail per-item without aborting their siblings.
pub fn validate_submit(request: &SubmitRequest) -> Result<(), SubmitError> {
    match request {
        SubmitRequest::Single(spec) => {
            validate_ewb_number(&spec.ewb_number).map_err(SubmitError::Validation)
        }
        SubmitRequest::BatchCsv(rows) => {
            if rows.is_empty() {
                return Err(SubmitError::Validation("Batch contains no rows".to_string()));
            }
            if rows.iter().all(|r| r.ewb_number.trim().is_empty()) {
                return Err(SubmitError::Validation(
                    "No row carries an e-way bill number".to_string(),
                ));
            }
            Ok(())
        }
        SubmitRequest::AutoSelect(spec) => {
            if spec.filter.max_extensions == 0 {
                return Err(SubmitError::Validation(
                    "maxExtensions of 0 selects nothing".to_string(),
                ));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewb_number_validation() {
        assert!(validate_ewb_number("391234567890").is_ok());
        assert!(validate_ewb_number("39123456789").is_ok());
        assert!(validate_ewb_number(" 391234567890 ").is_ok());

        assert!(validate_ewb_number("").is_err());
        assert!(validate_ewb_number("1234").is_err());
        assert!(validate_ewb_number("39123456789012").is_err());
        assert!(validate_ewb_number("39123456789a").is_err());
    }

    #[test]
    fn test_single_submit_validation() {
        let ok = SubmitRequest::Single(BillItemSpec {
            ewb_number: "391234567890".to_string(),
            params: ExtensionParams::default(),
        });
        assert!(validate_submit(&ok).is_ok());

        let bad = SubmitRequest::Single(BillItemSpec {
            ewb_number: "oops".to_string(),
            params: ExtensionParams::default(),
        });
        assert!(matches!(
            validate_submit(&bad),
            Err(SubmitError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_batch_is_refused() {
        let empty = SubmitRequest::BatchCsv(vec![]);
        assert!(matches!(
            validate_submit(&empty),
            Err(SubmitError::Validation(_))
        ));
    }

    #[test]
    fn test_batch_tolerates_individually_bad_rows() {
        let mixed = SubmitRequest::BatchCsv(vec![
            BillItemSpec {
                ewb_number: "391234567890".to_string(),
                params: ExtensionParams::default(),
            },
            BillItemSpec {
                ewb_number: "bad".to_string(),
                params: ExtensionParams::default(),
            },
        ]);
        assert!(validate_submit(&mixed).is_ok());
    }

    #[test]
    fn test_summary_counts_terminal_states() {
        let mut items = vec![
            OperationItem::new("1".into(), ExtensionParams::default()),
            OperationItem::new("2".into(), ExtensionParams::default()),
            OperationItem::new("3".into(), ExtensionParams::default()),
        ];
        items[0].state = ItemState::Succeeded;
        items[1].state = ItemState::Failed;
        items[2].state = ItemState::Skipped;

        let summary = Summary::of(&items);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total(), items.len());
    }

    #[test]
    fn test_submit_request_wire_format() {
        let json = r#"{"single":{"ewbNumber":"391234567890","reason":"Accident","extraDistanceKm":42.0}}"#;
        let parsed: SubmitRequest = serde_json::from_str(json).unwrap();
        match parsed {
            SubmitRequest::Single(spec) => {
                assert_eq!(spec.ewb_number, "391234567890");
                assert_eq!(spec.params.reason, "Accident");
                assert_eq!(spec.params.extra_distance_km, Some(42.0));
            }
            _ => panic!("wrong variant"),
        }
    }
}
