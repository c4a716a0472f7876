//! Operation execution
//!
//! Runs one operation end-to-end against exactly one leased session. A
//! partial failure never aborts sibling items; only losing the session or
//! a driver fault abandons the remaining queue. Cancellation is
//! cooperative and lands at item boundaries so an in-flight portal call
//! finishes cleanly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::driver::ExtendOutcome;
use crate::progress::{ProgressChannel, ProgressEvent, ProgressEventKind};
use crate::session::{SessionError, SessionLease, SessionManager};

use super::model::{
    validate_ewb_number, validate_submit, AutoSelectSpec, FailureKind, ItemError, ItemState,
    Operation, OperationItem, OperationStatus, SubmitError, SubmitRequest, Summary,
};
use super::retry::RetryPolicy;

/// Execution knobs, derived from the application config.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    /// How long batch operations queue for the session lease. Single
    /// operations are interactive and fail fast instead.
    pub lease_wait_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            lease_wait_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared record plus the cooperative cancellation flag.
#[derive(Clone)]
struct OpHandle {
    op: Arc<RwLock<Operation>>,
    cancel: Arc<AtomicBool>,
}

/// Everything one operation run needs; the run task owns no reference to
/// the orchestrator itself.
struct RunContext {
    sessions: Arc<SessionManager>,
    progress: Arc<ProgressChannel>,
    handle: OpHandle,
    retry: RetryPolicy,
    lease_wait: Duration,
    auto: Option<AutoSelectSpec>,
}

/// Accepts, executes and tracks extension operations.
pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    progress: Arc<ProgressChannel>,
    operations: RwLock<HashMap<String, OpHandle>>,
    config: RwLock<OrchestratorConfig>,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        progress: Arc<ProgressChannel>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            sessions,
            progress,
            operations: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
        }
    }

    pub async fn set_config(&self, config: OrchestratorConfig) {
        *self.config.write().await = config;
    }

    /// Validate and schedule one operation. Malformed payloads are
    /// refused synchronously and never create an operation record.
    pub async fn submit(
        &self,
        session_id: &str,
        request: SubmitRequest,
    ) -> Result<String, SubmitError> {
        validate_submit(&request)?;

        let op_type = request.op_type();
        let (items, auto) = match request {
            SubmitRequest::Single(spec) => (
                vec![OperationItem::new(spec.ewb_number.trim().to_string(), spec.params)],
                None,
            ),
            SubmitRequest::BatchCsv(rows) => (
                rows.into_iter()
                    .map(|row| OperationItem::new(row.ewb_number.trim().to_string(), row.params))
                    .collect(),
                None,
            ),
            // Auto-select items are resolved against the portal once the
            // lease is held.
            SubmitRequest::AutoSelect(spec) => (Vec::new(), Some(spec)),
        };

        let operation = Operation::new(op_type, session_id, items);
        let operation_id = operation.id.clone();
        info!(
            "Operation {} submitted ({:?}, {} item(s), session {})",
            operation_id,
            op_type,
            operation.items.len(),
            session_id
        );

        let handle = OpHandle {
            op: Arc::new(RwLock::new(operation)),
            cancel: Arc::new(AtomicBool::new(false)),
        };

        self.progress.register(&operation_id).await;
        self.operations
            .write()
            .await
            .insert(operation_id.clone(), handle.clone());

        let config = self.config.read().await.clone();
        let ctx = RunContext {
            sessions: self.sessions.clone(),
            progress: self.progress.clone(),
            handle,
            retry: config.retry,
            lease_wait: match op_type {
                super::model::OperationType::Single => Duration::ZERO,
                _ => config.lease_wait_timeout,
            },
            auto,
        };
        tokio::spawn(run_operation(ctx));

        Ok(operation_id)
    }

    /// Request cooperative cancellation. The in-flight item finishes;
    /// everything after it is skipped.
    pub async fn cancel(&self, operation_id: &str) -> Result<(), SubmitError> {
        let handle = self
            .operations
            .read()
            .await
            .get(operation_id)
            .cloned()
            .ok_or_else(|| SubmitError::UnknownOperation(operation_id.to_string()))?;

        handle.cancel.store(true, Ordering::Relaxed);
        info!("Operation {} cancellation requested", operation_id);
        Ok(())
    }

    /// Snapshot of one operation.
    pub async fn get_status(&self, operation_id: &str) -> Result<Operation, SubmitError> {
        let handle = self
            .operations
            .read()
            .await
            .get(operation_id)
            .cloned()
            .ok_or_else(|| SubmitError::UnknownOperation(operation_id.to_string()))?;
        let snapshot = handle.op.read().await.clone();
        Ok(snapshot)
    }

    /// Snapshots of all known operations, newest first.
    pub async fn list_operations(&self) -> Vec<Operation> {
        let handles: Vec<OpHandle> = self.operations.read().await.values().cloned().collect();
        let mut ops = Vec::with_capacity(handles.len());
        for handle in handles {
            ops.push(handle.op.read().await.clone());
        }
        ops.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        ops
    }
}

fn failure_kind(error: &SessionError) -> FailureKind {
    match error {
        SessionError::NotAuthenticated(_) | SessionError::NotFound(_) => {
            FailureKind::SessionNotAuthenticated
        }
        SessionError::Expired => FailureKind::SessionExpired,
        SessionError::ConcurrencyConflict => FailureKind::ConcurrencyConflict,
        SessionError::CaptchaTimeout => FailureKind::CaptchaTimeout,
        _ => FailureKind::DriverFault,
    }
}

/// Drive one operation to a terminal status.
async fn run_operation(ctx: RunContext) {
    let operation_id = ctx.handle.op.read().await.id.clone();
    let session_id = ctx.handle.op.read().await.session_id.clone();

    if ctx.handle.cancel.load(Ordering::Relaxed) {
        finish_cancelled(&ctx, &operation_id).await;
        return;
    }

    let lease = match ctx.sessions.acquire(&session_id, ctx.lease_wait).await {
        Ok(lease) => lease,
        Err(e) => {
            warn!("Operation {} could not lease session {}: {}", operation_id, session_id, e);
            finish_failed(
                &ctx,
                &operation_id,
                ItemError::new(failure_kind(&e), e.to_string()),
                0,
            )
            .await;
            return;
        }
    };

    {
        let mut op = ctx.handle.op.write().await;
        op.status = OperationStatus::Running;
        op.started_at = Some(Utc::now());
    }
    ctx.progress
        .publish(ProgressEvent::new(
            &operation_id,
            ProgressEventKind::Progress,
            0,
            "Operation started",
        ))
        .await;

    // Auto-select resolves its filter into a concrete item list first;
    // that query is itself a unit of work that can fail on its own.
    if let Some(ref spec) = ctx.auto {
        match resolve_auto_items(&ctx, &operation_id, &lease, spec).await {
            Ok(items) => {
                if items.is_empty() {
                    ctx.sessions.release(lease).await;
                    info!("Operation {} found no eligible bills", operation_id);
                    finish_completed(&ctx, &operation_id, "No eligible bills found").await;
                    return;
                }
                ctx.handle.op.write().await.items = items;
            }
            Err(error) => {
                ctx.sessions.release(lease).await;
                finish_failed(&ctx, &operation_id, error, 0).await;
                return;
            }
        }
    }

    let total = ctx.handle.op.read().await.items.len();
    let mut aborted: Option<ItemError> = None;
    let mut cancelled = false;

    for index in 0..total {
        // Cancellation and session loss are checked at item boundaries.
        if ctx.handle.cancel.load(Ordering::Relaxed) {
            cancelled = true;
            skip_remaining(&ctx, index, None).await;
            break;
        }

        let (ref_id, params) = {
            let op = ctx.handle.op.read().await;
            (op.items[index].ref_id.clone(), op.items[index].params.clone())
        };

        // A row that cannot even name a bill fails before any attempt.
        if let Err(reason) = validate_ewb_number(&ref_id) {
            set_item(
                &ctx,
                index,
                ItemState::Failed,
                0,
                Some(ItemError::new(FailureKind::Validation, reason)),
            )
            .await;
            publish_item_events(&ctx, &operation_id, index, total).await;
            continue;
        }

        let mut item_abort: Option<ItemError> = None;

        for attempt in 1..=ctx.retry.max_attempts() {
            set_item(&ctx, index, ItemState::InProgress, attempt, None).await;

            match lease.extend_bill(&ref_id, &params).await {
                Ok(ExtendOutcome::Extended { valid_until }) => {
                    let message = match valid_until {
                        Some(until) => format!("Extended, valid until {}", until),
                        None => "Extended".to_string(),
                    };
                    info!("Operation {} item {} succeeded: {}", operation_id, ref_id, message);
                    set_item(&ctx, index, ItemState::Succeeded, attempt, None).await;
                    break;
                }
                Ok(ExtendOutcome::BusinessRejected { reason }) => {
                    // Portal-side ineligibility is final; retrying would
                    // just repeat the refusal.
                    info!("Operation {} item {} rejected: {}", operation_id, ref_id, reason);
                    set_item(
                        &ctx,
                        index,
                        ItemState::Failed,
                        attempt,
                        Some(ItemError::new(FailureKind::BusinessRejection, reason)),
                    )
                    .await;
                    break;
                }
                Ok(ExtendOutcome::TransientError { message }) => {
                    warn!(
                        "Operation {} item {} transient failure (attempt {}/{}): {}",
                        operation_id,
                        ref_id,
                        attempt,
                        ctx.retry.max_attempts(),
                        message
                    );
                    if attempt < ctx.retry.max_attempts() {
                        set_item(
                            &ctx,
                            index,
                            ItemState::InProgress,
                            attempt,
                            Some(ItemError::new(FailureKind::TransientPortal, message)),
                        )
                        .await;
                        tokio::time::sleep(ctx.retry.delay_after(attempt)).await;
                    } else {
                        set_item(
                            &ctx,
                            index,
                            ItemState::Failed,
                            attempt,
                            Some(ItemError::new(FailureKind::TransientPortal, message)),
                        )
                        .await;
                    }
                }
                Err(SessionError::Expired) => {
                    // The session died under us; this item's outcome (if
                    // any) cannot be trusted and the rest of the queue is
                    // abandoned.
                    item_abort = Some(ItemError::new(
                        FailureKind::SessionExpired,
                        "Session expired mid-operation",
                    ));
                    set_item(
                        &ctx,
                        index,
                        ItemState::Skipped,
                        attempt,
                        item_abort.clone(),
                    )
                    .await;
                    break;
                }
                Err(e) => {
                    let error = ItemError::new(failure_kind(&e), e.to_string());
                    item_abort = Some(error.clone());
                    set_item(&ctx, index, ItemState::Failed, attempt, Some(error)).await;
                    break;
                }
            }
        }

        publish_item_events(&ctx, &operation_id, index, total).await;

        if let Some(error) = item_abort {
            skip_remaining(&ctx, index + 1, Some(error.clone())).await;
            aborted = Some(error);
            break;
        }
    }

    ctx.sessions.release(lease).await;

    if let Some(error) = aborted {
        finish_failed(&ctx, &operation_id, error, current_percent(&ctx).await).await;
    } else if cancelled {
        finish_cancelled(&ctx, &operation_id).await;
    } else {
        let summary = Summary::of(&ctx.handle.op.read().await.items);
        let message = format!(
            "Completed: {} succeeded, {} failed",
            summary.succeeded, summary.failed
        );
        finish_completed(&ctx, &operation_id, &message).await;
    }
}

/// Resolve an auto-select filter into operation items, retrying transient
/// driver trouble within the same attempt budget as an extension.
async fn resolve_auto_items(
    ctx: &RunContext,
    operation_id: &str,
    lease: &SessionLease,
    spec: &AutoSelectSpec,
) -> Result<Vec<OperationItem>, ItemError> {
    ctx.progress
        .publish(ProgressEvent::new(
            operation_id,
            ProgressEventKind::Progress,
            0,
            "Resolving eligible bills",
        ))
        .await;

    let mut last_error = None;
    for attempt in 1..=ctx.retry.max_attempts() {
        match lease.resolve_eligible(&spec.filter).await {
            Ok(bills) => {
                info!(
                    "Operation {} resolved {} eligible bill(s)",
                    operation_id,
                    bills.len()
                );
                return Ok(bills
                    .into_iter()
                    .map(|bill| OperationItem::new(bill.ewb_number, spec.defaults.clone()))
                    .collect());
            }
            Err(SessionError::Expired) => {
                return Err(ItemError::new(
                    FailureKind::SessionExpired,
                    "Session expired while resolving eligible bills",
                ));
            }
            Err(e) => {
                warn!(
                    "Operation {} eligibility query failed (attempt {}/{}): {}",
                    operation_id,
                    attempt,
                    ctx.retry.max_attempts(),
                    e
                );
                last_error = Some(ItemError::new(failure_kind(&e), e.to_string()));
                if attempt < ctx.retry.max_attempts() {
                    tokio::time::sleep(ctx.retry.delay_after(attempt)).await;
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| ItemError::new(FailureKind::DriverFault, "Eligibility query failed")))
}

async fn set_item(
    ctx: &RunContext,
    index: usize,
    state: ItemState,
    attempts: u32,
    error: Option<ItemError>,
) {
    let mut op = ctx.handle.op.write().await;
    let item = &mut op.items[index];
    item.state = state;
    item.attempts = attempts;
    if state.is_terminal() {
        // The terminal verdict replaces any earlier transient error.
        item.last_error = error;
    } else if error.is_some() {
        item.last_error = error;
    }
}

/// Mark every non-terminal item from `from` on as skipped.
async fn skip_remaining(ctx: &RunContext, from: usize, error: Option<ItemError>) {
    let mut op = ctx.handle.op.write().await;
    for item in op.items.iter_mut().skip(from) {
        if !item.state.is_terminal() {
            item.state = ItemState::Skipped;
            if item.last_error.is_none() {
                item.last_error = error.clone();
            }
        }
    }
}

async fn current_percent(ctx: &RunContext) -> u8 {
    let op = ctx.handle.op.read().await;
    let total = op.items.len();
    if total == 0 {
        return 0;
    }
    let done = op.items.iter().filter(|i| i.state.is_terminal()).count();
    ((done * 100) / total) as u8
}

/// Publish the per-item completion pair: the item's terminal state, then
/// the updated percentage.
async fn publish_item_events(ctx: &RunContext, operation_id: &str, index: usize, total: usize) {
    let (ref_id, state, error) = {
        let op = ctx.handle.op.read().await;
        let item = &op.items[index];
        (item.ref_id.clone(), item.state, item.last_error.clone())
    };

    let message = match (&state, &error) {
        (ItemState::Succeeded, _) => format!("{} extended", ref_id),
        (_, Some(e)) => format!("{} {:?}: {}", ref_id, state, e.message),
        (_, None) => format!("{} {:?}", ref_id, state),
    };
    let percent = current_percent(ctx).await;

    ctx.progress
        .publish(
            ProgressEvent::new(operation_id, ProgressEventKind::ItemCompleted, percent, message)
                .with_item(&ref_id),
        )
        .await;
    ctx.progress
        .publish(ProgressEvent::new(
            operation_id,
            ProgressEventKind::Progress,
            percent,
            format!("{}/{} items processed", index + 1, total),
        ))
        .await;
}

async fn finalize(ctx: &RunContext, status: OperationStatus, error: Option<ItemError>) {
    let mut op = ctx.handle.op.write().await;
    op.status = status;
    op.completed_at = Some(Utc::now());
    op.summary = Summary::of(&op.items);
    op.error = error;
}

async fn finish_completed(ctx: &RunContext, operation_id: &str, message: &str) {
    finalize(ctx, OperationStatus::Completed, None).await;
    ctx.progress
        .publish(ProgressEvent::new(
            operation_id,
            ProgressEventKind::Completed,
            100,
            message,
        ))
        .await;
    ctx.progress.close(operation_id).await;
    info!("Operation {} completed", operation_id);
}

async fn finish_failed(ctx: &RunContext, operation_id: &str, error: ItemError, percent: u8) {
    skip_remaining(ctx, 0, Some(error.clone())).await;
    finalize(ctx, OperationStatus::Failed, Some(error.clone())).await;
    ctx.progress
        .publish(ProgressEvent::new(
            operation_id,
            ProgressEventKind::Failed,
            percent,
            format!("Operation failed: {}", error.message),
        ))
        .await;
    ctx.progress.close(operation_id).await;
    warn!("Operation {} failed: {:?}", operation_id, error.kind);
}

async fn finish_cancelled(ctx: &RunContext, operation_id: &str) {
    skip_remaining(ctx, 0, None).await;
    let percent = current_percent(ctx).await;
    finalize(ctx, OperationStatus::Cancelled, None).await;
    ctx.progress
        .publish(ProgressEvent::new(
            operation_id,
            ProgressEventKind::Failed,
            percent,
            "Operation cancelled",
        ))
        .await;
    ctx.progress.close(operation_id).await;
    info!("Operation {} cancelled", operation_id);
}
