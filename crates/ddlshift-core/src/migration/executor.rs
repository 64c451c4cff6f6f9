//! Plan execution.
//!
//! An [`ExecutionCoordinator`] owns one plan and drives it through the
//! coordinator state machine:
//!
//! ```text
//! PLANNED -> PREVIEWED                                  (dry run)
//! PLANNED -> [AWAITING_CONFIRMATION ->] EXECUTING -> COMPLETED
//!                                       EXECUTING -> FAILED -> ROLLING_BACK -> ROLLED_BACK
//!                                                                          \-> ROLLBACK_FAILED
//! ```
//!
//! Execution holds the scope lock from before the duplicate check until the
//! history record is written. Batches run in plan order, each in its own
//! transaction unless the whole plan shares one; the lease is renewed before
//! every batch and validated before every commit.

use super::error::{MigrationError, RollbackOutcome};
use super::history::HistoryStore;
use super::lock::{ConcurrencyGuard, LockToken};
use super::observer::{ProgressEvent, ProgressObserver};
use super::plan::{compute_checksum, ConfirmationToken, ExecutionMode, MigrationPlan, PreviewResult};
use super::rollback::{RollbackBatch, RollbackPlan, RollbackStep};
use super::state::{
    CoordinatorState, MigrationRecord, OperationOutcome, OutcomeStatus, RecordStatus,
    StateTransition,
};
use crate::config::{EngineConfig, TransactionScope};
use crate::driver::{ConnectionSource, DdlConnection};
use crate::id::{current_timestamp, generate_hex_id};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Everything a coordinator needs besides the plan.
pub struct ExecutionContext {
    /// Migration history.
    pub history: Arc<dyn HistoryStore>,
    /// Scope locks.
    pub guard: Arc<ConcurrencyGuard>,
    /// DDL connections.
    pub connections: Arc<dyn ConnectionSource>,
    /// Progress sink.
    pub observer: Arc<dyn ProgressObserver>,
    /// Engine settings.
    pub config: EngineConfig,
}

/// Requests cancellation of a running coordinator.
///
/// Cancellation takes effect while awaiting confirmation or between batches,
/// never inside one.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Create an untriggered handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caller-supplied execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Token confirming an interactive plan.
    pub confirmation: Option<ConfirmationToken>,
    /// Accept that some operations cannot be rolled back.
    pub acknowledge_irreversible: bool,
}

impl ExecuteOptions {
    /// Options with nothing confirmed or acknowledged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply a confirmation token.
    pub fn with_confirmation(mut self, token: ConfirmationToken) -> Self {
        self.confirmation = Some(token);
        self
    }

    /// Acknowledge irreversible operations.
    pub fn acknowledge_irreversible(mut self) -> Self {
        self.acknowledge_irreversible = true;
        self
    }
}

/// Why batch execution stopped early.
enum Interruption {
    Failed { batch_index: usize, message: String },
    LeaseLost { batch_index: usize },
    Cancelled { batch_index: usize },
}

impl Interruption {
    fn batch_index(&self) -> usize {
        match self {
            Interruption::Failed { batch_index, .. }
            | Interruption::LeaseLost { batch_index }
            | Interruption::Cancelled { batch_index } => *batch_index,
        }
    }

    fn message(&self) -> String {
        match self {
            Interruption::Failed { batch_index, message } => {
                format!("batch {} failed: {}", batch_index, message)
            }
            Interruption::LeaseLost { batch_index } => {
                format!("lease lost before batch {} committed", batch_index)
            }
            Interruption::Cancelled { batch_index } => {
                format!("cancelled before batch {}", batch_index)
            }
        }
    }
}

struct Stopped {
    cause: Interruption,
    committed: usize,
}

/// Executes one plan.
pub struct ExecutionCoordinator {
    plan: MigrationPlan,
    context: Arc<ExecutionContext>,
    observers: Vec<Arc<dyn ProgressObserver>>,
    state: CoordinatorState,
    transitions: Vec<StateTransition>,
    cancel: CancelHandle,
    started: Instant,
    batch_index: Option<usize>,
}

impl ExecutionCoordinator {
    /// Create a coordinator for a plan.
    pub fn new(plan: MigrationPlan, context: Arc<ExecutionContext>) -> Self {
        let observers = vec![context.observer.clone()];
        Self {
            plan,
            context,
            observers,
            state: CoordinatorState::Planned,
            transitions: Vec::new(),
            cancel: CancelHandle::new(),
            started: Instant::now(),
            batch_index: None,
        }
    }

    /// Also deliver this coordinator's events to `observer`, synchronously.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Current state.
    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// The plan being executed.
    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    /// Transitions taken so far.
    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// A handle that cancels this coordinator from anywhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancel now if awaiting confirmation, otherwise at the next batch boundary.
    pub fn cancel(&mut self) -> Result<(), MigrationError> {
        self.cancel.cancel();
        if self.state == CoordinatorState::AwaitingConfirmation {
            self.transition(CoordinatorState::Cancelled)?;
        }
        Ok(())
    }

    /// Report what execution would do, without touching the database.
    pub fn preview(&mut self) -> Result<PreviewResult, MigrationError> {
        self.plan.verify_checksum()?;
        self.transition(CoordinatorState::Previewed)?;
        Ok(self.plan.preview())
    }

    /// Execute the plan.
    ///
    /// On a batch failure, lease loss or cancellation, committed batches are
    /// rolled back and the error carries the rollback outcome together with
    /// the ID of the history record written for the run.
    #[instrument(skip(self, options), fields(plan_id = %self.plan.id(), scope = %self.plan.scope()))]
    pub fn execute(&mut self, options: &ExecuteOptions) -> Result<MigrationRecord, MigrationError> {
        if !matches!(
            self.state,
            CoordinatorState::Planned | CoordinatorState::AwaitingConfirmation
        ) {
            return Err(MigrationError::InvalidTransition {
                from: self.state,
                to: CoordinatorState::Executing,
            });
        }
        self.plan.verify_checksum()?;

        if self.plan.mode() == ExecutionMode::DryRun {
            return Err(MigrationError::Configuration(
                "dry-run plans are previewed, not executed".to_string(),
            ));
        }

        let rollback = self.plan.rollback_plan();
        if rollback.has_irreversible() && !options.acknowledge_irreversible {
            return Err(MigrationError::IrreversibleNotAcknowledged {
                reasons: rollback.irreversible_reasons(),
            });
        }

        if self.plan.mode() == ExecutionMode::Interactive {
            if self.state == CoordinatorState::Planned {
                self.transition(CoordinatorState::AwaitingConfirmation)?;
            }
            if self.cancel.is_cancelled() {
                self.transition(CoordinatorState::Cancelled)?;
                return Err(MigrationError::Cancelled {
                    rollback: RollbackOutcome::NotNeeded,
                    record_id: None,
                });
            }
            match &options.confirmation {
                None => {
                    return Err(MigrationError::ConfirmationRequired {
                        plan_id: self.plan.id().to_string(),
                    })
                }
                Some(token) if !token.matches(&self.plan) => {
                    return Err(MigrationError::InvalidConfirmation {
                        plan_id: self.plan.id().to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        let context = self.context.clone();
        let mut lease = context.guard.acquire(
            self.plan.scope(),
            &context.config.holder_id,
            context.config.lock_timeout,
        )?;

        let result = self.execute_locked(&mut lease);

        if let Err(e) = context.guard.release(&lease) {
            warn!(scope = %lease.scope, error = %e, "Could not release scope lock");
        }
        result
    }

    fn execute_locked(&mut self, lease: &mut LockToken) -> Result<MigrationRecord, MigrationError> {
        let context = self.context.clone();

        if context.history.has_applied(self.plan.checksum())? {
            info!(checksum = %self.plan.checksum(), "Plan already applied, skipping");
            self.transition(CoordinatorState::AlreadyApplied)?;
            return Err(MigrationError::AlreadyApplied {
                checksum: self.plan.checksum().to_string(),
            });
        }

        let mut conn = context.connections.connect(self.plan.scope())?;
        let whole_plan = context.config.transaction_scope == TransactionScope::WholePlan;
        if whole_plan && !conn.supports_transactional_ddl() {
            return Err(MigrationError::Configuration(
                "whole-plan transactions require transactional DDL".to_string(),
            ));
        }

        self.transition(CoordinatorState::Executing)?;
        let applied_at = current_timestamp();
        let started = Instant::now();
        let mut outcomes = Vec::new();

        info!(
            batches = self.plan.batches().len(),
            operations = self.plan.operation_count(),
            risk = %self.plan.aggregate_risk(),
            "Executing migration plan"
        );

        let stopped = match self.run_batches(conn.as_mut(), lease, whole_plan, &mut outcomes, started) {
            Ok(()) => {
                self.transition(CoordinatorState::Completed)?;
                let record = MigrationRecord::for_plan(
                    &self.plan,
                    RecordStatus::Completed,
                    self.transitions.clone(),
                    outcomes,
                    applied_at,
                    started.elapsed().as_micros() as u64,
                );
                context.history.record(&record)?;
                info!(record_id = %record.id, duration_micros = record.duration_micros, "Migration completed");
                return Ok(record);
            }
            Err(stopped) => stopped,
        };

        let Stopped { cause, committed } = stopped;
        self.batch_index = Some(cause.batch_index());
        warn!(committed, reason = %cause.message(), "Migration interrupted");

        let rollback = match &cause {
            Interruption::Cancelled { .. } => {
                self.transition(CoordinatorState::RollingBack)?;
                self.roll_back(conn.as_mut(), lease, committed, &mut outcomes)
            }
            Interruption::LeaseLost { .. } if committed > 0 => {
                self.transition(CoordinatorState::Failed)?;
                // Committed batches may only be reversed under a fresh lease.
                match context.guard.acquire(
                    self.plan.scope(),
                    &context.config.holder_id,
                    context.config.lock_timeout,
                ) {
                    Ok(fresh) => {
                        info!(fence = fresh.fence, "Reacquired scope lock for rollback");
                        *lease = fresh;
                        self.transition(CoordinatorState::RollingBack)?;
                        self.roll_back(conn.as_mut(), lease, committed, &mut outcomes)
                    }
                    Err(e) => RollbackOutcome::Skipped {
                        reason: format!("lease lost and not reacquired: {}", e),
                    },
                }
            }
            Interruption::Failed { .. } | Interruption::LeaseLost { .. } => {
                self.transition(CoordinatorState::Failed)?;
                self.transition(CoordinatorState::RollingBack)?;
                self.roll_back(conn.as_mut(), lease, committed, &mut outcomes)
            }
        };

        let final_state = if rollback.is_clean() {
            CoordinatorState::RolledBack
        } else {
            mark_unreverted(&mut outcomes, committed);
            CoordinatorState::RollbackFailed
        };
        self.transition(final_state)?;
        if final_state == CoordinatorState::RollbackFailed {
            error!(rollback = %rollback, "Rollback did not complete; manual intervention required");
        }

        let record = MigrationRecord::for_plan(
            &self.plan,
            RecordStatus::from_state(final_state).unwrap_or(RecordStatus::Failed),
            self.transitions.clone(),
            outcomes,
            applied_at,
            started.elapsed().as_micros() as u64,
        )
        .with_error(cause.message());
        context.history.record(&record)?;
        let record_id = Some(record.id.clone());

        Err(match cause {
            Interruption::Failed { batch_index, message } => MigrationError::BatchExecution {
                batch_index,
                message,
                rollback,
                record_id,
            },
            Interruption::LeaseLost { batch_index } => MigrationError::LeaseLost {
                scope: self.plan.scope().to_string(),
                batch_index,
                rollback,
                record_id,
            },
            Interruption::Cancelled { .. } => MigrationError::Cancelled { rollback, record_id },
        })
    }

    /// Run every batch. Returns how many batches committed when stopping early.
    fn run_batches(
        &self,
        conn: &mut dyn DdlConnection,
        lease: &mut LockToken,
        whole_plan: bool,
        outcomes: &mut Vec<OperationOutcome>,
        started: Instant,
    ) -> Result<(), Stopped> {
        let guard = &self.context.guard;
        let mut committed = 0;
        let mut open_from = 0;

        let stop = |cause: Interruption, committed: usize| Stopped { cause, committed };

        if whole_plan {
            if let Err(e) = conn.begin() {
                return Err(stop(
                    Interruption::Failed {
                        batch_index: 0,
                        message: e.to_string(),
                    },
                    0,
                ));
            }
        }

        for batch in self.plan.batches() {
            let batch_index = batch.index;

            if self.cancel.is_cancelled() {
                if whole_plan {
                    abort(conn, outcomes, open_from);
                }
                return Err(stop(Interruption::Cancelled { batch_index }, committed));
            }

            match guard.renew(lease) {
                Ok(renewed) => *lease = renewed,
                Err(_) => {
                    if whole_plan {
                        abort(conn, outcomes, open_from);
                    }
                    return Err(stop(Interruption::LeaseLost { batch_index }, committed));
                }
            }

            if !whole_plan {
                open_from = outcomes.len();
                if let Err(e) = conn.begin() {
                    return Err(stop(
                        Interruption::Failed {
                            batch_index,
                            message: e.to_string(),
                        },
                        committed,
                    ));
                }
            }

            for (operation_index, op) in batch.operations.iter().enumerate() {
                if let Err(e) = conn.apply(op) {
                    outcomes.push(OperationOutcome {
                        batch_index,
                        description: op.describe(),
                        status: OutcomeStatus::Failed,
                        message: Some(e.to_string()),
                    });
                    abort(conn, outcomes, open_from);
                    return Err(stop(
                        Interruption::Failed {
                            batch_index,
                            message: e.to_string(),
                        },
                        committed,
                    ));
                }
                outcomes.push(OperationOutcome {
                    batch_index,
                    description: op.describe(),
                    status: OutcomeStatus::Applied,
                    message: None,
                });
                self.emit(ProgressEvent::OperationApplied {
                    plan_id: self.plan.id().to_string(),
                    batch_index,
                    operation_index,
                    description: op.describe(),
                });
            }

            if !whole_plan {
                if guard.validate(lease).is_err() {
                    abort(conn, outcomes, open_from);
                    return Err(stop(Interruption::LeaseLost { batch_index }, committed));
                }
                if let Err(e) = conn.commit() {
                    abort(conn, outcomes, open_from);
                    return Err(stop(
                        Interruption::Failed {
                            batch_index,
                            message: e.to_string(),
                        },
                        committed,
                    ));
                }
                committed += 1;
                self.emit(ProgressEvent::BatchCommitted {
                    plan_id: self.plan.id().to_string(),
                    batch_index,
                    operation_count: batch.len(),
                    elapsed_micros: started.elapsed().as_micros() as u64,
                });
            }
        }

        if whole_plan {
            let last = self.plan.batches().len().saturating_sub(1);
            if guard.validate(lease).is_err() {
                abort(conn, outcomes, 0);
                return Err(stop(Interruption::LeaseLost { batch_index: last }, 0));
            }
            if let Err(e) = conn.commit() {
                abort(conn, outcomes, 0);
                return Err(stop(
                    Interruption::Failed {
                        batch_index: last,
                        message: e.to_string(),
                    },
                    0,
                ));
            }
            for batch in self.plan.batches() {
                self.emit(ProgressEvent::BatchCommitted {
                    plan_id: self.plan.id().to_string(),
                    batch_index: batch.index,
                    operation_count: batch.len(),
                    elapsed_micros: started.elapsed().as_micros() as u64,
                });
            }
        }

        Ok(())
    }

    /// Undo the first `committed` forward batches.
    fn roll_back(
        &self,
        conn: &mut dyn DdlConnection,
        lease: &mut LockToken,
        committed: usize,
        outcomes: &mut [OperationOutcome],
    ) -> RollbackOutcome {
        if committed == 0 {
            return RollbackOutcome::NotNeeded;
        }
        let batches: Vec<&RollbackBatch> = self.plan.rollback_plan().for_committed(committed).collect();
        match reverse_batches(
            &self.context.guard,
            conn,
            lease,
            &batches,
            false,
            |batch_index, description| {
                self.emit(ProgressEvent::OperationReverted {
                    plan_id: self.plan.id().to_string(),
                    batch_index,
                    description,
                })
            },
        ) {
            Ok(reverted) => {
                for batch in &batches {
                    mark_batch(outcomes, batch.forward_batch, OutcomeStatus::Reverted);
                }
                RollbackOutcome::RolledBack { batches: reverted }
            }
            Err(ReverseFailure { reverted, reason }) => {
                for batch in &batches[..reverted] {
                    mark_batch(outcomes, batch.forward_batch, OutcomeStatus::Reverted);
                }
                RollbackOutcome::Failed { reason }
            }
        }
    }

    fn transition(&mut self, to: CoordinatorState) -> Result<(), MigrationError> {
        if !self.state.can_transition_to(to) {
            return Err(MigrationError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        let from = self.state;
        self.transitions.push(StateTransition::now(from, to));
        self.state = to;
        self.emit(ProgressEvent::StateChanged {
            plan_id: self.plan.id().to_string(),
            scope: self.plan.scope().to_string(),
            from,
            to,
            elapsed_micros: self.started.elapsed().as_micros() as u64,
            batch_index: self.batch_index,
            operation_count: self.plan.operation_count(),
        });
        Ok(())
    }

    fn emit(&self, event: ProgressEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }
}

/// Abort the open transaction and mark its applied operations.
fn abort(conn: &mut dyn DdlConnection, outcomes: &mut [OperationOutcome], open_from: usize) {
    if let Err(e) = conn.rollback() {
        warn!(error = %e, "Transaction abort failed");
    }
    for outcome in outcomes.iter_mut().skip(open_from) {
        if outcome.status == OutcomeStatus::Applied {
            outcome.status = OutcomeStatus::Aborted;
        }
    }
}

fn mark_batch(outcomes: &mut [OperationOutcome], batch_index: usize, status: OutcomeStatus) {
    for outcome in outcomes
        .iter_mut()
        .filter(|o| o.batch_index == batch_index && o.status == OutcomeStatus::Applied)
    {
        outcome.status = status;
    }
}

/// Mark committed operations that are still applied as left in place.
fn mark_unreverted(outcomes: &mut [OperationOutcome], committed: usize) {
    for batch_index in 0..committed {
        mark_batch(outcomes, batch_index, OutcomeStatus::RevertFailed);
    }
}

/// Why reversal stopped. The first `reverted` batches were undone.
struct ReverseFailure {
    reverted: usize,
    reason: String,
}

/// Execute rollback batches in order, one transaction each.
///
/// Irreversible steps abort before anything runs unless `skip_irreversible`
/// is set. Returns the number of batches reversed.
fn reverse_batches(
    guard: &ConcurrencyGuard,
    conn: &mut dyn DdlConnection,
    lease: &mut LockToken,
    batches: &[&RollbackBatch],
    skip_irreversible: bool,
    mut on_reverted: impl FnMut(usize, String),
) -> Result<usize, ReverseFailure> {
    if !skip_irreversible {
        let irreversible: Vec<String> = batches
            .iter()
            .flat_map(|b| b.steps.iter())
            .filter(|s| !s.is_reversible())
            .map(RollbackStep::describe)
            .collect();
        if !irreversible.is_empty() {
            return Err(ReverseFailure {
                reverted: 0,
                reason: irreversible.join("; "),
            });
        }
    }

    let mut reverted = 0;
    for batch in batches {
        let stop = |reason: String| ReverseFailure { reverted, reason };

        *lease = guard.renew(lease).map_err(|e| {
            stop(format!("before reversing batch {}: {}", batch.forward_batch, e))
        })?;

        conn.begin().map_err(|e| stop(e.to_string()))?;
        for step in &batch.steps {
            let Some(op) = step.operation() else {
                warn!(step = %step.describe(), "Skipping irreversible step");
                continue;
            };
            if let Err(e) = conn.apply(op) {
                if let Err(abort_err) = conn.rollback() {
                    warn!(error = %abort_err, "Transaction abort failed");
                }
                return Err(stop(format!("{}: {}", op.describe(), e)));
            }
            on_reverted(batch.forward_batch, op.describe());
        }

        if let Err(e) = guard.validate(lease) {
            if let Err(abort_err) = conn.rollback() {
                warn!(error = %abort_err, "Transaction abort failed");
            }
            return Err(stop(e.to_string()));
        }
        conn.commit().map_err(|e| stop(e.to_string()))?;
        reverted += 1;
    }
    Ok(reverted)
}

/// Roll back a completed execution.
///
/// On success the original record gets a `ROLLED_BACK` transition appended.
/// On failure a new `FAILED` record pointing at the original is written and
/// `RollbackFailure` is returned.
#[instrument(skip(context))]
pub fn rollback_record(
    context: &ExecutionContext,
    record_id: &str,
    acknowledge_irreversible: bool,
) -> Result<MigrationRecord, MigrationError> {
    let record = context
        .history
        .get(record_id)?
        .ok_or_else(|| MigrationError::RecordNotFound {
            record_id: record_id.to_string(),
        })?;

    if record.status != RecordStatus::Completed {
        return Err(MigrationError::InvalidTransition {
            from: record.final_state().unwrap_or(CoordinatorState::Planned),
            to: CoordinatorState::RolledBack,
        });
    }
    record.verify_checksum()?;

    let rollback_plan = &record.rollback_plan;
    if rollback_plan.has_irreversible() && !acknowledge_irreversible {
        return Err(MigrationError::IrreversibleNotAcknowledged {
            reasons: rollback_plan.irreversible_reasons(),
        });
    }

    let mut lease = context.guard.acquire(
        &record.scope,
        &context.config.holder_id,
        context.config.lock_timeout,
    )?;
    let result = rollback_locked(context, &record, &mut lease);
    if let Err(e) = context.guard.release(&lease) {
        warn!(scope = %lease.scope, error = %e, "Could not release scope lock");
    }
    result
}

fn rollback_locked(
    context: &ExecutionContext,
    record: &MigrationRecord,
    lease: &mut LockToken,
) -> Result<MigrationRecord, MigrationError> {
    // Re-read under the lock so two rollbacks of one record cannot both run.
    let current = context
        .history
        .get(&record.id)?
        .ok_or_else(|| MigrationError::RecordNotFound {
            record_id: record.id.clone(),
        })?;
    if current.status != RecordStatus::Completed {
        return Err(MigrationError::InvalidTransition {
            from: current.final_state().unwrap_or(CoordinatorState::Planned),
            to: CoordinatorState::RolledBack,
        });
    }

    let started = Instant::now();
    let applied_at = current_timestamp();
    let emit_state = |from: CoordinatorState, to: CoordinatorState, batch_index: Option<usize>| {
        context.observer.on_event(&ProgressEvent::StateChanged {
            plan_id: record.plan_id.clone(),
            scope: record.scope.clone(),
            from,
            to,
            elapsed_micros: started.elapsed().as_micros() as u64,
            batch_index,
            operation_count: record.rollback_plan.step_count(),
        })
    };
    emit_state(CoordinatorState::Completed, CoordinatorState::RollingBack, None);

    let batches: Vec<&RollbackBatch> = record.rollback_plan.batches().iter().collect();
    let mut outcomes = Vec::new();
    let result = match context.connections.connect(&record.scope) {
        Ok(mut conn) => reverse_batches(
            &context.guard,
            conn.as_mut(),
            lease,
            &batches,
            true,
            |batch_index, description| {
                outcomes.push(OperationOutcome {
                    batch_index,
                    description: description.clone(),
                    status: OutcomeStatus::Applied,
                    message: None,
                });
                context.observer.on_event(&ProgressEvent::OperationReverted {
                    plan_id: record.plan_id.clone(),
                    batch_index,
                    description,
                });
            },
        ),
        Err(e) => Err(ReverseFailure {
            reverted: 0,
            reason: e.to_string(),
        }),
    };

    match result {
        Ok(reverted) => {
            emit_state(CoordinatorState::RollingBack, CoordinatorState::RolledBack, None);
            let updated = context.history.append_transition(
                &record.id,
                StateTransition::now(CoordinatorState::Completed, CoordinatorState::RolledBack),
            )?;
            info!(record_id = %record.id, batches = reverted, "Migration rolled back");
            Ok(updated)
        }
        Err(ReverseFailure { reverted, reason }) => {
            emit_state(CoordinatorState::RollingBack, CoordinatorState::RollbackFailed, None);
            error!(record_id = %record.id, reverted, reason = %reason, "Explicit rollback failed");

            let operations: Vec<_> = record
                .rollback_plan
                .steps()
                .filter_map(RollbackStep::operation)
                .cloned()
                .collect();
            let failed = MigrationRecord {
                id: generate_hex_id(),
                plan_id: record.plan_id.clone(),
                scope: record.scope.clone(),
                checksum: compute_checksum(&record.scope, &operations)?,
                applied_at,
                status: RecordStatus::Failed,
                transitions: vec![
                    StateTransition::now(CoordinatorState::Completed, CoordinatorState::RollingBack),
                    StateTransition::now(
                        CoordinatorState::RollingBack,
                        CoordinatorState::RollbackFailed,
                    ),
                ],
                outcomes,
                duration_micros: started.elapsed().as_micros() as u64,
                operations,
                aggregate_risk: record.aggregate_risk,
                rollback_plan: RollbackPlan::default(),
                rollback_of: Some(record.id.clone()),
                error: Some(reason.clone()),
            };
            context.history.record(&failed)?;
            Err(MigrationError::RollbackFailure {
                reason,
                record_id: Some(failed.id),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::AnsiSqlRenderer;
    use crate::driver::MemoryDatabase;
    use crate::migration::diff::SchemaDiff;
    use crate::migration::error::RiskLevel;
    use crate::migration::history::MemoryHistoryStore;
    use crate::migration::lock::MemoryLockStore;
    use crate::migration::observer::NullObserver;
    use crate::migration::operation::OperationKind;
    use crate::migration::plan::MigrationPlanner;
    use crate::schema::{ColumnSpec, IndexSpec, LogicalType, SchemaSnapshot, TableSpec};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn user_table() -> TableSpec {
        TableSpec::new("user")
            .with_column(ColumnSpec::new("id", LogicalType::Uuid))
            .with_row_count(10)
    }

    fn setup() -> (MemoryDatabase, Arc<MemoryHistoryStore>, Arc<ExecutionContext>) {
        let db = MemoryDatabase::new();
        db.seed(SchemaSnapshot::new("app").with_table(user_table()));
        let history = Arc::new(MemoryHistoryStore::new());
        let config = EngineConfig::new().with_lock_timeout(Duration::from_millis(200));
        let context = Arc::new(ExecutionContext {
            history: history.clone(),
            guard: Arc::new(ConcurrencyGuard::new(
                Arc::new(MemoryLockStore::new()),
                config.lease_duration,
                config.lock_poll_interval,
            )),
            connections: Arc::new(db.clone()),
            observer: Arc::new(NullObserver),
            config,
        });
        (db, history, context)
    }

    fn plan_for(db: &MemoryDatabase, desired: &SchemaSnapshot, mode: ExecutionMode) -> MigrationPlan {
        let observed = db.snapshot("app");
        let ops = SchemaDiff::compute(desired, &observed).unwrap().into_operations();
        MigrationPlanner::new(Arc::new(AnsiSqlRenderer::new()))
            .plan("app", ops, RiskLevel::High, mode)
            .unwrap()
    }

    fn with_phone_and_index() -> SchemaSnapshot {
        SchemaSnapshot::new("app").with_table(
            user_table()
                .with_column(ColumnSpec::nullable("phone", LogicalType::Text))
                .with_index(IndexSpec::new("user_phone_idx", ["phone"])),
        )
    }

    #[test]
    fn test_auto_confirm_completes() {
        let (db, history, context) = setup();
        let plan = plan_for(&db, &with_phone_and_index(), ExecutionMode::AutoConfirm);
        let mut coordinator = ExecutionCoordinator::new(plan, context);

        let record = coordinator.execute(&ExecuteOptions::new()).unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Completed);
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(
            record.transitions.iter().map(|t| t.to).collect::<Vec<_>>(),
            vec![CoordinatorState::Executing, CoordinatorState::Completed]
        );
        assert!(record.outcomes.iter().all(|o| o.status == OutcomeStatus::Applied));
        assert_eq!(history.len(), 1);
        assert!(SchemaDiff::compute(&with_phone_and_index(), &db.snapshot("app"))
            .unwrap()
            .is_empty());

        // A coordinator runs its plan once.
        assert!(matches!(
            coordinator.execute(&ExecuteOptions::new()),
            Err(MigrationError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_interactive_requires_matching_token() {
        let (db, _history, context) = setup();
        let plan = plan_for(&db, &with_phone_and_index(), ExecutionMode::Interactive);
        let token = ConfirmationToken::for_plan(&plan);
        let mut coordinator = ExecutionCoordinator::new(plan, context);

        assert!(matches!(
            coordinator.execute(&ExecuteOptions::new()),
            Err(MigrationError::ConfirmationRequired { .. })
        ));
        assert_eq!(coordinator.state(), CoordinatorState::AwaitingConfirmation);
        assert_eq!(db.mutation_count(), 0);

        assert!(matches!(
            coordinator.execute(&ExecuteOptions::new().with_confirmation(ConfirmationToken::new("bogus"))),
            Err(MigrationError::InvalidConfirmation { .. })
        ));

        let record = coordinator
            .execute(&ExecuteOptions::new().with_confirmation(token))
            .unwrap();
        assert_eq!(record.transitions[0].to, CoordinatorState::AwaitingConfirmation);
    }

    #[test]
    fn test_cancel_while_awaiting_confirmation() {
        let (db, history, context) = setup();
        let plan = plan_for(&db, &with_phone_and_index(), ExecutionMode::Interactive);
        let mut coordinator = ExecutionCoordinator::new(plan, context);

        let _ = coordinator.execute(&ExecuteOptions::new());
        coordinator.cancel().unwrap();
        assert_eq!(coordinator.state(), CoordinatorState::Cancelled);
        assert!(history.is_empty());
        assert_eq!(db.mutation_count(), 0);
    }

    #[test]
    fn test_dry_run_previews_only() {
        let (db, _history, context) = setup();
        let plan = plan_for(&db, &with_phone_and_index(), ExecutionMode::DryRun);
        let checksum = plan.checksum().to_string();
        let mut coordinator = ExecutionCoordinator::new(plan, context);

        let preview = coordinator.preview().unwrap();
        assert_eq!(preview.checksum, checksum);
        assert_eq!(coordinator.state(), CoordinatorState::Previewed);
        assert!(coordinator.execute(&ExecuteOptions::new()).is_err());
        assert_eq!(db.mutation_count(), 0);
    }

    #[test]
    fn test_failed_batch_rolls_back_committed_batches() {
        let (db, history, context) = setup();
        let desired = SchemaSnapshot::new("app").with_table(
            user_table()
                .with_column(ColumnSpec::nullable("phone", LogicalType::Text))
                .with_index(IndexSpec::new("user_phone_idx", ["phone"])),
        );
        let mut plan = plan_for(&db, &desired, ExecutionMode::AutoConfirm);
        // Split into two batches: ADD_COLUMN, then ADD_INDEX.
        plan = MigrationPlanner::new(Arc::new(AnsiSqlRenderer::new()))
            .with_max_batch_size(Some(1))
            .plan("app", plan.operations().cloned().collect(), RiskLevel::High, ExecutionMode::AutoConfirm)
            .unwrap();
        assert_eq!(plan.batches().len(), 2);

        db.fail_when(|op| op.kind() == OperationKind::AddIndex);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let mut coordinator = ExecutionCoordinator::new(plan, context).with_observer(Arc::new(
            move |e: &ProgressEvent| sink.lock().push(e.clone()),
        ));

        let err = coordinator.execute(&ExecuteOptions::new()).unwrap_err();
        match &err {
            MigrationError::BatchExecution {
                batch_index,
                rollback,
                record_id,
                ..
            } => {
                assert_eq!(*batch_index, 1);
                assert_eq!(*rollback, RollbackOutcome::RolledBack { batches: 1 });
                assert!(record_id.is_some());
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!err.requires_intervention());
        assert_eq!(coordinator.state(), CoordinatorState::RolledBack);
        assert_eq!(db.snapshot("app"), SchemaSnapshot::new("app").with_table(user_table()));

        let record = history.get(err.record_id().unwrap()).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::RolledBack);
        let statuses: Vec<_> = record.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(statuses, vec![OutcomeStatus::Reverted, OutcomeStatus::Failed]);

        let events = events.lock();
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::OperationReverted { batch_index: 0, .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            ProgressEvent::StateChanged {
                to: CoordinatorState::RollingBack,
                ..
            }
        )));
    }

    #[test]
    fn test_partial_rollback_marks_only_unreverted_batches() {
        let (db, history, context) = setup();
        let desired = SchemaSnapshot::new("app").with_table(
            user_table()
                .with_column(ColumnSpec::nullable("phone", LogicalType::Text))
                .with_column(ColumnSpec::nullable("email", LogicalType::Text))
                .with_index(IndexSpec::new("user_phone_idx", ["phone"])),
        );
        let ops = plan_for(&db, &desired, ExecutionMode::AutoConfirm)
            .operations()
            .cloned()
            .collect();
        // ADD_COLUMN email, ADD_COLUMN phone, ADD_INDEX, one batch each.
        let plan = MigrationPlanner::new(Arc::new(AnsiSqlRenderer::new()))
            .with_max_batch_size(Some(1))
            .plan("app", ops, RiskLevel::High, ExecutionMode::AutoConfirm)
            .unwrap();
        assert_eq!(plan.batches().len(), 3);

        db.fail_when(|op| op.kind() == OperationKind::AddIndex);
        db.fail_when(|op| op.describe() == "DROP_COLUMN user.email");
        let mut coordinator = ExecutionCoordinator::new(plan, context);

        let err = coordinator.execute(&ExecuteOptions::new()).unwrap_err();
        match &err {
            MigrationError::BatchExecution {
                batch_index,
                rollback: RollbackOutcome::Failed { reason },
                ..
            } => {
                assert_eq!(*batch_index, 2);
                assert!(reason.contains("DROP_COLUMN user.email"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(coordinator.state(), CoordinatorState::RollbackFailed);

        // Batch 1 was undone before reversal of batch 0 failed.
        let user = db.snapshot("app");
        let user = user.table("user").unwrap();
        assert!(user.has_column("email"));
        assert!(!user.has_column("phone"));

        let record = history.get(err.record_id().unwrap()).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        let statuses: Vec<_> = record.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![OutcomeStatus::RevertFailed, OutcomeStatus::Reverted, OutcomeStatus::Failed]
        );
    }

    #[test]
    fn test_irreversible_plan_needs_acknowledgement() {
        let (db, _history, context) = setup();
        db.seed(
            SchemaSnapshot::new("app").with_table(
                user_table().with_column(ColumnSpec::nullable("legacy_code", LogicalType::Text)),
            ),
        );
        let plan = plan_for(
            &db,
            &SchemaSnapshot::new("app").with_table(user_table()),
            ExecutionMode::AutoConfirm,
        );
        let mut coordinator = ExecutionCoordinator::new(plan, context);

        assert!(matches!(
            coordinator.execute(&ExecuteOptions::new()),
            Err(MigrationError::IrreversibleNotAcknowledged { .. })
        ));
        assert_eq!(coordinator.state(), CoordinatorState::Planned);
        coordinator
            .execute(&ExecuteOptions::new().acknowledge_irreversible())
            .unwrap();
        assert!(!db.snapshot("app").table("user").unwrap().has_column("legacy_code"));
    }

    #[test]
    fn test_explicit_rollback() {
        let (db, history, context) = setup();
        let before = db.snapshot("app");
        let plan = plan_for(&db, &with_phone_and_index(), ExecutionMode::AutoConfirm);
        let record = ExecutionCoordinator::new(plan, context.clone())
            .execute(&ExecuteOptions::new())
            .unwrap();

        let rolled = rollback_record(&context, &record.id, false).unwrap();
        assert_eq!(rolled.status, RecordStatus::RolledBack);
        assert_eq!(db.snapshot("app"), before);
        assert!(!history.has_applied(&record.checksum).unwrap());

        assert!(matches!(
            rollback_record(&context, &record.id, false),
            Err(MigrationError::InvalidTransition { .. })
        ));
        assert!(matches!(
            rollback_record(&context, "missing", false),
            Err(MigrationError::RecordNotFound { .. })
        ));
    }

    #[test]
    fn test_failed_explicit_rollback_writes_failed_record() {
        let (db, history, context) = setup();
        let plan = plan_for(&db, &with_phone_and_index(), ExecutionMode::AutoConfirm);
        let record = ExecutionCoordinator::new(plan, context.clone())
            .execute(&ExecuteOptions::new())
            .unwrap();

        db.fail_when(|op| op.kind() == OperationKind::DropIndex);
        let err = rollback_record(&context, &record.id, false).unwrap_err();
        assert!(err.requires_intervention());

        let failed = history.get(err.record_id().unwrap()).unwrap().unwrap();
        assert_eq!(failed.status, RecordStatus::Failed);
        assert_eq!(failed.rollback_of.as_deref(), Some(record.id.as_str()));
        failed.verify_checksum().unwrap();

        // The original stays applied.
        assert_eq!(history.get(&record.id).unwrap().unwrap().status, RecordStatus::Completed);
        assert!(db.snapshot("app").table("user").unwrap().has_column("phone"));
    }
}
