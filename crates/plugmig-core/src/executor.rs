//! Migration executor: ordered step execution, rollback, and audit results.
//!
//! Runs each migration of a plan in order, each step in intra-migration
//! dependency order, inside the transactional scope the step declares. On
//! step failure the migration's `down` steps run in reverse for everything
//! that already succeeded; whether the plan continues is the caller's
//! choice. A failed rollback is fatal and is never retried.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::connection::Connection;
use crate::dialect::DialectAdapter;
use crate::graph::DependencyGraph;
use crate::model::{Migration, Step};
use crate::plan::{MigrationPlan, PlanDirection};
use crate::registry::{AppliedMigration, PluginRegistry, RegistryError};
use crate::transform::{TransformEngine, TransformReport};

/// Execution options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Render and validate every step without executing SQL.
    pub dry_run: bool,
    /// Continue to the next migration after a failure instead of aborting
    /// the plan.
    pub continue_on_error: bool,
    /// Skip the backup gate for migrations that request one.
    pub skip_backup: bool,
}

/// Final status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// The step ran (or validated, in a dry run) successfully.
    Succeeded,
    /// The step failed.
    Failed,
    /// The step was not attempted.
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Final status of one migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// All steps succeeded.
    Succeeded,
    /// A step failed and no rollback was performed (down plans, backup
    /// failures).
    Failed,
    /// A step failed and the completed steps were rolled back.
    RolledBack,
    /// The migration was not attempted.
    Skipped,
}

impl std::fmt::Display for MigrationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationOutcome::Succeeded => write!(f, "succeeded"),
            MigrationOutcome::Failed => write!(f, "failed"),
            MigrationOutcome::RolledBack => write!(f, "rolled_back"),
            MigrationOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// Audit record for one step.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// The step id.
    pub step_id: String,
    /// Final status.
    pub status: StepStatus,
    /// Statement as rendered for the active engine, when SQL ran.
    pub statement: Option<String>,
    /// Affected row count, when reported.
    pub rows_affected: Option<u64>,
    /// Transform accounting, for data steps.
    pub transform: Option<TransformReport>,
    /// Failure message.
    pub error: Option<String>,
    /// When the step started.
    pub started_at: DateTime<Utc>,
    /// When the step finished.
    pub finished_at: DateTime<Utc>,
}

/// Audit record for one migration.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// The migration id.
    pub migration_id: String,
    /// Final status.
    pub status: MigrationOutcome,
    /// Per-step records, in execution order (rollback steps appended).
    pub step_results: Vec<StepResult>,
    /// Declared semantic gaps and skipped failures.
    pub warnings: Vec<String>,
    /// Backup taken before execution, if any.
    pub backup_id: Option<String>,
    /// Top-level failure message.
    pub error: Option<String>,
    /// When the migration started.
    pub started_at: DateTime<Utc>,
    /// When the migration finished.
    pub finished_at: DateTime<Utc>,
}

/// Backup gate failure, surfaced to the failing migration's result.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct BackupGateError(pub String);

/// Creates and verifies a backup before a gated migration runs.
///
/// The gate must only return once the backup is verified; destructive
/// steps never execute without a verified backup on record.
#[async_trait]
pub trait BackupGate: Send + Sync {
    /// Create and verify a backup covering `scope`, returning its id.
    async fn create_verified_backup(
        &self,
        conn: &dyn Connection,
        plugin_id: &str,
        scope: &[String],
    ) -> Result<String, BackupGateError>;
}

/// Caller-initiated cancellation, honored at step boundaries only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Fatal execution errors. Step and migration failures are reported inside
/// [`ExecutionResult`]s; these abort the plan outright.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The applied set changed between plan build and execution.
    #[error("plan for plugin {plugin_id} is stale: applied migrations changed since it was built")]
    PlanStale {
        /// The affected plugin.
        plugin_id: String,
    },

    /// A `down` step failed during rollback. Manual intervention (restore
    /// from backup) is required; no second-order rollback is attempted.
    #[error("rollback of migration {migration_id} failed at step {step_id}: {reason}")]
    RollbackFailed {
        /// The migration being rolled back.
        migration_id: String,
        /// The failing down step.
        step_id: String,
        /// Why it failed.
        reason: String,
    },

    /// Registry access failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

enum StepFailure {
    /// Step failed; normal failure policy applies.
    Error(String),
}

struct StepSuccess {
    statement: Option<String>,
    rows_affected: Option<u64>,
    transform: Option<TransformReport>,
}

/// Executes migration plans.
pub struct MigrationExecutor {
    dialect: DialectAdapter,
    transforms: TransformEngine,
    registry: Arc<dyn PluginRegistry>,
    backup_gate: Option<Arc<dyn BackupGate>>,
}

impl MigrationExecutor {
    /// Executor over a registry, with the standard dialect table and a
    /// default transform engine.
    pub fn new(registry: Arc<dyn PluginRegistry>) -> Self {
        Self {
            dialect: DialectAdapter::new(),
            transforms: TransformEngine::default(),
            registry,
            backup_gate: None,
        }
    }

    /// Wire in a backup gate. Without one, backup-gated migrations fail.
    pub fn with_backup_gate(mut self, gate: Arc<dyn BackupGate>) -> Self {
        self.backup_gate = Some(gate);
        self
    }

    /// Replace the transform engine (custom registries, tuned abort rate).
    pub fn with_transform_engine(mut self, transforms: TransformEngine) -> Self {
        self.transforms = transforms;
        self
    }

    /// Execute a plan.
    pub async fn execute(
        &self,
        plan: &MigrationPlan,
        conn: &dyn Connection,
        options: &ExecuteOptions,
    ) -> Result<Vec<ExecutionResult>, ExecuteError> {
        self.execute_with_cancel(plan, conn, options, &CancelToken::new())
            .await
    }

    /// Execute a plan with a cancellation token. Cancellation is honored at
    /// step boundaries and treated like a step timeout: completed steps are
    /// rolled back.
    pub async fn execute_with_cancel(
        &self,
        plan: &MigrationPlan,
        conn: &dyn Connection,
        options: &ExecuteOptions,
        cancel: &CancelToken,
    ) -> Result<Vec<ExecutionResult>, ExecuteError> {
        let mut results = Vec::with_capacity(plan.migrations.len());
        let mut expected: HashSet<String> = plan.applied_snapshot.iter().cloned().collect();
        let mut aborted = false;

        for migration in &plan.migrations {
            if aborted || cancel.is_cancelled() {
                results.push(skipped_result(migration, "plan aborted"));
                continue;
            }

            if !options.dry_run {
                self.check_not_stale(plan, &expected).await?;
            }

            tracing::info!(
                plugin = %plan.plugin_id,
                migration = %migration.id,
                direction = %plan.direction,
                dry_run = options.dry_run,
                "executing migration"
            );

            let result = self
                .run_migration(plan, migration, conn, options, cancel)
                .await?;

            let succeeded = result.status == MigrationOutcome::Succeeded;
            if succeeded && !options.dry_run {
                self.record_outcome(plan, migration, &result).await?;
                match plan.direction {
                    PlanDirection::Up => {
                        expected.insert(migration.id.clone());
                    }
                    PlanDirection::Down => {
                        expected.remove(&migration.id);
                    }
                }
            }

            if !succeeded && !options.continue_on_error {
                aborted = true;
            }
            results.push(result);
        }

        Ok(results)
    }

    async fn check_not_stale(
        &self,
        plan: &MigrationPlan,
        expected: &HashSet<String>,
    ) -> Result<(), ExecuteError> {
        let applied_now: HashSet<String> = self
            .registry
            .applied(&plan.plugin_id)
            .await?
            .into_iter()
            .map(|a| a.migration_id)
            .collect();
        if applied_now != *expected {
            return Err(ExecuteError::PlanStale {
                plugin_id: plan.plugin_id.clone(),
            });
        }
        Ok(())
    }

    async fn record_outcome(
        &self,
        plan: &MigrationPlan,
        migration: &Migration,
        result: &ExecutionResult,
    ) -> Result<(), ExecuteError> {
        match plan.direction {
            PlanDirection::Up => {
                self.registry
                    .record_applied(
                        &plan.plugin_id,
                        AppliedMigration {
                            migration_id: migration.id.clone(),
                            version: migration.version.clone(),
                            applied_at: Utc::now(),
                            backup_id: result.backup_id.clone(),
                        },
                    )
                    .await?;
                let current = self.registry.current_version(&plan.plugin_id).await?;
                if current.map_or(true, |c| migration.version > c) {
                    self.registry
                        .set_current_version(&plan.plugin_id, Some(migration.version.clone()))
                        .await?;
                }
            }
            PlanDirection::Down => {
                self.registry
                    .remove_applied(&plan.plugin_id, &migration.id)
                    .await?;
                let remaining = self.registry.applied(&plan.plugin_id).await?;
                let new_version = remaining.iter().map(|a| a.version.clone()).max();
                self.registry
                    .set_current_version(&plan.plugin_id, new_version)
                    .await?;
            }
        }
        Ok(())
    }

    async fn run_migration(
        &self,
        plan: &MigrationPlan,
        migration: &Migration,
        conn: &dyn Connection,
        options: &ExecuteOptions,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ExecuteError> {
        let started_at = Utc::now();
        let mut warnings = Vec::new();
        let mut backup_id = None;

        if migration.requires_backup && !options.skip_backup && !options.dry_run {
            match self.create_backup(conn, plan, migration).await {
                Ok(id) => backup_id = Some(id),
                Err(reason) => {
                    tracing::warn!(
                        migration = %migration.id,
                        %reason,
                        "backup gate refused execution"
                    );
                    return Ok(ExecutionResult {
                        migration_id: migration.id.clone(),
                        status: MigrationOutcome::Failed,
                        step_results: Vec::new(),
                        warnings,
                        backup_id: None,
                        error: Some(reason),
                        started_at,
                        finished_at: Utc::now(),
                    });
                }
            }
        }

        let steps = match plan.direction {
            PlanDirection::Up => ordered_up_steps(migration),
            // Down plans run the authored reverse sequence as written.
            PlanDirection::Down => migration.steps.down.iter().collect(),
        };

        let mut step_results: Vec<StepResult> = Vec::with_capacity(steps.len());
        let mut succeeded_steps: Vec<&Step> = Vec::new();
        let mut outcome = MigrationOutcome::Succeeded;
        let mut error = None;

        for step in steps {
            if cancel.is_cancelled() {
                let failure = "execution cancelled at step boundary".to_string();
                step_results.push(failed_step_result(step, failure.clone()));
                error = Some(failure);
                outcome = if options.dry_run {
                    MigrationOutcome::Failed
                } else {
                    self.fail_and_roll_back(plan, migration, &succeeded_steps, conn, &mut step_results, &mut warnings)
                        .await?
                };
                break;
            }

            let result = self.run_step(step, conn, options).await;
            let status = result.status;
            let step_error = result.error.clone();
            step_results.push(result);

            match status {
                StepStatus::Succeeded => {
                    if !step.transactional && !options.dry_run {
                        warnings.push(format!(
                            "step {} is not transactional; rollback cannot undo it",
                            step.id
                        ));
                    }
                    succeeded_steps.push(step);
                }
                StepStatus::Skipped => {}
                StepStatus::Failed => {
                    if step.skip_on_error {
                        let message = step_error.unwrap_or_else(|| "unknown error".to_string());
                        tracing::warn!(
                            migration = %migration.id,
                            step = %step.id,
                            error = %message,
                            "step failed; continuing (skip_on_error)"
                        );
                        warnings.push(format!("step {} failed and was skipped: {message}", step.id));
                        continue;
                    }

                    error = step_error;
                    // A dry run must not execute down steps either; report
                    // the failure and stop.
                    outcome = if options.dry_run {
                        MigrationOutcome::Failed
                    } else {
                        self.fail_and_roll_back(plan, migration, &succeeded_steps, conn, &mut step_results, &mut warnings)
                            .await?
                    };
                    break;
                }
            }
        }

        Ok(ExecutionResult {
            migration_id: migration.id.clone(),
            status: outcome,
            step_results,
            warnings,
            backup_id,
            error,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn create_backup(
        &self,
        conn: &dyn Connection,
        plan: &MigrationPlan,
        migration: &Migration,
    ) -> Result<String, String> {
        let gate = self
            .backup_gate
            .as_ref()
            .ok_or_else(|| "migration requires a backup but no backup manager is configured".to_string())?;
        gate.create_verified_backup(conn, &plan.plugin_id, &migration.backup_scope())
            .await
            .map_err(|e| format!("backup failed: {}", e.0))
    }

    /// Roll back succeeded steps of an up migration, in reverse order. Down
    /// plans are already the reverse path; their failures are terminal
    /// without second-order rollback.
    async fn fail_and_roll_back(
        &self,
        plan: &MigrationPlan,
        migration: &Migration,
        succeeded: &[&Step],
        conn: &dyn Connection,
        step_results: &mut Vec<StepResult>,
        warnings: &mut Vec<String>,
    ) -> Result<MigrationOutcome, ExecuteError> {
        if plan.direction == PlanDirection::Down {
            return Ok(MigrationOutcome::Failed);
        }
        if succeeded.is_empty() {
            return Ok(MigrationOutcome::RolledBack);
        }

        tracing::warn!(
            migration = %migration.id,
            steps = succeeded.len(),
            "rolling back completed steps"
        );

        for step in succeeded.iter().rev() {
            if !step.rollback_supported {
                warnings.push(format!(
                    "step {} does not support rollback; its changes remain",
                    step.id
                ));
                continue;
            }
            let Some(down) = migration.down_step(&step.id) else {
                warnings.push(format!("step {} has no down step; its changes remain", step.id));
                continue;
            };

            let result = self
                .run_step(down, conn, &ExecuteOptions::default())
                .await;
            let failed = result.status == StepStatus::Failed;
            let reason = result.error.clone();
            step_results.push(result);

            if failed {
                return Err(ExecuteError::RollbackFailed {
                    migration_id: migration.id.clone(),
                    step_id: step.id.clone(),
                    reason: reason.unwrap_or_else(|| "unknown error".to_string()),
                });
            }
        }

        Ok(MigrationOutcome::RolledBack)
    }

    async fn run_step(
        &self,
        step: &Step,
        conn: &dyn Connection,
        options: &ExecuteOptions,
    ) -> StepResult {
        let started_at = Utc::now();

        if options.dry_run {
            return self.dry_run_step(step, conn, started_at);
        }

        let outcome = tokio::time::timeout(step.timeout(), self.run_step_body(step, conn)).await;
        let (status, statement, rows_affected, transform, error) = match outcome {
            Ok(Ok(success)) => (
                StepStatus::Succeeded,
                success.statement,
                success.rows_affected,
                success.transform,
                None,
            ),
            Ok(Err(StepFailure::Error(message))) => {
                (StepStatus::Failed, None, None, None, Some(message))
            }
            Err(_) => {
                // The statement future was dropped mid-flight; make sure no
                // transaction lingers.
                if step.transactional {
                    let _ = conn.rollback().await;
                }
                (
                    StepStatus::Failed,
                    None,
                    None,
                    None,
                    Some(format!("step timed out after {}ms", step.timeout_ms)),
                )
            }
        };

        StepResult {
            step_id: step.id.clone(),
            status,
            statement,
            rows_affected,
            transform,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn dry_run_step(
        &self,
        step: &Step,
        conn: &dyn Connection,
        started_at: DateTime<Utc>,
    ) -> StepResult {
        let mut error = None;
        let mut statement = None;

        if let Some(spec) = &step.transform {
            if let Err(e) = self.transforms.validate_spec(spec) {
                error = Some(e.to_string());
            }
        }
        if error.is_none() && (!step.sql.is_empty() || step.transform.is_none()) {
            match self.dialect.render(&step.sql, conn.engine()) {
                Ok(rendered) => statement = Some(rendered),
                Err(e) => error = Some(e.to_string()),
            }
        }
        for (label, predicate) in [
            ("pre-validation", &step.pre_validation),
            ("post-validation", &step.post_validation),
        ] {
            if error.is_none() {
                if let Some(sql) = predicate {
                    if sql.trim().is_empty() {
                        error = Some(format!("{label} predicate is empty"));
                    }
                }
            }
        }

        StepResult {
            step_id: step.id.clone(),
            status: if error.is_none() {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            },
            statement,
            rows_affected: None,
            transform: None,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_step_body(
        &self,
        step: &Step,
        conn: &dyn Connection,
    ) -> Result<StepSuccess, StepFailure> {
        if step.transactional {
            conn.begin()
                .await
                .map_err(|e| StepFailure::Error(format!("failed to open transaction: {e}")))?;
        }

        let inner = self.step_inner(step, conn).await;

        match inner {
            Ok(success) => {
                if step.transactional {
                    if let Err(e) = conn.commit().await {
                        let _ = conn.rollback().await;
                        return Err(StepFailure::Error(format!("commit failed: {e}")));
                    }
                }
                Ok(success)
            }
            Err(failure) => {
                if step.transactional {
                    let _ = conn.rollback().await;
                }
                Err(failure)
            }
        }
    }

    async fn step_inner(
        &self,
        step: &Step,
        conn: &dyn Connection,
    ) -> Result<StepSuccess, StepFailure> {
        if let Some(predicate) = &step.pre_validation {
            let rows = conn
                .query(predicate, &[])
                .await
                .map_err(|e| StepFailure::Error(format!("pre-validation query failed: {e}")))?;
            if rows.is_empty() {
                return Err(StepFailure::Error(
                    "pre-validation failed: predicate returned no rows".to_string(),
                ));
            }
        }

        let mut statement = None;
        let mut rows_affected = None;
        let mut transform_report = None;

        if step.kind.is_data() && step.transform.is_some() {
            let spec = step.transform.as_ref().expect("checked above");
            let report = self
                .transforms
                .run(spec, conn)
                .await
                .map_err(|e| StepFailure::Error(e.to_string()))?;
            rows_affected = Some(report.rows_processed);
            transform_report = Some(report);
        } else if !step.sql.is_empty() {
            let rendered = self
                .dialect
                .render(&step.sql, conn.engine())
                .map_err(|e| StepFailure::Error(e.to_string()))?;
            let affected = conn
                .execute(&rendered, &[])
                .await
                .map_err(|e| StepFailure::Error(e.to_string()))?;
            rows_affected = Some(affected);
            statement = Some(rendered);
        }

        if let Some(predicate) = &step.post_validation {
            let rows = conn
                .query(predicate, &[])
                .await
                .map_err(|e| StepFailure::Error(format!("post-validation query failed: {e}")))?;
            if rows.is_empty() {
                return Err(StepFailure::Error(
                    "post-validation failed: predicate returned no rows".to_string(),
                ));
            }
        }

        if let Some(expected) = &step.expected_changes {
            if let (Some(expected_rows), Some(actual)) = (expected.rows, rows_affected) {
                if expected_rows != actual {
                    tracing::warn!(
                        step = %step.id,
                        expected = expected_rows,
                        actual,
                        "affected row count differs from expectation"
                    );
                }
            }
        }

        Ok(StepSuccess {
            statement,
            rows_affected,
            transform: transform_report,
        })
    }
}

/// Topological order over intra-migration step dependencies, with stable
/// ties by declaration order. Authoring validation guarantees acyclicity
/// is the common case; a cycle degrades to declaration order.
fn ordered_up_steps(migration: &Migration) -> Vec<&Step> {
    let nodes: Vec<(String, Vec<String>)> = migration
        .steps
        .up
        .iter()
        .map(|s| (s.id.clone(), s.dependencies.clone()))
        .collect();

    match DependencyGraph::new(&nodes).topo_sort() {
        Ok(order) => order
            .iter()
            .filter_map(|id| migration.steps.up.iter().find(|s| &s.id == id))
            .collect(),
        Err(cycle) => {
            tracing::warn!(
                migration = %migration.id,
                cycle = ?cycle,
                "step dependency cycle; using declaration order"
            );
            migration.steps.up.iter().collect()
        }
    }
}

fn failed_step_result(step: &Step, message: String) -> StepResult {
    let now = Utc::now();
    StepResult {
        step_id: step.id.clone(),
        status: StepStatus::Failed,
        statement: None,
        rows_affected: None,
        transform: None,
        error: Some(message),
        started_at: now,
        finished_at: now,
    }
}

fn skipped_result(migration: &Migration, reason: &str) -> ExecutionResult {
    let now = Utc::now();
    ExecutionResult {
        migration_id: migration.id.clone(),
        status: MigrationOutcome::Skipped,
        step_results: Vec::new(),
        warnings: Vec::new(),
        backup_id: None,
        error: Some(reason.to_string()),
        started_at: now,
        finished_at: now,
    }
}
