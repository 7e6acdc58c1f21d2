use chrono::Utc;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;

use crate::adapters::GraphAdapter;
use crate::config::SyncSettings;
use crate::error::{ConfigurationError, SyncError, SyncFailure};
use crate::logic::diff::Differ;
use crate::logic::flags::FlagController;
use crate::logic::resolution::RelationalResolver;
use crate::model::{
    Diff, EntityGraph, EntityKey, GlobalFlags, Handle, Instruction, ModelFlags, ObjectDiff, SchemaRegistry,
    SyncAction, SyncLogEntry, SyncStatus, SyncSummary,
};
use crate::store::RecordStore;

/// One configured reconciliation run: flags are validated up front, both
/// adapters are loaded, the diff is applied instruction by instruction.
#[derive(Debug, Clone)]
pub struct SyncJob {
    schema: Arc<SchemaRegistry>,
    flags: FlagController,
    dry_run: bool,
}

impl SyncJob {
    pub fn new(schema: Arc<SchemaRegistry>, settings: &SyncSettings) -> Result<Self, ConfigurationError> {
        let flags = FlagController::new(&settings.global_flags, settings.model_flags.clone(), &schema)?;
        Ok(Self::with_flags(schema, flags, settings.dry_run))
    }

    pub fn with_flags(schema: Arc<SchemaRegistry>, flags: FlagController, dry_run: bool) -> Self {
        Self { schema, flags, dry_run }
    }

    pub fn flags(&self) -> &FlagController {
        &self.flags
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn run<S, A, B>(&self, store: &S, source: &mut A, target: &mut B) -> Result<SyncSummary, SyncFailure>
    where
        S: RecordStore + ?Sized,
        A: GraphAdapter + ?Sized,
        B: GraphAdapter + ?Sized,
    {
        let mut summary = SyncSummary::new(source.name(), target.name(), self.dry_run);
        info!(
            "sync {} started: {} -> {} (dry run: {})",
            summary.sync_id, summary.source, summary.target, self.dry_run
        );

        if let Err(err) = source.load().await {
            return Err(abort(summary, err.into()));
        }
        if let Err(err) = target.load().await {
            return Err(abort(summary, err.into()));
        }
        summary.source_fingerprint = Some(source.graph().fingerprint());
        summary.target_fingerprint = Some(target.graph().fingerprint());

        let diff = match Differ::new(&self.schema, &self.flags).diff(source.graph(), target.graph()) {
            Ok(diff) => diff,
            Err(err) => return Err(abort(summary, err.into())),
        };
        info!("sync {}: {} instructions", summary.sync_id, diff.len());

        self.execute(store, diff, target.graph_mut(), summary).await
    }

    /// Applies an instruction stream to the store, registering what it
    /// creates in `target`.
    pub async fn execute<S>(
        &self,
        store: &S,
        diff: Diff,
        target: &mut EntityGraph,
        mut summary: SyncSummary,
    ) -> Result<SyncSummary, SyncFailure>
    where
        S: RecordStore + ?Sized,
    {
        let resolver = RelationalResolver::new(&self.schema, store);
        let continue_on_failure = self.flags.has_global(GlobalFlags::CONTINUE_ON_FAILURE);
        let mut failed: HashSet<EntityKey> = HashSet::new();

        for instruction in diff {
            if instruction.action == SyncAction::NoChange {
                summary.record(log_entry(&instruction, SyncStatus::Success, "unchanged".to_string(), None));
                continue;
            }

            if !continue_on_failure {
                if let Some(parent) = instruction.parent.as_ref().filter(|p| failed.contains(*p)) {
                    let message = format!("not attempted, parent {parent} failed");
                    warn!("{} {}: {}", instruction.action, instruction.key(), message);
                    failed.insert(instruction.key());
                    summary.record(log_entry(&instruction, SyncStatus::Skipped, message, None));
                    continue;
                }
            }

            if self.dry_run {
                summary.record(log_entry(&instruction, SyncStatus::Planned, "dry run".to_string(), None));
                continue;
            }

            let result = match instruction.action {
                SyncAction::Create => {
                    resolver
                        .create(
                            target,
                            &instruction.entity_type,
                            &instruction.identifiers,
                            &instruction.attributes,
                            instruction.parent.as_ref(),
                        )
                        .await
                }
                SyncAction::Update => {
                    resolver
                        .update(
                            target,
                            &instruction.entity_type,
                            &instruction.unique_id,
                            &instruction.attributes,
                        )
                        .await
                }
                SyncAction::Delete => {
                    let with_children = target
                        .get(&instruction.entity_type, &instruction.unique_id)
                        .is_some_and(|id| {
                            self.flags
                                .effective(target.entity(id))
                                .contains(ModelFlags::SKIP_CHILDREN_ON_DELETE)
                        });
                    if with_children {
                        resolver
                            .delete_with_children(target, &instruction.entity_type, &instruction.unique_id)
                            .await
                    } else {
                        resolver
                            .delete(target, &instruction.entity_type, &instruction.unique_id)
                            .await
                    }
                }
                SyncAction::NoChange => continue,
            };

            match result {
                Ok(handle) => {
                    info!("{} {}: ok", instruction.action, instruction.key());
                    summary.record(log_entry(
                        &instruction,
                        SyncStatus::Success,
                        format!("{}d", instruction.action),
                        Some(handle),
                    ));
                }
                Err(err) if err.is_recoverable() => {
                    warn!("{} {} failed: {}", instruction.action, instruction.key(), err);
                    if instruction.action == SyncAction::Create {
                        failed.insert(instruction.key());
                    }
                    summary.record(log_entry(&instruction, SyncStatus::Failure, err.to_string(), None));
                }
                Err(err) => {
                    error!("{} {} aborted the run: {}", instruction.action, instruction.key(), err);
                    summary.record(log_entry(&instruction, SyncStatus::Error, err.to_string(), None));
                    return Err(abort(summary, err));
                }
            }
        }

        summary.finish();
        info!(
            "sync {} finished: {:?}, {} created, {} updated, {} deleted, {} failed, {} skipped",
            summary.sync_id,
            summary.status,
            summary.counts.created,
            summary.counts.updated,
            summary.counts.deleted,
            summary.counts.failed,
            summary.counts.skipped
        );
        Ok(summary)
    }
}

/// Builds a job from `settings` and runs it. Configuration problems are
/// reported the same way as any other fatal error.
pub async fn reconcile<S, A, B>(
    schema: Arc<SchemaRegistry>,
    settings: &SyncSettings,
    store: &S,
    source: &mut A,
    target: &mut B,
) -> Result<SyncSummary, SyncFailure>
where
    S: RecordStore + ?Sized,
    A: GraphAdapter + ?Sized,
    B: GraphAdapter + ?Sized,
{
    match SyncJob::new(schema, settings) {
        Ok(job) => job.run(store, source, target).await,
        Err(err) => {
            let summary = SyncSummary::new(source.name(), target.name(), settings.dry_run);
            Err(abort(summary, err.into()))
        }
    }
}

fn abort(mut summary: SyncSummary, error: SyncError) -> SyncFailure {
    summary.abort(&error.to_string());
    SyncFailure {
        error,
        summary: Box::new(summary),
    }
}

fn log_entry(instruction: &Instruction, status: SyncStatus, message: String, handle: Option<Handle>) -> SyncLogEntry {
    let mut after = instruction.attributes.clone();
    if instruction.action == SyncAction::Create {
        after.extend(instruction.identifiers.clone());
    }
    SyncLogEntry {
        action: instruction.action,
        status,
        entity_type: instruction.entity_type.clone(),
        unique_id: instruction.unique_id.clone(),
        message,
        diff: ObjectDiff {
            before: instruction.before.clone(),
            after,
        },
        synced_object: handle,
        object_repr: instruction.key().to_string(),
        logged_at: Utc::now(),
    }
}
