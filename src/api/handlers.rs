use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use crate::adapters::{DocumentAdapter, QueryAdapter, QueryDocument, StoreQueryExecutor};
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncFailure};
use crate::logic::reconcile;
use crate::model::{RunStatus, SchemaRegistry, SyncCounts, SyncSummary};
use crate::store::RecordStore;

/// Most recent run summaries, oldest evicted first.
#[derive(Debug)]
pub struct SyncHistory {
    capacity: usize,
    runs: RwLock<VecDeque<SyncSummary>>,
}

impl SyncHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            runs: RwLock::new(VecDeque::new()),
        }
    }

    pub fn push(&self, summary: SyncSummary) {
        let mut runs = self.runs.write();
        while runs.len() >= self.capacity {
            runs.pop_front();
        }
        runs.push_back(summary);
    }

    pub fn get(&self, sync_id: Uuid) -> Option<SyncSummary> {
        self.runs.read().iter().find(|s| s.sync_id == sync_id).cloned()
    }

    /// Newest first.
    pub fn list(&self) -> Vec<SyncRunInfo> {
        self.runs.read().iter().rev().map(SyncRunInfo::from).collect()
    }
}

pub struct AppState<S: RecordStore + ?Sized> {
    pub store: Arc<S>,
    pub schema: Arc<SchemaRegistry>,
    pub settings: SyncSettings,
    pub history: Arc<SyncHistory>,
}

impl<S: RecordStore + ?Sized> AppState<S> {
    pub fn new(store: Arc<S>, schema: Arc<SchemaRegistry>, settings: SyncSettings) -> Self {
        let history = Arc::new(SyncHistory::new(settings.history_capacity));
        Self {
            store,
            schema,
            settings,
            history,
        }
    }
}

impl<S: RecordStore + ?Sized> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            schema: Arc::clone(&self.schema),
            settings: self.settings.clone(),
            history: Arc::clone(&self.history),
        }
    }
}

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub entity_types: usize,
}

pub async fn health_check<S: RecordStore + 'static>(State(state): State<AppState<S>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now().to_rfc3339(),
        entity_types: state.schema.len(),
    })
}

/// Body of `POST /syncs`. Anything left out falls back to the configured
/// sync settings.
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    /// Source document keyed by entity type
    pub data: Value,
    pub dry_run: Option<bool>,
    pub global_flags: Option<Vec<String>>,
    pub model_flags: Option<BTreeMap<String, Vec<String>>>,
    pub source_name: Option<String>,
}

impl SyncRequest {
    fn settings(&self, defaults: &SyncSettings) -> SyncSettings {
        let mut settings = defaults.clone();
        if let Some(dry_run) = self.dry_run {
            settings.dry_run = dry_run;
        }
        if let Some(global_flags) = &self.global_flags {
            settings.global_flags = global_flags.clone();
        }
        if let Some(model_flags) = &self.model_flags {
            settings.model_flags = model_flags.clone();
        }
        settings
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Summary without its log entries, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunInfo {
    pub sync_id: Uuid,
    pub source: String,
    pub target: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counts: SyncCounts,
}

impl From<&SyncSummary> for SyncRunInfo {
    fn from(summary: &SyncSummary) -> Self {
        Self {
            sync_id: summary.sync_id,
            source: summary.source.clone(),
            target: summary.target.clone(),
            dry_run: summary.dry_run,
            started_at: summary.started_at,
            finished_at: summary.finished_at,
            status: summary.status,
            counts: summary.counts,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SyncSummary>,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
            summary: None,
        }
    }

    pub fn with_summary(message: &str, summary: SyncSummary) -> Self {
        Self {
            error: message.to_string(),
            summary: Some(summary),
        }
    }
}

fn failure_status(error: &SyncError) -> StatusCode {
    match error {
        SyncError::Configuration(_) => StatusCode::BAD_REQUEST,
        SyncError::Load(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Reconciles the posted document into the store. The target graph is
/// loaded from the store itself.
pub async fn trigger_sync<S: RecordStore + 'static>(
    State(state): State<AppState<S>>,
    RequestJson(request): RequestJson<SyncRequest>,
) -> Result<Json<SyncSummary>, (StatusCode, Json<ErrorResponse>)> {
    let settings = request.settings(&state.settings);
    let source_name = request.source_name.as_deref().unwrap_or("source").to_string();

    let mut source = DocumentAdapter::new(&source_name, state.schema.clone(), request.data);
    let executor = StoreQueryExecutor::new(state.store.clone(), state.schema.clone());
    let mut target = QueryAdapter::new("store", state.schema.clone(), executor, QueryDocument::all().with_handles());

    match reconcile(state.schema.clone(), &settings, state.store.as_ref(), &mut source, &mut target).await {
        Ok(summary) => {
            state.history.push(summary.clone());
            Ok(Json(summary))
        }
        Err(SyncFailure { error, summary }) => {
            let summary = *summary;
            state.history.push(summary.clone());
            Err((
                failure_status(&error),
                Json(ErrorResponse::with_summary(&error.to_string(), summary)),
            ))
        }
    }
}

pub async fn list_syncs<S: RecordStore + 'static>(
    State(state): State<AppState<S>>,
) -> Json<ListResponse<SyncRunInfo>> {
    let items = state.history.list();
    let total = items.len();
    Json(ListResponse { items, total })
}

pub async fn get_sync<S: RecordStore + 'static>(
    State(state): State<AppState<S>>,
    Path(sync_id): Path<Uuid>,
) -> Result<Json<SyncSummary>, (StatusCode, Json<ErrorResponse>)> {
    match state.history.get(sync_id) {
        Some(summary) => Ok(Json(summary)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(&format!("Sync '{}' not found", sync_id))),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_evicts_oldest() {
        let history = SyncHistory::new(2);
        let first = SyncSummary::new("a", "b", true);
        let first_id = first.sync_id;
        history.push(first);
        history.push(SyncSummary::new("a", "b", true));
        let newest = SyncSummary::new("a", "b", false);
        let newest_id = newest.sync_id;
        history.push(newest);

        assert!(history.get(first_id).is_none());
        let listed = history.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].sync_id, newest_id);
    }

    #[test]
    fn test_request_overrides_settings() {
        let defaults = SyncSettings::default();
        let request: SyncRequest = serde_json::from_value(serde_json::json!({
            "data": {},
            "dry_run": false,
            "global_flags": ["CONTINUE_ON_FAILURE"]
        }))
        .unwrap();

        let settings = request.settings(&defaults);
        assert!(!settings.dry_run);
        assert_eq!(settings.global_flags, vec!["CONTINUE_ON_FAILURE".to_string()]);
        assert_eq!(settings.history_capacity, defaults.history_capacity);
    }
}
