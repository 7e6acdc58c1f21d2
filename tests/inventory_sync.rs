use inventory_ssot::config::SyncSettings;
use inventory_ssot::store::StoreResult;
use inventory_ssot::{
    network_inventory, ColumnValue, Differ, DocumentAdapter, GraphAdapter, Handle, MemoryStore, PersistedRecord,
    QueryAdapter, QueryDocument, RecordFilter, RecordStore, RunStatus, SchemaRegistry, StoreError,
    StoreQueryExecutor, SyncAction, SyncJob, SyncStatus, SyncSummary, TableDef,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn schema() -> Arc<SchemaRegistry> {
    Arc::new(network_inventory().unwrap())
}

fn settings(global_flags: &[&str]) -> SyncSettings {
    SyncSettings {
        dry_run: false,
        global_flags: global_flags.iter().map(|f| f.to_string()).collect(),
        ..SyncSettings::default()
    }
}

fn store_target<S: RecordStore + 'static>(
    schema: &Arc<SchemaRegistry>,
    store: &Arc<S>,
) -> QueryAdapter<StoreQueryExecutor<S>> {
    let executor = StoreQueryExecutor::new(store.clone(), schema.clone());
    QueryAdapter::new("store", schema.clone(), executor, QueryDocument::all().with_handles())
}

async fn sync<S: RecordStore + 'static>(
    schema: &Arc<SchemaRegistry>,
    store: &Arc<S>,
    settings: &SyncSettings,
    document: Value,
) -> SyncSummary {
    let mut source = DocumentAdapter::new("inventory", schema.clone(), document);
    let mut target = store_target(schema, store);
    SyncJob::new(schema.clone(), settings)
        .unwrap()
        .run(store.as_ref(), &mut source, &mut target)
        .await
        .unwrap()
}

fn actions(summary: &SyncSummary) -> Vec<(SyncAction, SyncStatus, String)> {
    summary
        .entries
        .iter()
        .map(|e| (e.action, e.status, e.object_repr.clone()))
        .collect()
}

async fn find(store: &MemoryStore, table: &str, field: &str, value: Value) -> PersistedRecord {
    store
        .find_one(table, &RecordFilter::new().eq(field, ColumnValue::Scalar(value)))
        .await
        .unwrap()
        .unwrap()
}

fn inventory() -> Value {
    json!({
        "status": [
            {"slug": "active", "name": "Active"},
            {"slug": "planned", "name": "Planned"}
        ],
        "site": [{
            "slug": "ams1",
            "name": "Amsterdam 1",
            "status": "Active",
            "vlans": [{"vid": 10, "name": "mgmt", "status": "active"}],
            "devices": [{
                "name": "edge-1",
                "status": "active",
                "interfaces": [{
                    "name": "eth0",
                    "mode": "ACCESS",
                    "untagged_vlan": "ams1__10",
                    "tagged_vlans": ["ams1__10"]
                }]
            }]
        }],
        "ip_address": [{
            "address": "10.0.0.1/24",
            "device": "edge-1",
            "interface": "eth0",
            "assigned_interface": "edge-1__eth0",
            "status": "active"
        }]
    })
}

#[tokio::test]
async fn test_creates_follow_dependency_order() {
    let schema = schema();
    let store = Arc::new(MemoryStore::with_schema(&schema));

    let summary = sync(&schema, &store, &settings(&[]), inventory()).await;

    assert_eq!(
        actions(&summary),
        vec![
            (SyncAction::Create, SyncStatus::Success, "status `active`".to_string()),
            (SyncAction::Create, SyncStatus::Success, "status `planned`".to_string()),
            (SyncAction::Create, SyncStatus::Success, "site `ams1`".to_string()),
            (SyncAction::Create, SyncStatus::Success, "device `edge-1`".to_string()),
            (SyncAction::Create, SyncStatus::Success, "vlan `ams1__10`".to_string()),
            (SyncAction::Create, SyncStatus::Success, "interface `edge-1__eth0`".to_string()),
            (SyncAction::Create, SyncStatus::Success, "ip_address `10.0.0.1/24`".to_string()),
        ]
    );
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.counts.created, 7);

    let active = find(&store, "extras_status", "slug", json!("active")).await;
    let site = find(&store, "dcim_site", "slug", json!("ams1")).await;
    let device = find(&store, "dcim_device", "name", json!("edge-1")).await;
    assert_eq!(site.field("status"), Some(&ColumnValue::ForeignKey(active.handle.unwrap())));
    assert_eq!(device.field("site"), Some(&ColumnValue::ForeignKey(site.handle.unwrap())));

    let entry = &summary.entries[2];
    assert_eq!(entry.synced_object, site.handle);
    assert_eq!(entry.diff.after["name"], json!("Amsterdam 1"));
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let schema = schema();
    let store = Arc::new(MemoryStore::with_schema(&schema));
    sync(&schema, &store, &settings(&[]), inventory()).await;
    let mutations = store.mutation_count();

    let summary = sync(&schema, &store, &settings(&[]), inventory()).await;

    assert!(summary.entries.is_empty(), "unexpected entries: {:?}", actions(&summary));
    assert_eq!(store.mutation_count(), mutations);
    assert_eq!(summary.status, RunStatus::Completed);
    assert!(summary.target_fingerprint.is_some());
}

#[tokio::test]
async fn test_unchanged_records_are_logged_on_request() {
    let schema = schema();
    let store = Arc::new(MemoryStore::with_schema(&schema));
    let document = json!({"status": [{"slug": "active", "name": "Active"}]});
    sync(&schema, &store, &settings(&[]), document.clone()).await;

    let summary = sync(&schema, &store, &settings(&["LOG_UNCHANGED_RECORDS"]), document).await;
    assert_eq!(
        actions(&summary),
        vec![(SyncAction::NoChange, SyncStatus::Success, "status `active`".to_string())]
    );
    assert_eq!(summary.counts.unchanged, 1);
}

#[tokio::test]
async fn test_changed_attributes_are_updated() {
    let schema = schema();
    let store = Arc::new(MemoryStore::with_schema(&schema));
    sync(&schema, &store, &settings(&[]), inventory()).await;

    let mut changed = inventory();
    changed["site"][0]["name"] = json!("Amsterdam One");
    changed["site"][0]["status"] = json!("planned");
    let summary = sync(&schema, &store, &settings(&[]), changed).await;

    assert_eq!(
        actions(&summary),
        vec![(SyncAction::Update, SyncStatus::Success, "site `ams1`".to_string())]
    );
    let entry = &summary.entries[0];
    assert_eq!(entry.diff.before["name"], json!("Amsterdam 1"));
    assert_eq!(entry.diff.after["name"], json!("Amsterdam One"));

    let planned = find(&store, "extras_status", "slug", json!("planned")).await;
    let site = find(&store, "dcim_site", "slug", json!("ams1")).await;
    assert_eq!(site.field("status"), Some(&ColumnValue::ForeignKey(planned.handle.unwrap())));
    assert_eq!(site.field("name"), Some(&ColumnValue::Scalar(json!("Amsterdam One"))));
}

#[tokio::test]
async fn test_falsy_foreign_key_is_left_unset() {
    let schema = schema();
    let store = Arc::new(MemoryStore::with_schema(&schema));
    let document = json!({"site": [{"slug": "ams1", "status": "", "region": null}]});

    let summary = sync(&schema, &store, &settings(&[]), document.clone()).await;
    assert_eq!(summary.counts.created, 1);
    let site = find(&store, "dcim_site", "slug", json!("ams1")).await;
    assert_eq!(site.field("status"), None);

    let again = sync(&schema, &store, &settings(&[]), document).await;
    assert!(again.entries.is_empty());
}

#[tokio::test]
async fn test_many_to_many_scalar_attaches_exactly_one() {
    let schema = schema();
    let store = Arc::new(MemoryStore::with_schema(&schema));
    let document = json!({
        "site": [{
            "slug": "ams1",
            "vlans": [{"vid": 10}, {"vid": 20}],
            "devices": [{"name": "edge-1", "interfaces": [{"name": "eth0", "tagged_vlans": 20}]}]
        }]
    });

    sync(&schema, &store, &settings(&[]), document).await;

    let vlan20 = store
        .list("ipam_vlan")
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.field("vid") == Some(&ColumnValue::Scalar(json!(20))))
        .unwrap();
    let interface = find(&store, "dcim_interface", "name", json!("eth0")).await;
    let tagged: Vec<Handle> = interface.links["tagged_vlans"].iter().copied().collect();
    assert_eq!(tagged, vec![vlan20.handle.unwrap()]);
}

#[tokio::test]
async fn test_stale_delete_is_recorded_and_the_run_continues() {
    let schema = schema();
    let store = Arc::new(MemoryStore::with_schema(&schema));
    let statuses = json!({"status": [{"slug": "active"}, {"slug": "planned"}, {"slug": "retired"}]});
    sync(&schema, &store, &settings(&[]), statuses).await;

    let mut source = DocumentAdapter::new(
        "inventory",
        schema.clone(),
        json!({"status": [{"slug": "active"}], "site": [{"slug": "ams1", "status": "active"}]}),
    );
    let mut target = store_target(&schema, &store);
    source.load().await.unwrap();
    target.load().await.unwrap();

    let job = SyncJob::new(schema.clone(), &settings(&[])).unwrap();
    let diff = Differ::new(&schema, job.flags())
        .diff(source.graph(), target.graph())
        .unwrap();

    // someone else removes `planned` between load and execution
    let planned = find(&store, "extras_status", "slug", json!("planned")).await;
    assert!(store.delete("extras_status", planned.handle.unwrap()).await.unwrap());

    let summary = job
        .execute(
            store.as_ref(),
            diff,
            target.graph_mut(),
            SyncSummary::new("inventory", "store", false),
        )
        .await
        .unwrap();

    let planned_entry = summary
        .entries
        .iter()
        .find(|e| e.unique_id == "planned")
        .unwrap();
    assert_eq!(planned_entry.action, SyncAction::Delete);
    assert_eq!(planned_entry.status, SyncStatus::Failure);
    assert_eq!(summary.counts.created, 1);
    assert_eq!(summary.counts.deleted, 1);
    assert_eq!(summary.status, RunStatus::CompletedWithFailures);
    assert_eq!(store.count("extras_status"), 1);
}

#[tokio::test]
async fn test_dry_run_touches_nothing() {
    let schema = schema();
    let store = Arc::new(MemoryStore::with_schema(&schema));
    let dry_run = SyncSettings {
        dry_run: true,
        ..SyncSettings::default()
    };

    let summary = sync(&schema, &store, &dry_run, inventory()).await;

    assert_eq!(summary.counts.planned, 7);
    assert!(summary.dry_run);
    assert!(summary.entries.iter().all(|e| e.synced_object.is_none()));
    assert_eq!(store.mutation_count(), 0);
}

#[tokio::test]
async fn test_skip_unmatched_dst_keeps_target_only_records() {
    let schema = schema();
    let store = Arc::new(MemoryStore::with_schema(&schema));
    sync(&schema, &store, &settings(&[]), json!({"status": [{"slug": "active"}, {"slug": "legacy"}]})).await;

    let summary = sync(
        &schema,
        &store,
        &settings(&["SKIP_UNMATCHED_DST"]),
        json!({"status": [{"slug": "active"}]}),
    )
    .await;
    assert!(summary.entries.is_empty());
    assert_eq!(store.count("extras_status"), 2);

    let summary = sync(&schema, &store, &settings(&[]), json!({"status": [{"slug": "active"}]})).await;
    assert_eq!(
        actions(&summary),
        vec![(SyncAction::Delete, SyncStatus::Success, "status `legacy`".to_string())]
    );
}

fn deleting_sites_with_children() -> SyncSettings {
    SyncSettings {
        model_flags: [("site".to_string(), vec!["SKIP_CHILDREN_ON_DELETE".to_string()])]
            .into_iter()
            .collect(),
        ..settings(&[])
    }
}

#[tokio::test]
async fn test_site_delete_takes_nested_records_along() {
    let schema = schema();
    let store = Arc::new(MemoryStore::with_schema(&schema));
    sync(&schema, &store, &settings(&[]), inventory()).await;

    let statuses_only = json!({"status": inventory()["status"].clone()});
    let summary = sync(&schema, &store, &deleting_sites_with_children(), statuses_only).await;

    assert_eq!(
        actions(&summary),
        vec![
            (SyncAction::Delete, SyncStatus::Success, "ip_address `10.0.0.1/24`".to_string()),
            (SyncAction::Delete, SyncStatus::Success, "site `ams1`".to_string()),
        ]
    );
    assert_eq!(store.count("dcim_site"), 0);
    assert_eq!(store.count("dcim_device"), 0);
    assert_eq!(store.count("ipam_vlan"), 0);
    assert_eq!(store.count("dcim_interface"), 0);
    assert_eq!(store.count("extras_status"), 2);

    let again = sync(
        &schema,
        &store,
        &deleting_sites_with_children(),
        json!({"status": inventory()["status"].clone()}),
    )
    .await;
    assert!(again.entries.is_empty(), "unexpected entries: {:?}", actions(&again));
}

#[tokio::test]
async fn test_site_delete_keeps_children_that_moved_away() {
    let schema = schema();
    let store = Arc::new(MemoryStore::with_schema(&schema));
    sync(
        &schema,
        &store,
        &settings(&[]),
        json!({"site": [{"slug": "ams1", "devices": [{"name": "edge-1"}]}, {"slug": "ams2"}]}),
    )
    .await;

    let summary = sync(
        &schema,
        &store,
        &deleting_sites_with_children(),
        json!({"site": [{"slug": "ams2", "devices": [{"name": "edge-1"}]}]}),
    )
    .await;

    assert_eq!(
        actions(&summary),
        vec![
            (SyncAction::Update, SyncStatus::Success, "device `edge-1`".to_string()),
            (SyncAction::Delete, SyncStatus::Success, "site `ams1`".to_string()),
        ]
    );
    let ams2 = find(&store, "dcim_site", "slug", json!("ams2")).await;
    let device = find(&store, "dcim_device", "name", json!("edge-1")).await;
    assert_eq!(device.field("site"), Some(&ColumnValue::ForeignKey(ams2.handle.unwrap())));
    assert_eq!(store.count("dcim_site"), 1);
}

/// Store rejecting sites with one particular slug, the way a database
/// constraint would.
struct RejectingStore {
    inner: MemoryStore,
    slug: &'static str,
}

#[async_trait::async_trait]
impl RecordStore for RejectingStore {
    async fn register_table(&self, table: TableDef) -> StoreResult<()> {
        self.inner.register_table(table).await
    }

    async fn get(&self, table: &str, handle: Handle) -> StoreResult<Option<PersistedRecord>> {
        self.inner.get(table, handle).await
    }

    async fn find_one(&self, table: &str, filter: &RecordFilter) -> StoreResult<Option<PersistedRecord>> {
        self.inner.find_one(table, filter).await
    }

    async fn list(&self, table: &str) -> StoreResult<Vec<PersistedRecord>> {
        self.inner.list(table).await
    }

    async fn save(&self, table: &str, record: PersistedRecord) -> StoreResult<PersistedRecord> {
        if table == "dcim_site" && record.field("slug") == Some(&ColumnValue::Scalar(json!(self.slug))) {
            return Err(StoreError::Validation {
                table: table.to_string(),
                message: "site is decommissioned".to_string(),
            });
        }
        self.inner.save(table, record).await
    }

    async fn delete(&self, table: &str, handle: Handle) -> StoreResult<bool> {
        self.inner.delete(table, handle).await
    }
}

fn two_sites() -> Value {
    json!({
        "site": [
            {"slug": "ams1", "devices": [{"name": "edge-1"}]},
            {
                "slug": "ams2",
                "vlans": [{"vid": 10}],
                "devices": [{"name": "edge-2", "interfaces": [{"name": "eth0"}]}]
            }
        ]
    })
}

#[tokio::test]
async fn test_validation_failure_skips_children_only() {
    let schema = schema();
    let store = Arc::new(RejectingStore {
        inner: MemoryStore::with_schema(&schema),
        slug: "ams2",
    });

    let summary = sync(&schema, &store, &settings(&[]), two_sites()).await;

    assert_eq!(
        actions(&summary),
        vec![
            (SyncAction::Create, SyncStatus::Success, "site `ams1`".to_string()),
            (SyncAction::Create, SyncStatus::Failure, "site `ams2`".to_string()),
            (SyncAction::Create, SyncStatus::Success, "device `edge-1`".to_string()),
            (SyncAction::Create, SyncStatus::Skipped, "device `edge-2`".to_string()),
            (SyncAction::Create, SyncStatus::Skipped, "vlan `ams2__10`".to_string()),
            (SyncAction::Create, SyncStatus::Skipped, "interface `edge-2__eth0`".to_string()),
        ]
    );
    assert_eq!(summary.status, RunStatus::CompletedWithFailures);
    assert!(summary.entries[1].message.contains("site is decommissioned"));
    assert_eq!(store.inner.count("dcim_device"), 1);
}

#[tokio::test]
async fn test_continue_on_failure_reports_dependents() {
    let schema = schema();
    let store = Arc::new(RejectingStore {
        inner: MemoryStore::with_schema(&schema),
        slug: "ams2",
    });

    let summary = sync(&schema, &store, &settings(&["CONTINUE_ON_FAILURE"]), two_sites()).await;

    assert_eq!(summary.counts.skipped, 0);
    assert_eq!(summary.counts.created, 2);
    assert_eq!(summary.counts.failed, 4);
    assert!(summary
        .entries_with(SyncStatus::Failure)
        .skip(1)
        .all(|e| e.message.contains("whose create failed")));
}
