use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use vaultsync_core::{
    diff_for_deposit, diff_for_withdraw, saturating_count, Container, ContainerId,
    ImportPipeline, ItemFailure, JsonImportPipeline, OperationToken, OwnerId, PendingOperation,
    Record, RecordId, ReconcileError, SnapshotIndex, TransferKind,
};
use vaultsync_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore, TransferLogEntry};

mod pending;

pub use pending::PendingOperationStore;

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const DEFAULT_PENDING_TTL_SECS: i64 = 1800;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultSyncConfig {
    pub db_path: PathBuf,
    pub pending_ttl: Duration,
}

impl VaultSyncConfig {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, pending_ttl: Duration::seconds(DEFAULT_PENDING_TTL_SECS) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResult {
    pub containers_upserted: usize,
    pub records_inserted: usize,
    pub records_skipped: usize,
    pub snapshot_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewResult {
    pub token: OperationToken,
    pub kind: TransferKind,
    pub container_id: ContainerId,
    pub candidates: Vec<Record>,
    pub count_before: u32,
    pub count_after: u32,
    pub warnings: Vec<String>,
    pub snapshot_digest: String,
}

impl PreviewResult {
    #[must_use]
    pub fn candidate_ids(&self) -> Vec<RecordId> {
        self.candidates.iter().map(|record| record.record_id).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionResult {
    pub token: OperationToken,
    pub kind: TransferKind,
    pub container_id: ContainerId,
    pub success: bool,
    pub moved: u32,
    pub moved_record_ids: Vec<RecordId>,
    pub failures: Vec<ItemFailure>,
    pub item_count: Option<u32>,
    pub reported_count_updated: bool,
    pub error: Option<String>,
}

/// Entry point shared by the CLI and the HTTP service.
///
/// Each call opens its own store connection; previewed operations live in memory and are
/// shared between clones.
#[derive(Clone)]
pub struct VaultSyncApi {
    db_path: PathBuf,
    pending: Arc<PendingOperationStore>,
    pipeline: Arc<dyn ImportPipeline>,
}

impl std::fmt::Debug for VaultSyncApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSyncApi")
            .field("db_path", &self.db_path)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl VaultSyncApi {
    #[must_use]
    pub fn new(config: VaultSyncConfig) -> Self {
        Self::with_pipeline(config, Arc::new(JsonImportPipeline))
    }

    #[must_use]
    pub fn with_pipeline(config: VaultSyncConfig, pipeline: Arc<dyn ImportPipeline>) -> Self {
        Self {
            db_path: config.db_path,
            pending: Arc::new(PendingOperationStore::new(config.pending_ttl)),
            pipeline,
        }
    }

    #[must_use]
    pub fn pending(&self) -> &PendingOperationStore {
        &self.pending
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity check fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Create a holding location that no snapshot describes.
    ///
    /// # Errors
    /// Returns an error when the name is blank or persistence fails.
    pub fn create_container(&self, owner: &OwnerId, name: &str) -> Result<Container> {
        let mut store = self.open_migrated_store()?;
        let container = Container::manual(owner.clone(), name.trim());
        store.insert_container(&container)?;
        Ok(container)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_containers(&self, owner: &OwnerId) -> Result<Vec<Container>> {
        let store = self.open_migrated_store()?;
        store.list_containers(owner)
    }

    /// Seed inventory from a snapshot: containers are upserted by external id and items with
    /// an unseen external id become active records.
    ///
    /// # Errors
    /// Returns [`ReconcileError::MalformedSnapshot`] for unparsable text, or a store error.
    pub fn import_inventory(&self, owner: &OwnerId, snapshot_text: &str) -> Result<ImportResult> {
        let snapshot = self.pipeline.parse(snapshot_text)?;
        let mut store = self.open_migrated_store()?;

        for descriptor in &snapshot.containers {
            store.upsert_reported_container(owner, descriptor)?;
        }

        let index = SnapshotIndex::build(&snapshot);
        let mut records_inserted = 0;
        let mut records_skipped = 0;
        for descriptor in index.descriptors() {
            if store.find_by_external_id(owner, &descriptor.external_id)?.is_some() {
                records_skipped += 1;
                continue;
            }
            store.insert_record(&Record {
                record_id: RecordId::new(),
                owner: owner.clone(),
                external_id: descriptor.external_id.clone(),
                catalog_key: descriptor.catalog_key.clone(),
                fingerprint: descriptor.fingerprint.clone(),
                container_id: None,
            })?;
            records_inserted += 1;
        }

        let result = ImportResult {
            containers_upserted: snapshot.containers.len(),
            records_inserted,
            records_skipped,
            snapshot_digest: snapshot_digest(snapshot_text),
        };
        info!(
            owner = %owner,
            containers = result.containers_upserted,
            inserted = result.records_inserted,
            skipped = result.records_skipped,
            "inventory imported"
        );
        Ok(result)
    }

    /// Compute the records a deposit or withdraw would move and park the plan under a token.
    ///
    /// Nothing is written to the store.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Unauthorized`] when the container is not owned by `owner`,
    /// [`ReconcileError::MalformedSnapshot`] for unparsable text, or a store error.
    pub fn prepare_preview(
        &self,
        owner: &OwnerId,
        container_id: ContainerId,
        snapshot_text: &str,
        kind: TransferKind,
    ) -> Result<PreviewResult> {
        let store = self.open_migrated_store()?;
        let container = owned_container(&store, owner, container_id)?;
        let snapshot = self.pipeline.parse(snapshot_text)?;
        let active_pool = store.find_active_by_owner(owner)?;
        let count_before = store.count_members(container_id)?;

        let (candidates, rewrites, mut warnings) = match kind {
            TransferKind::Deposit => {
                let diff = diff_for_deposit(&active_pool, &snapshot);
                let warnings = diff.warnings.iter().map(ToString::to_string).collect::<Vec<_>>();
                (diff.disappeared, Vec::new(), warnings)
            }
            TransferKind::Withdraw => {
                let mut contents = store.find_by_container(owner, container_id)?;
                let diff = diff_for_withdraw(&active_pool, &snapshot, &mut contents);
                let mut warnings =
                    diff.warnings.iter().map(ToString::to_string).collect::<Vec<_>>();
                let unresolved = diff.unresolved_count();
                if unresolved > 0 {
                    warnings.push(format!(
                        "{unresolved} descriptors could not be resolved to inventory records"
                    ));
                }
                (diff.appeared, diff.rewrites, warnings)
            }
        };

        let moving = saturating_count(candidates.len());
        let count_after = match kind {
            TransferKind::Deposit => count_before.saturating_add(moving),
            TransferKind::Withdraw => count_before.saturating_sub(moving),
        };
        let container_report = container
            .external_id
            .as_deref()
            .and_then(|external_id| snapshot.container_report(external_id));
        if container.is_external() && container_report.is_none() {
            warnings.push(format!(
                "snapshot does not describe container {}; reported count left unchanged",
                container.name
            ));
        }

        let digest = snapshot_digest(snapshot_text);
        let token = self.pending.insert(PendingOperation {
            token: OperationToken::new(),
            owner: owner.clone(),
            kind,
            container_id,
            record_ids: candidates.iter().map(|record| record.record_id).collect(),
            rewrites,
            container_report,
            snapshot_digest: digest.clone(),
            created_at: OffsetDateTime::now_utc(),
        })?;
        info!(
            owner = %owner,
            container_id = %container_id,
            kind = kind.as_str(),
            token = %token,
            candidates = candidates.len(),
            warnings = warnings.len(),
            "transfer previewed"
        );

        Ok(PreviewResult {
            token,
            kind,
            container_id,
            candidates,
            count_before,
            count_after,
            warnings,
            snapshot_digest: digest,
        })
    }

    /// Redeem a preview token and apply the parked transfer.
    ///
    /// The token is consumed whatever the outcome. A store failure is reported through
    /// [`TransactionResult::success`] rather than as an error.
    ///
    /// # Errors
    /// Returns [`ReconcileError::OperationNotFound`] when the token is unknown, expired, spent,
    /// or was issued for another owner, kind, or container, and
    /// [`ReconcileError::Unauthorized`] when the container changed hands since the preview.
    pub fn execute(
        &self,
        owner: &OwnerId,
        container_id: ContainerId,
        kind: TransferKind,
        token: OperationToken,
    ) -> Result<TransactionResult> {
        let operation = self.pending.take(owner, token)?;
        if operation.kind != kind || operation.container_id != container_id {
            warn!(
                token = %token,
                expected_kind = operation.kind.as_str(),
                requested_kind = kind.as_str(),
                "token redeemed for a different transfer; discarded"
            );
            return Err(ReconcileError::OperationNotFound(format!("unknown token {token}")).into());
        }

        let applied =
            self.open_migrated_store().and_then(|mut store| store.apply_transfer(&operation));
        match applied {
            Ok(outcome) => {
                info!(
                    token = %token,
                    moved = outcome.moved.len(),
                    failed = outcome.failures.len(),
                    item_count = outcome.item_count,
                    "transfer executed"
                );
                Ok(TransactionResult {
                    token,
                    kind,
                    container_id,
                    success: true,
                    moved: saturating_count(outcome.moved.len()),
                    moved_record_ids: outcome.moved,
                    failures: outcome.failures,
                    item_count: Some(outcome.item_count),
                    reported_count_updated: outcome.reported_count_updated,
                    error: None,
                })
            }
            Err(err)
                if matches!(
                    err.downcast_ref::<ReconcileError>(),
                    Some(ReconcileError::Unauthorized(_))
                ) =>
            {
                Err(err)
            }
            Err(err) => {
                warn!(token = %token, error = %format!("{err:#}"), "transfer rolled back");
                Ok(TransactionResult {
                    token,
                    kind,
                    container_id,
                    success: false,
                    moved: 0,
                    moved_record_ids: Vec::new(),
                    failures: Vec::new(),
                    item_count: None,
                    reported_count_updated: false,
                    error: Some(
                        ReconcileError::TransactionFailure(format!("{err:#}")).to_string(),
                    ),
                })
            }
        }
    }

    /// Committed transfers for one container, newest first.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Unauthorized`] when the container is not owned by `owner`.
    pub fn container_history(
        &self,
        owner: &OwnerId,
        container_id: ContainerId,
    ) -> Result<Vec<TransferLogEntry>> {
        let store = self.open_migrated_store()?;
        owned_container(&store, owner, container_id)?;
        store.list_transfer_log(owner, container_id)
    }
}

fn owned_container(
    store: &SqliteStore,
    owner: &OwnerId,
    container_id: ContainerId,
) -> Result<Container> {
    let container = store
        .get_container(container_id)?
        .filter(|container| container.owner == *owner)
        .ok_or_else(|| {
            ReconcileError::Unauthorized(format!("container {container_id} is not owned by {owner}"))
        })?;
    Ok(container)
}

/// Short stable digest of raw snapshot text, recorded with every transfer.
#[must_use]
pub fn snapshot_digest(snapshot_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(snapshot_text.as_bytes());
    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("snap_{}", &digest_hex[..16])
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::Path;

    use anyhow::anyhow;
    use vaultsync_core::ItemFailureReason;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("vaultsync-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn owner(value: &str) -> OwnerId {
        match OwnerId::parse(value) {
            Ok(owner) => owner,
            Err(err) => panic!("fixture owner should parse: {err}"),
        }
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn seeded(api: &VaultSyncApi, owner: &OwnerId, items: &str) -> Result<ContainerId> {
        api.import_inventory(
            owner,
            &format!(
                r#"{{"items": [{items}],
                    "containers": [{{"external_id": "900", "name": "Unit A", "reported_count": 0}}]}}"#
            ),
        )?;
        api.list_containers(owner)?
            .first()
            .map(|container| container.container_id)
            .ok_or_else(|| anyhow!("seeded container missing"))
    }

    fn assert_not_found(result: Result<TransactionResult>) {
        match result {
            Ok(result) => panic!("expected OperationNotFound, got {result:?}"),
            Err(err) => assert!(
                matches!(
                    err.downcast_ref::<ReconcileError>(),
                    Some(ReconcileError::OperationNotFound(_))
                ),
                "unexpected error: {err:#}"
            ),
        }
    }

    #[test]
    fn deposit_preview_then_confirm_moves_disappeared_records() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = VaultSyncApi::new(VaultSyncConfig::new(db_path.clone()));
        let alice = owner("alice");
        let container_id = seeded(
            &api,
            &alice,
            r#"{"external_id": "1", "catalog_key": "K"}, {"external_id": "2", "catalog_key": "K"}"#,
        )?;

        let preview = api.prepare_preview(
            &alice,
            container_id,
            r#"{"items": [{"external_id": "2", "catalog_key": "K"}],
                "containers": [{"external_id": "900", "name": "Unit A", "reported_count": 1}]}"#,
            TransferKind::Deposit,
        )?;
        assert_eq!(preview.candidates.len(), 1);
        assert_eq!(preview.candidates[0].external_id, "1");
        assert_eq!((preview.count_before, preview.count_after), (0, 1));

        let result = api.execute(&alice, container_id, TransferKind::Deposit, preview.token)?;
        assert!(result.success);
        assert_eq!(result.moved, 1);
        assert_eq!(result.item_count, Some(1));
        assert!(result.reported_count_updated);

        let containers = api.list_containers(&alice)?;
        assert_eq!(containers[0].item_count, 1);
        assert_eq!(containers[0].reported_count, Some(1));
        assert_eq!(api.container_history(&alice, container_id)?.len(), 1);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn preview_is_idempotent_and_writes_nothing() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = VaultSyncApi::new(VaultSyncConfig::new(db_path.clone()));
        let alice = owner("alice");
        let container_id = seeded(
            &api,
            &alice,
            r#"{"external_id": "1", "catalog_key": "K"}, {"external_id": "2", "catalog_key": "K"},
               {"external_id": "3", "catalog_key": "K"}"#,
        )?;
        let snapshot = r#"{"items": [{"external_id": "3", "catalog_key": "K"}]}"#;

        let first = api.prepare_preview(&alice, container_id, snapshot, TransferKind::Deposit)?;
        let second = api.prepare_preview(&alice, container_id, snapshot, TransferKind::Deposit)?;

        assert_ne!(first.token, second.token);
        assert_eq!(
            first.candidate_ids().into_iter().collect::<BTreeSet<_>>(),
            second.candidate_ids().into_iter().collect::<BTreeSet<_>>()
        );
        assert_eq!(first.snapshot_digest, second.snapshot_digest);
        assert_eq!(api.list_containers(&alice)?[0].item_count, 0);
        assert_eq!(api.pending().len(), 2);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn confirm_is_single_use() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = VaultSyncApi::new(VaultSyncConfig::new(db_path.clone()));
        let alice = owner("alice");
        let container_id = seeded(&api, &alice, r#"{"external_id": "1", "catalog_key": "K"}"#)?;

        let preview =
            api.prepare_preview(&alice, container_id, r#"{"items": []}"#, TransferKind::Deposit)?;
        assert!(preview.warnings.iter().any(|warning| warning.contains("no items")));
        let first = api.execute(&alice, container_id, TransferKind::Deposit, preview.token)?;
        assert!(first.success);

        assert_not_found(api.execute(&alice, container_id, TransferKind::Deposit, preview.token));
        assert_eq!(api.container_history(&alice, container_id)?.len(), 1);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn withdraw_resolves_reissued_ids_and_rewrites_them() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = VaultSyncApi::new(VaultSyncConfig::new(db_path.clone()));
        let alice = owner("alice");
        let container_id =
            seeded(&api, &alice, r#"{"external_id": "10", "catalog_key": "K", "wear": 0.5}"#)?;

        let deposit =
            api.prepare_preview(&alice, container_id, r#"{"items": []}"#, TransferKind::Deposit)?;
        api.execute(&alice, container_id, TransferKind::Deposit, deposit.token)?;
        let record_id = deposit.candidates[0].record_id;

        let withdraw = api.prepare_preview(
            &alice,
            container_id,
            r#"{"items": [{"external_id": "99", "catalog_key": "K", "wear": 0.5},
                          {"external_id": "77", "catalog_key": "MISSING"}]}"#,
            TransferKind::Withdraw,
        )?;
        assert_eq!(withdraw.candidate_ids(), vec![record_id]);
        assert_eq!(withdraw.candidates[0].external_id, "99");
        assert!(withdraw
            .warnings
            .iter()
            .any(|warning| warning == "1 descriptors could not be resolved to inventory records"));

        let result = api.execute(&alice, container_id, TransferKind::Withdraw, withdraw.token)?;
        assert!(result.success);
        assert_eq!(result.item_count, Some(0));

        let store = SqliteStore::open(&db_path)?;
        let reloaded = store.find_by_owner_and_id(&alice, record_id)?;
        assert_eq!(reloaded.as_ref().map(|record| record.external_id.as_str()), Some("99"));
        assert_eq!(reloaded.and_then(|record| record.container_id), None);
        let history = api.container_history(&alice, container_id)?;
        assert_eq!(history[0].rewrites.len(), 1);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn deleted_candidate_is_reported_missing() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = VaultSyncApi::new(VaultSyncConfig::new(db_path.clone()));
        let alice = owner("alice");
        let items = (1..=5)
            .map(|index| format!(r#"{{"external_id": "{index}", "catalog_key": "K"}}"#))
            .collect::<Vec<_>>()
            .join(",");
        let container_id = seeded(&api, &alice, &items)?;

        let preview =
            api.prepare_preview(&alice, container_id, r#"{"items": []}"#, TransferKind::Deposit)?;
        assert_eq!(preview.candidates.len(), 5);
        let deleted = preview.candidates[2].record_id;
        let mut store = SqliteStore::open(&db_path)?;
        assert!(store.delete_record(&alice, deleted)?);

        let result = api.execute(&alice, container_id, TransferKind::Deposit, preview.token)?;
        assert!(result.success);
        assert_eq!(result.moved, 4);
        assert_eq!(result.item_count, Some(4));
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].record_id, deleted);
        assert_eq!(result.failures[0].reason, ItemFailureReason::Missing);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn expired_token_is_not_found() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = VaultSyncApi::new(VaultSyncConfig {
            db_path: db_path.clone(),
            pending_ttl: Duration::ZERO,
        });
        let alice = owner("alice");
        let container_id = seeded(&api, &alice, r#"{"external_id": "1", "catalog_key": "K"}"#)?;

        let preview =
            api.prepare_preview(&alice, container_id, r#"{"items": []}"#, TransferKind::Deposit)?;
        assert_not_found(api.execute(&alice, container_id, TransferKind::Deposit, preview.token));
        assert_eq!(api.list_containers(&alice)?[0].item_count, 0);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn foreign_owner_cannot_preview_or_redeem() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = VaultSyncApi::new(VaultSyncConfig::new(db_path.clone()));
        let alice = owner("alice");
        let mallory = owner("mallory");
        let container_id = seeded(&api, &alice, r#"{"external_id": "1", "catalog_key": "K"}"#)?;

        let denied =
            api.prepare_preview(&mallory, container_id, r#"{"items": []}"#, TransferKind::Deposit);
        match denied {
            Ok(preview) => panic!("foreign preview should fail, got {preview:?}"),
            Err(err) => assert!(matches!(
                err.downcast_ref::<ReconcileError>(),
                Some(ReconcileError::Unauthorized(_))
            )),
        }

        let preview =
            api.prepare_preview(&alice, container_id, r#"{"items": []}"#, TransferKind::Deposit)?;
        assert_not_found(api.execute(&mallory, container_id, TransferKind::Deposit, preview.token));
        let result = api.execute(&alice, container_id, TransferKind::Deposit, preview.token)?;
        assert!(result.success);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn mismatched_kind_consumes_the_token() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = VaultSyncApi::new(VaultSyncConfig::new(db_path.clone()));
        let alice = owner("alice");
        let container_id = seeded(&api, &alice, r#"{"external_id": "1", "catalog_key": "K"}"#)?;

        let preview =
            api.prepare_preview(&alice, container_id, r#"{"items": []}"#, TransferKind::Deposit)?;
        assert_not_found(api.execute(&alice, container_id, TransferKind::Withdraw, preview.token));
        assert_not_found(api.execute(&alice, container_id, TransferKind::Deposit, preview.token));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn malformed_snapshot_is_rejected_before_any_token() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = VaultSyncApi::new(VaultSyncConfig::new(db_path.clone()));
        let alice = owner("alice");
        let container_id = seeded(&api, &alice, r#"{"external_id": "1", "catalog_key": "K"}"#)?;

        let result = api.prepare_preview(&alice, container_id, "{not json", TransferKind::Deposit);
        match result {
            Ok(preview) => panic!("malformed snapshot should fail, got {preview:?}"),
            Err(err) => assert!(matches!(
                err.downcast_ref::<ReconcileError>(),
                Some(ReconcileError::MalformedSnapshot(_))
            )),
        }
        assert!(api.pending().is_empty());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn import_skips_known_external_ids() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = VaultSyncApi::new(VaultSyncConfig::new(db_path.clone()));
        let alice = owner("alice");
        let snapshot = r#"{"items": [{"external_id": "1", "catalog_key": "K"},
                                     {"external_id": "1", "catalog_key": "K"}]}"#;

        let first = api.import_inventory(&alice, snapshot)?;
        let second = api.import_inventory(&alice, snapshot)?;

        assert_eq!((first.records_inserted, first.records_skipped), (1, 0));
        assert_eq!((second.records_inserted, second.records_skipped), (0, 1));
        assert!(first.snapshot_digest.starts_with("snap_"));
        assert_eq!(first.snapshot_digest.len(), "snap_".len() + 16);

        cleanup(&db_path);
        Ok(())
    }
}
