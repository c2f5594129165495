use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;
use vaultsync_core::{
    saturating_count, Container, ContainerDescriptor, ContainerId, ContainerReport,
    ExternalIdRewrite, Fingerprint, ItemFailure, ItemFailureReason, OperationToken, OwnerId,
    PendingOperation, Record, RecordId, ReconcileError, TransferKind, TransferOutcome,
};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS containers (
  container_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  external_id TEXT,
  name TEXT NOT NULL,
  item_count INTEGER NOT NULL DEFAULT 0 CHECK (item_count >= 0),
  reported_count INTEGER CHECK (reported_count IS NULL OR reported_count >= 0),
  modified_at TEXT NOT NULL,
  UNIQUE(owner_id, external_id),
  UNIQUE(container_id, owner_id)
);

CREATE TABLE IF NOT EXISTS records (
  record_id TEXT PRIMARY KEY,
  owner_id TEXT NOT NULL,
  external_id TEXT NOT NULL,
  catalog_key TEXT NOT NULL,
  wear REAL,
  pattern INTEGER CHECK (pattern IS NULL OR pattern >= 0),
  name_tag TEXT,
  container_id TEXT,
  imported_at TEXT NOT NULL,
  FOREIGN KEY (container_id, owner_id) REFERENCES containers(container_id, owner_id)
);

CREATE INDEX IF NOT EXISTS idx_containers_owner ON containers(owner_id);
CREATE INDEX IF NOT EXISTS idx_records_owner_container ON records(owner_id, container_id);
CREATE INDEX IF NOT EXISTS idx_records_owner_external ON records(owner_id, external_id);
CREATE INDEX IF NOT EXISTS idx_records_container ON records(container_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS transfer_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  operation_token TEXT NOT NULL UNIQUE,
  owner_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('deposit','withdraw')),
  container_id TEXT NOT NULL,
  requested INTEGER NOT NULL,
  moved INTEGER NOT NULL,
  failed INTEGER NOT NULL,
  item_count INTEGER NOT NULL,
  snapshot_digest TEXT NOT NULL,
  committed_at TEXT NOT NULL,
  FOREIGN KEY (container_id) REFERENCES containers(container_id)
);

CREATE TABLE IF NOT EXISTS external_id_rewrites (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  operation_token TEXT NOT NULL,
  record_id TEXT NOT NULL,
  previous_external_id TEXT NOT NULL,
  external_id TEXT NOT NULL,
  rewritten_at TEXT NOT NULL,
  FOREIGN KEY (operation_token) REFERENCES transfer_log(operation_token)
);

CREATE INDEX IF NOT EXISTS idx_transfer_log_container ON transfer_log(container_id);
CREATE INDEX IF NOT EXISTS idx_external_id_rewrites_token ON external_id_rewrites(operation_token);
";

const RECORD_COLUMNS: &str =
    "record_id, owner_id, external_id, catalog_key, wear, pattern, name_tag, container_id";

const CONTAINER_COLUMNS: &str =
    "container_id, owner_id, external_id, name, item_count, reported_count, modified_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountDrift {
    pub container_id: ContainerId,
    pub stored_count: u32,
    pub actual_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub count_drift: Vec<CountDrift>,
    pub schema_status: SchemaStatus,
}

/// One committed transfer, as recorded in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferLogEntry {
    pub operation_token: OperationToken,
    pub owner: OwnerId,
    pub kind: TransferKind,
    pub container_id: ContainerId,
    pub requested: u32,
    pub moved: u32,
    pub failed: u32,
    pub item_count: u32,
    pub snapshot_digest: String,
    #[serde(with = "time::serde::rfc3339")]
    pub committed_at: OffsetDateTime,
    pub rewrites: Vec<ExternalIdRewrite>,
}

impl SqliteStore {
    /// Open a SQLite-backed inventory store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let (mut version, inferred) = detect_effective_schema_version(&self.conn)?;
        if inferred {
            // Tables exist without migration bookkeeping; record what is already there.
            for applied in 1..=version {
                record_schema_version(&self.conn, applied)?;
            }
        }

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = 2;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        info!(version, "applied schema migration");
        Ok(())
    }

    /// Persist one manually created or snapshot-discovered container.
    ///
    /// # Errors
    /// Returns an error when the name is blank or the insert fails.
    pub fn insert_container(&mut self, container: &Container) -> Result<()> {
        if container.name.trim().is_empty() {
            return Err(ReconcileError::Validation("container name MUST be non-empty".to_string())
                .into());
        }

        self.conn
            .execute(
                "INSERT INTO containers(
                    container_id, owner_id, external_id, name, item_count, reported_count, modified_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    container.container_id.to_string(),
                    container.owner.as_str(),
                    container.external_id,
                    container.name,
                    container.item_count,
                    container.reported_count,
                    rfc3339(container.modified_at)?,
                ],
            )
            .context("failed to insert container")?;
        Ok(())
    }

    /// Create or refresh a container described by a snapshot, keyed by owner and external id.
    ///
    /// # Errors
    /// Returns an error when lookup or persistence fails.
    pub fn upsert_reported_container(
        &mut self,
        owner: &OwnerId,
        descriptor: &ContainerDescriptor,
    ) -> Result<Container> {
        let modified_at = descriptor.modified_at.unwrap_or_else(OffsetDateTime::now_utc);
        if let Some(mut existing) = self.find_container_by_external_id(owner, &descriptor.external_id)? {
            existing.name.clone_from(&descriptor.name);
            existing.reported_count = descriptor.reported_count;
            existing.modified_at = modified_at;
            self.update_container(&existing)?;
            return Ok(existing);
        }

        let container = Container {
            container_id: ContainerId::new(),
            owner: owner.clone(),
            external_id: Some(descriptor.external_id.clone()),
            name: descriptor.name.clone(),
            item_count: 0,
            reported_count: descriptor.reported_count,
            modified_at,
        };
        self.insert_container(&container)?;
        Ok(container)
    }

    /// Overwrite mutable container metadata.
    ///
    /// # Errors
    /// Returns an error when the container does not exist or the update fails.
    pub fn update_container(&mut self, container: &Container) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE containers
                 SET name = ?1, item_count = ?2, reported_count = ?3, modified_at = ?4
                 WHERE container_id = ?5 AND owner_id = ?6",
                params![
                    container.name,
                    container.item_count,
                    container.reported_count,
                    rfc3339(container.modified_at)?,
                    container.container_id.to_string(),
                    container.owner.as_str(),
                ],
            )
            .context("failed to update container")?;
        if changed == 0 {
            return Err(anyhow!("container not found: {}", container.container_id));
        }
        Ok(())
    }

    /// Fetch one container by id, whoever owns it.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn get_container(&self, container_id: ContainerId) -> Result<Option<Container>> {
        load_container(&self.conn, container_id)
    }

    /// Fetch a container discovered in a snapshot by its external id.
    ///
    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn find_container_by_external_id(
        &self,
        owner: &OwnerId,
        external_id: &str,
    ) -> Result<Option<Container>> {
        let query = format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE owner_id = ?1 AND external_id = ?2"
        );
        let row = self
            .conn
            .query_row(&query, params![owner.as_str(), external_id], container_row)
            .optional()
            .context("failed to look up container by external id")?;
        row.map(ContainerRow::into_container).transpose()
    }

    /// List all containers of one owner in name order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_containers(&self, owner: &OwnerId) -> Result<Vec<Container>> {
        let query = format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE owner_id = ?1
             ORDER BY name ASC, container_id ASC"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params![owner.as_str()], container_row)?;
        let mut containers = Vec::new();
        for row in rows {
            containers.push(row?.into_container()?);
        }
        Ok(containers)
    }

    /// Persist one imported record.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert is rejected.
    pub fn insert_record(&mut self, record: &Record) -> Result<()> {
        record.validate()?;
        self.conn
            .execute(
                "INSERT INTO records(
                    record_id, owner_id, external_id, catalog_key, wear, pattern, name_tag,
                    container_id, imported_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.record_id.to_string(),
                    record.owner.as_str(),
                    record.external_id,
                    record.catalog_key,
                    record.fingerprint.wear,
                    record.fingerprint.pattern,
                    record.fingerprint.name_tag,
                    record.container_id.map(|id| id.to_string()),
                    now_rfc3339()?,
                ],
            )
            .context("failed to insert record")?;
        Ok(())
    }

    /// Overwrite a record's identity and membership fields.
    ///
    /// # Errors
    /// Returns an error when validation fails or the record does not exist for its owner.
    pub fn update_record(&mut self, record: &Record) -> Result<()> {
        record.validate()?;
        let changed = self
            .conn
            .execute(
                "UPDATE records
                 SET external_id = ?1, catalog_key = ?2, wear = ?3, pattern = ?4, name_tag = ?5,
                     container_id = ?6
                 WHERE record_id = ?7 AND owner_id = ?8",
                params![
                    record.external_id,
                    record.catalog_key,
                    record.fingerprint.wear,
                    record.fingerprint.pattern,
                    record.fingerprint.name_tag,
                    record.container_id.map(|id| id.to_string()),
                    record.record_id.to_string(),
                    record.owner.as_str(),
                ],
            )
            .context("failed to update record")?;
        if changed == 0 {
            return Err(anyhow!("record not found: {}", record.record_id));
        }
        Ok(())
    }

    /// Remove a record. Returns whether a row was deleted.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_record(&mut self, owner: &OwnerId, record_id: RecordId) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM records WHERE record_id = ?1 AND owner_id = ?2",
                params![record_id.to_string(), owner.as_str()],
            )
            .context("failed to delete record")?;
        Ok(changed > 0)
    }

    /// Records of one owner that sit in no container, in import order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn find_active_by_owner(&self, owner: &OwnerId) -> Result<Vec<Record>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE owner_id = ?1 AND container_id IS NULL
             ORDER BY rowid ASC"
        );
        self.query_records(&query, params![owner.as_str()])
    }

    /// Records of one owner held in the given container, in import order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn find_by_container(
        &self,
        owner: &OwnerId,
        container_id: ContainerId,
    ) -> Result<Vec<Record>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE owner_id = ?1 AND container_id = ?2
             ORDER BY rowid ASC"
        );
        self.query_records(&query, params![owner.as_str(), container_id.to_string()])
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn find_by_owner_and_id(
        &self,
        owner: &OwnerId,
        record_id: RecordId,
    ) -> Result<Option<Record>> {
        let query =
            format!("SELECT {RECORD_COLUMNS} FROM records WHERE owner_id = ?1 AND record_id = ?2");
        let row = self
            .conn
            .query_row(&query, params![owner.as_str(), record_id.to_string()], record_row)
            .optional()
            .context("failed to look up record")?;
        row.map(RecordRow::into_record).transpose()
    }

    /// # Errors
    /// Returns an error when the lookup or row decoding fails.
    pub fn find_by_external_id(&self, owner: &OwnerId, external_id: &str) -> Result<Option<Record>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE owner_id = ?1 AND external_id = ?2
             ORDER BY rowid ASC LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&query, params![owner.as_str(), external_id], record_row)
            .optional()
            .context("failed to look up record by external id")?;
        row.map(RecordRow::into_record).transpose()
    }

    /// Number of records currently assigned to a container.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_members(&self, container_id: ContainerId) -> Result<u32> {
        count_members(&self.conn, container_id)
    }

    /// Apply a previewed transfer as one atomic state transition.
    ///
    /// Per-record problems are collected into [`TransferOutcome::failures`] and do not abort
    /// the transaction. Any store error rolls back every change made by this call.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Unauthorized`] when the container is missing or belongs to
    /// another owner, or a store error when any statement or the commit fails.
    pub fn apply_transfer(&mut self, operation: &PendingOperation) -> Result<TransferOutcome> {
        // Take the write lock up front so concurrent writers queue on busy_timeout.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transfer transaction")?;

        let container = load_container(&tx, operation.container_id)?
            .filter(|container| container.owner == operation.owner)
            .ok_or_else(|| {
                ReconcileError::Unauthorized(format!(
                    "container {} is not owned by {}",
                    operation.container_id, operation.owner
                ))
            })?;
        let target = operation.container_id.to_string();

        let mut moved = Vec::new();
        let mut failures = Vec::new();
        for record_id in &operation.record_ids {
            let row = tx
                .query_row(
                    "SELECT owner_id, container_id FROM records WHERE record_id = ?1",
                    params![record_id.to_string()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()
                .context("failed to re-fetch record")?;

            let reason = match row {
                None => Some(ItemFailureReason::Missing),
                Some((owner_raw, _)) if owner_raw != operation.owner.as_str() => {
                    Some(ItemFailureReason::Unauthorized)
                }
                Some((_, current)) => match operation.kind {
                    TransferKind::Deposit if current.is_some() => {
                        Some(ItemFailureReason::NotInActivePool)
                    }
                    TransferKind::Withdraw if current.as_deref() != Some(target.as_str()) => {
                        Some(ItemFailureReason::NotInContainer)
                    }
                    _ => None,
                },
            };
            if let Some(reason) = reason {
                warn!(record_id = %record_id, reason = reason.as_str(), "transfer item skipped");
                failures.push(ItemFailure { record_id: *record_id, reason });
                continue;
            }

            let new_container = match operation.kind {
                TransferKind::Deposit => Some(target.as_str()),
                TransferKind::Withdraw => None,
            };
            tx.execute(
                "UPDATE records SET container_id = ?1 WHERE record_id = ?2 AND owner_id = ?3",
                params![new_container, record_id.to_string(), operation.owner.as_str()],
            )
            .context("failed to update record membership")?;
            moved.push(*record_id);
        }

        let moved_ids = moved.iter().copied().collect::<HashSet<_>>();
        let rewrites = operation
            .rewrites
            .iter()
            .filter(|rewrite| moved_ids.contains(&rewrite.record_id))
            .cloned()
            .collect::<Vec<_>>();
        for rewrite in &rewrites {
            tx.execute(
                "UPDATE records SET external_id = ?1 WHERE record_id = ?2 AND owner_id = ?3",
                params![rewrite.external_id, rewrite.record_id.to_string(), operation.owner.as_str()],
            )
            .context("failed to persist external id rewrite")?;
        }

        let item_count = count_members(&tx, operation.container_id)?;
        let reported_count = match operation.container_report {
            Some(report) if container.is_external() => Some(report.reported_count),
            _ => container.reported_count,
        };
        let reported_count_updated =
            container.is_external() && operation.container_report.is_some();
        let now = now_rfc3339()?;
        let modified_at = match operation.container_report {
            Some(ContainerReport { modified_at: Some(reported), .. }) if container.is_external() => {
                rfc3339(reported)?
            }
            _ => now.clone(),
        };
        tx.execute(
            "UPDATE containers SET item_count = ?1, reported_count = ?2, modified_at = ?3
             WHERE container_id = ?4",
            params![item_count, reported_count, modified_at, target],
        )
        .context("failed to refresh container counts")?;

        tx.execute(
            "INSERT INTO transfer_log(
                operation_token, owner_id, kind, container_id, requested, moved, failed,
                item_count, snapshot_digest, committed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                operation.token.to_string(),
                operation.owner.as_str(),
                operation.kind.as_str(),
                target,
                saturating_count(operation.record_ids.len()),
                saturating_count(moved.len()),
                saturating_count(failures.len()),
                item_count,
                operation.snapshot_digest,
                now,
            ],
        )
        .context("failed to append transfer log")?;
        for rewrite in &rewrites {
            tx.execute(
                "INSERT INTO external_id_rewrites(
                    operation_token, record_id, previous_external_id, external_id, rewritten_at
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    operation.token.to_string(),
                    rewrite.record_id.to_string(),
                    rewrite.previous_external_id,
                    rewrite.external_id,
                    now,
                ],
            )
            .context("failed to append external id rewrite")?;
        }

        tx.commit().context("failed to commit transfer transaction")?;
        debug!(
            token = %operation.token,
            moved = moved.len(),
            failed = failures.len(),
            item_count,
            "transfer committed"
        );

        Ok(TransferOutcome { moved, failures, item_count, reported_count_updated })
    }

    /// Committed transfers for one container, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_transfer_log(
        &self,
        owner: &OwnerId,
        container_id: ContainerId,
    ) -> Result<Vec<TransferLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT operation_token, owner_id, kind, container_id, requested, moved, failed,
                    item_count, snapshot_digest, committed_at
             FROM transfer_log
             WHERE owner_id = ?1 AND container_id = ?2
             ORDER BY id DESC",
        )?;
        let mut rows = stmt.query(params![owner.as_str(), container_id.to_string()])?;
        let mut entries = Vec::new();

        while let Some(row) = rows.next()? {
            let token_raw: String = row.get(0)?;
            let kind_raw: String = row.get(2)?;
            let container_raw: String = row.get(3)?;
            let operation_token = OperationToken(parse_ulid(&token_raw)?);
            entries.push(TransferLogEntry {
                operation_token,
                owner: OwnerId::parse(&row.get::<_, String>(1)?)?,
                kind: TransferKind::parse(&kind_raw)
                    .ok_or_else(|| anyhow!("unknown transfer kind: {kind_raw}"))?,
                container_id: ContainerId(parse_ulid(&container_raw)?),
                requested: row.get(4)?,
                moved: row.get(5)?,
                failed: row.get(6)?,
                item_count: row.get(7)?,
                snapshot_digest: row.get(8)?,
                committed_at: parse_rfc3339(&row.get::<_, String>(9)?)?,
                rewrites: self.load_rewrites(operation_token)?,
            });
        }

        Ok(entries)
    }

    /// Run quick-check, foreign-key-check, count-drift, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT c.container_id, c.item_count, COUNT(r.record_id)
             FROM containers c LEFT JOIN records r ON r.container_id = c.container_id
             GROUP BY c.container_id
             HAVING c.item_count != COUNT(r.record_id)
             ORDER BY c.container_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut count_drift = Vec::new();
        while let Some(row) = rows.next()? {
            let container_raw: String = row.get(0)?;
            count_drift.push(CountDrift {
                container_id: ContainerId(parse_ulid(&container_raw)?),
                stored_count: row.get(1)?,
                actual_count: row.get(2)?,
            });
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            count_drift,
            schema_status,
        })
    }

    fn query_records(&self, query: &str, params: impl rusqlite::Params) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(query)?;
        let rows = stmt.query_map(params, record_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn load_rewrites(&self, token: OperationToken) -> Result<Vec<ExternalIdRewrite>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, previous_external_id, external_id
             FROM external_id_rewrites
             WHERE operation_token = ?1
             ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![token.to_string()])?;
        let mut rewrites = Vec::new();
        while let Some(row) = rows.next()? {
            let record_raw: String = row.get(0)?;
            rewrites.push(ExternalIdRewrite {
                record_id: RecordId(parse_ulid(&record_raw)?),
                previous_external_id: row.get(1)?,
                external_id: row.get(2)?,
            });
        }
        Ok(rewrites)
    }
}

#[derive(Debug)]
struct RecordRow {
    record_id: String,
    owner_id: String,
    external_id: String,
    catalog_key: String,
    wear: Option<f64>,
    pattern: Option<u32>,
    name_tag: Option<String>,
    container_id: Option<String>,
}

impl RecordRow {
    fn into_record(self) -> Result<Record> {
        Ok(Record {
            record_id: RecordId(parse_ulid(&self.record_id)?),
            owner: OwnerId::parse(&self.owner_id)?,
            external_id: self.external_id,
            catalog_key: self.catalog_key,
            fingerprint: Fingerprint {
                wear: self.wear,
                pattern: self.pattern,
                name_tag: self.name_tag,
            },
            container_id: self
                .container_id
                .map(|raw| parse_ulid(&raw).map(ContainerId))
                .transpose()?,
        })
    }
}

fn record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        record_id: row.get(0)?,
        owner_id: row.get(1)?,
        external_id: row.get(2)?,
        catalog_key: row.get(3)?,
        wear: row.get(4)?,
        pattern: row.get(5)?,
        name_tag: row.get(6)?,
        container_id: row.get(7)?,
    })
}

#[derive(Debug)]
struct ContainerRow {
    container_id: String,
    owner_id: String,
    external_id: Option<String>,
    name: String,
    item_count: u32,
    reported_count: Option<u32>,
    modified_at: String,
}

impl ContainerRow {
    fn into_container(self) -> Result<Container> {
        Ok(Container {
            container_id: ContainerId(parse_ulid(&self.container_id)?),
            owner: OwnerId::parse(&self.owner_id)?,
            external_id: self.external_id,
            name: self.name,
            item_count: self.item_count,
            reported_count: self.reported_count,
            modified_at: parse_rfc3339(&self.modified_at)?,
        })
    }
}

fn container_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContainerRow> {
    Ok(ContainerRow {
        container_id: row.get(0)?,
        owner_id: row.get(1)?,
        external_id: row.get(2)?,
        name: row.get(3)?,
        item_count: row.get(4)?,
        reported_count: row.get(5)?,
        modified_at: row.get(6)?,
    })
}

fn load_container(conn: &Connection, container_id: ContainerId) -> Result<Option<Container>> {
    let query = format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE container_id = ?1");
    let row = conn
        .query_row(&query, params![container_id.to_string()], container_row)
        .optional()
        .context("failed to load container")?;
    row.map(ContainerRow::into_container).transpose()
}

fn count_members(conn: &Connection, container_id: ContainerId) -> Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM records WHERE container_id = ?1",
        params![container_id.to_string()],
        |row| row.get::<_, u32>(0),
    )
    .context("failed to count container members")
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    let has_records = table_exists(conn, "records")?;
    let has_containers = table_exists(conn, "containers")?;
    match (has_records, has_containers) {
        (false, false) => Ok((0, false)),
        (true, true) if table_exists(conn, "transfer_log")? => Ok((2, true)),
        (true, true) => Ok((1, true)),
        _ => Err(anyhow!(
            "database schema is invalid: records and containers tables must exist together"
        )),
    }
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}
