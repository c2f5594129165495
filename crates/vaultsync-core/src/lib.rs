use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Absolute tolerance used when comparing wear values during attribute matching.
pub const WEAR_TOLERANCE: f64 = 1e-7;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconcileError {
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("operation not found: {0}")]
    OperationNotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transaction failure: {0}")]
    TransactionFailure(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid operation transition: {from} on {event}")]
    InvalidTransition { from: OperationState, event: OperationEvent },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = ReconcileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| ReconcileError::Validation(format!("invalid record id {value}: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContainerId(pub Ulid);

impl ContainerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ContainerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = ReconcileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self).map_err(|err| {
            ReconcileError::Validation(format!("invalid container id {value}: {err}"))
        })
    }
}

/// Opaque continuation token handed out by a preview and redeemed by a confirm.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OperationToken(pub Ulid);

impl OperationToken {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for OperationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OperationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationToken {
    type Err = ReconcileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|_| ReconcileError::OperationNotFound(format!("unknown token {value}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Build an owner id from caller-supplied text.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Unauthorized`] when the value is blank.
    pub fn parse(value: &str) -> Result<Self, ReconcileError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ReconcileError::Unauthorized("owner id MUST be provided".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Deposit,
    Withdraw,
}

impl TransferKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deposit" => Some(Self::Deposit),
            "withdraw" => Some(Self::Withdraw),
            _ => None,
        }
    }
}

/// Fine-grained attributes that fingerprint one physical instance of a catalog entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Fingerprint {
    #[serde(default)]
    pub wear: Option<f64>,
    #[serde(default)]
    pub pattern: Option<u32>,
    #[serde(default)]
    pub name_tag: Option<String>,
}

impl Fingerprint {
    /// Attributes present on both sides must agree; an attribute missing on either side
    /// does not take part in the comparison.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        let wear = match (self.wear, other.wear) {
            (Some(lhs), Some(rhs)) => (lhs - rhs).abs() < WEAR_TOLERANCE,
            _ => true,
        };
        let pattern = match (self.pattern, other.pattern) {
            (Some(lhs), Some(rhs)) => lhs == rhs,
            _ => true,
        };
        let name_tag = match (&self.name_tag, &other.name_tag) {
            (Some(lhs), Some(rhs)) => lhs == rhs,
            _ => true,
        };
        wear && pattern && name_tag
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub record_id: RecordId,
    pub owner: OwnerId,
    pub external_id: String,
    pub catalog_key: String,
    #[serde(flatten)]
    pub fingerprint: Fingerprint,
    pub container_id: Option<ContainerId>,
}

impl Record {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.container_id.is_none()
    }

    /// Validate identity fields before persistence.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Validation`] when external id or catalog key are blank.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.external_id.trim().is_empty() {
            return Err(ReconcileError::Validation("external_id MUST be non-empty".to_string()));
        }
        if self.catalog_key.trim().is_empty() {
            return Err(ReconcileError::Validation("catalog_key MUST be non-empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Container {
    pub container_id: ContainerId,
    pub owner: OwnerId,
    pub external_id: Option<String>,
    pub name: String,
    pub item_count: u32,
    pub reported_count: Option<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
}

impl Container {
    /// Build a holding location that was never seen in a snapshot.
    #[must_use]
    pub fn manual(owner: OwnerId, name: &str) -> Self {
        Self {
            container_id: ContainerId::new(),
            owner,
            external_id: None,
            name: name.to_string(),
            item_count: 0,
            reported_count: None,
            modified_at: OffsetDateTime::now_utc(),
        }
    }

    #[must_use]
    pub fn is_external(&self) -> bool {
        self.external_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemDescriptor {
    pub external_id: String,
    pub catalog_key: String,
    #[serde(flatten)]
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContainerDescriptor {
    pub external_id: String,
    pub name: String,
    #[serde(default)]
    pub reported_count: Option<u32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub modified_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub items: Vec<ItemDescriptor>,
    #[serde(default)]
    pub containers: Vec<ContainerDescriptor>,
}

impl Snapshot {
    /// Check that every descriptor carries the identity fields the differ relies on.
    ///
    /// # Errors
    /// Returns [`ReconcileError::MalformedSnapshot`] naming the first offending descriptor.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        for (index, item) in self.items.iter().enumerate() {
            if item.external_id.trim().is_empty() {
                return Err(ReconcileError::MalformedSnapshot(format!(
                    "items[{index}].external_id MUST be non-empty"
                )));
            }
            if item.catalog_key.trim().is_empty() {
                return Err(ReconcileError::MalformedSnapshot(format!(
                    "items[{index}].catalog_key MUST be non-empty"
                )));
            }
            if item.fingerprint.wear.is_some_and(|wear| !wear.is_finite()) {
                return Err(ReconcileError::MalformedSnapshot(format!(
                    "items[{index}].wear MUST be finite"
                )));
            }
        }
        for (index, container) in self.containers.iter().enumerate() {
            if container.external_id.trim().is_empty() {
                return Err(ReconcileError::MalformedSnapshot(format!(
                    "containers[{index}].external_id MUST be non-empty"
                )));
            }
        }
        Ok(())
    }

    /// Metadata reported for one container, if this snapshot described it.
    #[must_use]
    pub fn container_report(&self, external_id: &str) -> Option<ContainerReport> {
        self.containers
            .iter()
            .find(|descriptor| descriptor.external_id == external_id)
            .and_then(|descriptor| {
                descriptor.reported_count.map(|reported_count| ContainerReport {
                    reported_count,
                    modified_at: descriptor.modified_at,
                })
            })
    }
}

/// Turns raw snapshot text into a typed [`Snapshot`].
pub trait ImportPipeline: Send + Sync {
    /// Parse snapshot text.
    ///
    /// # Errors
    /// Returns [`ReconcileError::MalformedSnapshot`] when the text cannot be parsed or
    /// describes invalid descriptors.
    fn parse(&self, text: &str) -> Result<Snapshot, ReconcileError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonImportPipeline;

impl ImportPipeline for JsonImportPipeline {
    fn parse(&self, text: &str) -> Result<Snapshot, ReconcileError> {
        if text.trim().is_empty() {
            return Err(ReconcileError::MalformedSnapshot("snapshot text is empty".to_string()));
        }
        let snapshot: Snapshot = serde_json::from_str(text)
            .map_err(|err| ReconcileError::MalformedSnapshot(err.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContainerReport {
    pub reported_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffWarning {
    EmptySnapshot,
    DuplicateExternalId { external_id: String },
    UnresolvedDescriptor { external_id: String, catalog_key: String },
    AmbiguousMatch { external_id: String, candidates: usize, chosen: RecordId },
}

impl Display for DiffWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptySnapshot => {
                f.write_str("snapshot lists no items; every active record is treated as moved")
            }
            Self::DuplicateExternalId { external_id } => {
                write!(f, "external id {external_id} appears more than once; first occurrence used")
            }
            Self::UnresolvedDescriptor { external_id, catalog_key } => write!(
                f,
                "descriptor {external_id} ({catalog_key}) could not be resolved to an inventory record"
            ),
            Self::AmbiguousMatch { external_id, candidates, chosen } => write!(
                f,
                "descriptor {external_id} matched {candidates} records by attributes; picked {chosen}"
            ),
        }
    }
}

/// External-id index over one snapshot. Later duplicates are ignored.
#[derive(Debug)]
pub struct SnapshotIndex<'a> {
    ids: HashSet<&'a str>,
    descriptors: Vec<&'a ItemDescriptor>,
    duplicates: Vec<String>,
}

impl<'a> SnapshotIndex<'a> {
    #[must_use]
    pub fn build(snapshot: &'a Snapshot) -> Self {
        let mut ids = HashSet::with_capacity(snapshot.items.len());
        let mut descriptors = Vec::with_capacity(snapshot.items.len());
        let mut duplicates = Vec::new();
        for item in &snapshot.items {
            if ids.insert(item.external_id.as_str()) {
                descriptors.push(item);
            } else {
                warn!(external_id = %item.external_id, "duplicate external id in snapshot");
                duplicates.push(item.external_id.clone());
            }
        }
        Self { ids, descriptors, duplicates }
    }

    #[must_use]
    pub fn contains(&self, external_id: &str) -> bool {
        self.ids.contains(external_id)
    }

    #[must_use]
    pub fn descriptors(&self) -> &[&'a ItemDescriptor] {
        &self.descriptors
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    fn warnings(&self) -> Vec<DiffWarning> {
        self.duplicates
            .iter()
            .map(|external_id| DiffWarning::DuplicateExternalId { external_id: external_id.clone() })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepositDiff {
    pub disappeared: Vec<Record>,
    pub warnings: Vec<DiffWarning>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawDiff {
    pub appeared: Vec<Record>,
    pub rewrites: Vec<ExternalIdRewrite>,
    pub warnings: Vec<DiffWarning>,
}

impl WithdrawDiff {
    #[must_use]
    pub fn unresolved_count(&self) -> usize {
        self.warnings
            .iter()
            .filter(|warning| matches!(warning, DiffWarning::UnresolvedDescriptor { .. }))
            .count()
    }
}

/// Active-pool records whose external id is missing from the snapshot, in pool order.
#[must_use]
pub fn diff_for_deposit(active_pool: &[Record], snapshot: &Snapshot) -> DepositDiff {
    let index = SnapshotIndex::build(snapshot);
    let mut warnings = index.warnings();
    if index.is_empty() {
        warn!(active_records = active_pool.len(), "empty snapshot; all active records disappeared");
        warnings.push(DiffWarning::EmptySnapshot);
    }

    let disappeared = active_pool
        .iter()
        .filter(|record| !index.contains(&record.external_id))
        .cloned()
        .collect::<Vec<_>>();
    debug!(disappeared = disappeared.len(), "deposit diff computed");

    DepositDiff { disappeared, warnings }
}

/// Snapshot descriptors absent from the active pool, resolved against the container contents.
///
/// Matching rewrites external ids on `container_contents` in place; the rewrites are also
/// returned so they can be persisted when the transfer commits. Results follow container order.
#[must_use]
pub fn diff_for_withdraw(
    active_pool: &[Record],
    snapshot: &Snapshot,
    container_contents: &mut [Record],
) -> WithdrawDiff {
    let index = SnapshotIndex::build(snapshot);
    let active_ids =
        active_pool.iter().map(|record| record.external_id.as_str()).collect::<HashSet<_>>();
    let mut warnings = index.warnings();
    let mut resolver = IdentityResolver::new();
    let mut matched = Vec::new();

    // Exact ids are claimed before any attribute match so a reissued descriptor cannot take
    // a record that another descriptor names directly.
    let mut pending = Vec::new();
    for descriptor in index.descriptors() {
        if active_ids.contains(descriptor.external_id.as_str()) {
            continue;
        }
        match resolver.resolve_exact(descriptor, container_contents) {
            Some(found) => matched.push(found.index),
            None => pending.push(*descriptor),
        }
    }

    for descriptor in pending {
        if let Some(found) = resolver.resolve_by_attributes(descriptor, container_contents) {
            matched.push(found.index);
        } else {
            warn!(
                external_id = %descriptor.external_id,
                catalog_key = %descriptor.catalog_key,
                "snapshot descriptor did not resolve to a container record"
            );
            warnings.push(DiffWarning::UnresolvedDescriptor {
                external_id: descriptor.external_id.clone(),
                catalog_key: descriptor.catalog_key.clone(),
            });
        }
    }

    matched.sort_unstable();
    let appeared = matched
        .into_iter()
        .filter_map(|position| container_contents.get(position).cloned())
        .collect::<Vec<_>>();
    let (rewrites, resolver_warnings) = resolver.into_parts();
    warnings.extend(resolver_warnings);
    debug!(appeared = appeared.len(), rewrites = rewrites.len(), "withdraw diff computed");

    WithdrawDiff { appeared, rewrites, warnings }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    ExternalId,
    Attributes,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ResolvedMatch {
    pub index: usize,
    pub record_id: RecordId,
    pub tier: MatchTier,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExternalIdRewrite {
    pub record_id: RecordId,
    pub previous_external_id: String,
    pub external_id: String,
}

/// Tiered identity matching of snapshot descriptors against persisted records.
///
/// Exact external id wins; otherwise the first candidate with the same catalog key and a
/// compatible [`Fingerprint`] is taken. A record claimed by one descriptor is never handed
/// to another descriptor by the same resolver.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    claimed: HashSet<RecordId>,
    rewrites: Vec<ExternalIdRewrite>,
    warnings: Vec<DiffWarning>,
}

impl IdentityResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(
        &mut self,
        descriptor: &ItemDescriptor,
        candidates: &mut [Record],
    ) -> Option<ResolvedMatch> {
        self.resolve_exact(descriptor, candidates)
            .or_else(|| self.resolve_by_attributes(descriptor, candidates))
    }

    /// Claims the first unclaimed candidate carrying the descriptor's external id.
    pub fn resolve_exact(
        &mut self,
        descriptor: &ItemDescriptor,
        candidates: &[Record],
    ) -> Option<ResolvedMatch> {
        let index = candidates.iter().position(|candidate| {
            candidate.external_id == descriptor.external_id
                && !self.claimed.contains(&candidate.record_id)
        })?;
        let record_id = candidates.get(index)?.record_id;
        self.claimed.insert(record_id);
        Some(ResolvedMatch { index, record_id, tier: MatchTier::ExternalId })
    }

    /// Claims the first unclaimed candidate with the same catalog key and a compatible
    /// fingerprint, rewriting its external id to the descriptor's.
    pub fn resolve_by_attributes(
        &mut self,
        descriptor: &ItemDescriptor,
        candidates: &mut [Record],
    ) -> Option<ResolvedMatch> {
        let matching = candidates
            .iter()
            .enumerate()
            .filter(|(_, candidate)| {
                !self.claimed.contains(&candidate.record_id)
                    && candidate.catalog_key == descriptor.catalog_key
                    && candidate.fingerprint.matches(&descriptor.fingerprint)
            })
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        let index = *matching.first()?;
        let candidate = candidates.get_mut(index)?;

        if matching.len() > 1 {
            // Known limitation: no stricter tie-break exists, the first candidate wins.
            warn!(
                external_id = %descriptor.external_id,
                candidates = matching.len(),
                chosen = %candidate.record_id,
                "ambiguous attribute match"
            );
            self.warnings.push(DiffWarning::AmbiguousMatch {
                external_id: descriptor.external_id.clone(),
                candidates: matching.len(),
                chosen: candidate.record_id,
            });
        }

        if candidate.external_id != descriptor.external_id {
            info!(
                record_id = %candidate.record_id,
                previous_external_id = %candidate.external_id,
                external_id = %descriptor.external_id,
                "external id reissued; rewriting"
            );
            self.rewrites.push(ExternalIdRewrite {
                record_id: candidate.record_id,
                previous_external_id: candidate.external_id.clone(),
                external_id: descriptor.external_id.clone(),
            });
            candidate.external_id.clone_from(&descriptor.external_id);
        }

        self.claimed.insert(candidate.record_id);
        Some(ResolvedMatch { index, record_id: candidate.record_id, tier: MatchTier::Attributes })
    }

    #[must_use]
    pub fn rewrites(&self) -> &[ExternalIdRewrite] {
        &self.rewrites
    }

    #[must_use]
    pub fn into_parts(self) -> (Vec<ExternalIdRewrite>, Vec<DiffWarning>) {
        (self.rewrites, self.warnings)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    None,
    Previewed,
    Executed,
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum OperationEvent {
    Preview,
    Confirm,
    Expire,
}

impl OperationState {
    /// Advance the preview/confirm lifecycle.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidTransition`] for any move out of a terminal state
    /// or any event the current state does not accept.
    pub fn transition(self, event: OperationEvent) -> Result<Self, ReconcileError> {
        match (self, event) {
            (Self::None, OperationEvent::Preview) => Ok(Self::Previewed),
            (Self::Previewed, OperationEvent::Confirm) => Ok(Self::Executed),
            (Self::Previewed, OperationEvent::Expire) => Ok(Self::Expired),
            (from, event) => Err(ReconcileError::InvalidTransition { from, event }),
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Expired)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Previewed => "previewed",
            Self::Executed => "executed",
            Self::Expired => "expired",
        }
    }
}

impl Display for OperationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Display for OperationEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Preview => "preview",
            Self::Confirm => "confirm",
            Self::Expire => "expire",
        })
    }
}

/// Everything a confirm needs to replay a preview without re-reading the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PendingOperation {
    pub token: OperationToken,
    pub owner: OwnerId,
    pub kind: TransferKind,
    pub container_id: ContainerId,
    pub record_ids: Vec<RecordId>,
    pub rewrites: Vec<ExternalIdRewrite>,
    pub container_report: Option<ContainerReport>,
    pub snapshot_digest: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ItemFailureReason {
    Missing,
    Unauthorized,
    NotInActivePool,
    NotInContainer,
}

impl ItemFailureReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Unauthorized => "unauthorized",
            Self::NotInActivePool => "not_in_active_pool",
            Self::NotInContainer => "not_in_container",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemFailure {
    pub record_id: RecordId,
    pub reason: ItemFailureReason,
}

impl Display for ItemFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "record {} skipped: {}", self.record_id, self.reason.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TransferOutcome {
    pub moved: Vec<RecordId>,
    pub failures: Vec<ItemFailure>,
    pub item_count: u32,
    pub reported_count_updated: bool,
}

/// Converts a collection length to the `u32` counts carried in outcomes and logs, saturating.
#[must_use]
pub fn saturating_count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn owner() -> OwnerId {
        match OwnerId::parse("owner-1") {
            Ok(owner) => owner,
            Err(err) => panic!("fixture owner should parse: {err}"),
        }
    }

    fn mk_record(external_id: &str, catalog_key: &str, wear: Option<f64>) -> Record {
        Record {
            record_id: RecordId::new(),
            owner: owner(),
            external_id: external_id.to_string(),
            catalog_key: catalog_key.to_string(),
            fingerprint: Fingerprint { wear, pattern: None, name_tag: None },
            container_id: None,
        }
    }

    fn mk_descriptor(external_id: &str, catalog_key: &str, wear: Option<f64>) -> ItemDescriptor {
        ItemDescriptor {
            external_id: external_id.to_string(),
            catalog_key: catalog_key.to_string(),
            fingerprint: Fingerprint { wear, pattern: None, name_tag: None },
        }
    }

    fn mk_snapshot(external_ids: &[&str]) -> Snapshot {
        Snapshot {
            items: external_ids.iter().map(|id| mk_descriptor(id, "K", None)).collect(),
            containers: Vec::new(),
        }
    }

    #[test]
    fn deposit_diff_returns_records_missing_from_snapshot() {
        let a = mk_record("1", "K", None);
        let b = mk_record("2", "K", None);
        let diff = diff_for_deposit(&[a.clone(), b], &mk_snapshot(&["2"]));

        assert_eq!(diff.disappeared, vec![a]);
        assert!(diff.warnings.is_empty());
    }

    #[test]
    fn deposit_diff_with_empty_snapshot_moves_everything() {
        let pool = vec![mk_record("1", "K", None), mk_record("2", "K", None)];
        let diff = diff_for_deposit(&pool, &Snapshot::default());

        assert_eq!(diff.disappeared, pool);
        assert_eq!(diff.warnings, vec![DiffWarning::EmptySnapshot]);
    }

    #[test]
    fn duplicate_snapshot_ids_keep_first_and_warn() {
        let snapshot = mk_snapshot(&["1", "2", "1"]);
        let index = SnapshotIndex::build(&snapshot);

        assert_eq!(index.descriptors().len(), 2);
        assert_eq!(
            index.warnings(),
            vec![DiffWarning::DuplicateExternalId { external_id: "1".to_string() }]
        );
    }

    #[test]
    fn resolver_prefers_exact_external_id() {
        let mut candidates =
            vec![mk_record("10", "K", Some(0.5)), mk_record("99", "K", Some(0.9))];
        let mut resolver = IdentityResolver::new();

        let found = resolver.resolve(&mk_descriptor("99", "K", Some(0.5)), &mut candidates);

        let Some(found) = found else { panic!("descriptor should resolve") };
        assert_eq!(found.index, 1);
        assert_eq!(found.tier, MatchTier::ExternalId);
        assert!(resolver.rewrites().is_empty());
    }

    #[test]
    fn resolver_matches_wear_within_tolerance() {
        let mut candidates = vec![mk_record("10", "K", Some(0.234_560_00))];
        let mut resolver = IdentityResolver::new();

        let found = resolver.resolve(&mk_descriptor("11", "K", Some(0.234_560_01)), &mut candidates);

        assert_eq!(found.map(|found| found.tier), Some(MatchTier::Attributes));
    }

    #[test]
    fn resolver_rejects_wear_outside_tolerance() {
        let mut candidates = vec![mk_record("10", "K", Some(0.234))];
        let mut resolver = IdentityResolver::new();

        assert!(resolver.resolve(&mk_descriptor("11", "K", Some(0.235)), &mut candidates).is_none());
        assert_eq!(candidates[0].external_id, "10");
    }

    #[test]
    fn resolver_rewrites_external_id_on_attribute_match() {
        let mut candidates = vec![mk_record("10", "K", Some(0.5))];
        let record_id = candidates[0].record_id;
        let mut resolver = IdentityResolver::new();

        let found = resolver.resolve(&mk_descriptor("99", "K", Some(0.5)), &mut candidates);

        assert!(found.is_some());
        assert_eq!(candidates[0].external_id, "99");
        assert_eq!(
            resolver.rewrites(),
            &[ExternalIdRewrite {
                record_id,
                previous_external_id: "10".to_string(),
                external_id: "99".to_string(),
            }]
        );
    }

    #[test]
    fn resolver_requires_same_catalog_key() {
        let mut candidates = vec![mk_record("10", "K", Some(0.5))];
        let mut resolver = IdentityResolver::new();

        assert!(resolver.resolve(&mk_descriptor("99", "OTHER", Some(0.5)), &mut candidates).is_none());
    }

    #[test]
    fn absent_attributes_are_ignored_per_attribute() {
        let mut with_pattern = mk_record("10", "K", None);
        with_pattern.fingerprint.pattern = Some(661);
        let mut descriptor = mk_descriptor("99", "K", Some(0.12));
        descriptor.fingerprint.pattern = Some(661);
        let mut candidates = vec![with_pattern];
        let mut resolver = IdentityResolver::new();

        assert!(resolver.resolve(&descriptor, &mut candidates).is_some());

        let mut other_pattern = mk_record("11", "K", None);
        other_pattern.fingerprint.pattern = Some(1);
        let mut candidates = vec![other_pattern];
        let mut resolver = IdentityResolver::new();
        assert!(resolver.resolve(&descriptor, &mut candidates).is_none());
    }

    #[test]
    fn ambiguous_attribute_match_picks_first_and_warns() {
        let mut candidates = vec![mk_record("10", "K", None), mk_record("11", "K", None)];
        let first = candidates[0].record_id;
        let mut resolver = IdentityResolver::new();

        let found = resolver.resolve(&mk_descriptor("99", "K", Some(0.3)), &mut candidates);

        assert_eq!(found.map(|found| found.record_id), Some(first));
        let (_, warnings) = resolver.into_parts();
        assert_eq!(
            warnings,
            vec![DiffWarning::AmbiguousMatch {
                external_id: "99".to_string(),
                candidates: 2,
                chosen: first
            }]
        );
    }

    #[test]
    fn claimed_candidates_are_not_matched_twice() {
        let mut candidates = vec![mk_record("10", "K", Some(0.5))];
        let mut resolver = IdentityResolver::new();

        assert!(resolver.resolve(&mk_descriptor("98", "K", Some(0.5)), &mut candidates).is_some());
        assert!(resolver.resolve(&mk_descriptor("99", "K", Some(0.5)), &mut candidates).is_none());
    }

    #[test]
    fn withdraw_diff_resolves_reissued_ids_against_container() {
        let container_id = ContainerId::new();
        let mut stored = mk_record("10", "K", Some(0.5));
        stored.container_id = Some(container_id);
        let stored_id = stored.record_id;
        let mut contents = vec![stored];
        let snapshot = Snapshot { items: vec![mk_descriptor("99", "K", Some(0.5))], containers: vec![] };

        let diff = diff_for_withdraw(&[], &snapshot, &mut contents);

        assert_eq!(diff.appeared.len(), 1);
        assert_eq!(diff.appeared[0].record_id, stored_id);
        assert_eq!(diff.appeared[0].external_id, "99");
        assert_eq!(diff.rewrites.len(), 1);
        assert_eq!(diff.unresolved_count(), 0);
    }

    #[test]
    fn withdraw_diff_skips_active_ids_and_reports_unresolved() {
        let active = vec![mk_record("1", "K", None)];
        let mut contents = vec![mk_record("10", "K", Some(0.5))];
        let snapshot = Snapshot {
            items: vec![
                mk_descriptor("1", "K", None),
                mk_descriptor("10", "K", Some(0.5)),
                mk_descriptor("77", "UNKNOWN", None),
            ],
            containers: vec![],
        };

        let diff = diff_for_withdraw(&active, &snapshot, &mut contents);

        assert_eq!(diff.appeared.len(), 1);
        assert_eq!(diff.appeared[0].external_id, "10");
        assert_eq!(diff.unresolved_count(), 1);
    }

    #[test]
    fn withdraw_diff_orders_results_by_container_contents() {
        let mut contents = vec![mk_record("a", "K", None), mk_record("b", "K", None)];
        let expected = contents.iter().map(|record| record.record_id).collect::<Vec<_>>();
        let snapshot = Snapshot {
            items: vec![mk_descriptor("b", "K", None), mk_descriptor("a", "K", None)],
            containers: vec![],
        };

        let diff = diff_for_withdraw(&[], &snapshot, &mut contents);

        assert_eq!(diff.appeared.iter().map(|record| record.record_id).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn exact_ids_are_claimed_before_attribute_matches() {
        let mut contents = vec![mk_record("10", "K", None), mk_record("11", "K", None)];
        let kept = contents[0].record_id;
        let reissued = contents[1].record_id;
        let snapshot = Snapshot {
            items: vec![mk_descriptor("99", "K", None), mk_descriptor("10", "K", None)],
            containers: vec![],
        };

        let diff = diff_for_withdraw(&[], &snapshot, &mut contents);

        assert_eq!(contents[0].external_id, "10");
        assert_eq!(contents[1].external_id, "99");
        assert_eq!(
            diff.rewrites,
            vec![ExternalIdRewrite {
                record_id: reissued,
                previous_external_id: "11".to_string(),
                external_id: "99".to_string(),
            }]
        );
        assert_eq!(
            diff.appeared.iter().map(|record| record.record_id).collect::<Vec<_>>(),
            vec![kept, reissued]
        );
        assert_eq!(diff.unresolved_count(), 0);
    }

    #[test]
    fn json_pipeline_parses_items_and_container_reports() {
        let text = r#"{
            "items": [{"external_id": "1", "catalog_key": "K", "wear": 0.25, "pattern": 7}],
            "containers": [{"external_id": "900", "name": "Unit A", "reported_count": 3,
                            "modified_at": "2026-01-01T00:00:00Z"}]
        }"#;

        let snapshot = match JsonImportPipeline.parse(text) {
            Ok(snapshot) => snapshot,
            Err(err) => panic!("snapshot should parse: {err}"),
        };

        assert_eq!(snapshot.items[0].fingerprint.pattern, Some(7));
        assert_eq!(snapshot.items[0].fingerprint.name_tag, None);
        assert_eq!(snapshot.container_report("900").map(|report| report.reported_count), Some(3));
        assert_eq!(snapshot.container_report("901"), None);
    }

    #[test]
    fn json_pipeline_rejects_malformed_input() {
        for text in ["", "not json", r#"{"items": [{"external_id": "", "catalog_key": "K"}]}"#] {
            let result = JsonImportPipeline.parse(text);
            assert!(
                matches!(result, Err(ReconcileError::MalformedSnapshot(_))),
                "expected malformed snapshot for {text:?}, got {result:?}"
            );
        }
    }

    #[test]
    fn saturating_count_clamps_at_u32_max() {
        assert_eq!(saturating_count(7), 7);
        assert_eq!(saturating_count(usize::MAX), u32::MAX);
    }

    #[test]
    fn operation_state_machine_has_single_terminal_transition() {
        let previewed = match OperationState::None.transition(OperationEvent::Preview) {
            Ok(state) => state,
            Err(err) => panic!("preview should be accepted: {err}"),
        };
        assert_eq!(previewed.transition(OperationEvent::Confirm), Ok(OperationState::Executed));
        assert_eq!(previewed.transition(OperationEvent::Expire), Ok(OperationState::Expired));
        assert!(OperationState::Executed.transition(OperationEvent::Confirm).is_err());
        assert!(OperationState::Expired.transition(OperationEvent::Confirm).is_err());
        assert!(OperationState::Executed.is_terminal());
    }

    proptest! {
        #[test]
        fn property_wear_tolerance_is_symmetric(base in 0.0_f64..1.0, delta in -2e-7_f64..2e-7) {
            let lhs = Fingerprint { wear: Some(base), pattern: None, name_tag: None };
            let rhs = Fingerprint { wear: Some(base + delta), pattern: None, name_tag: None };
            prop_assert_eq!(lhs.matches(&rhs), rhs.matches(&lhs));
            if delta.abs() < 5e-8 {
                prop_assert!(lhs.matches(&rhs));
            }
        }

        #[test]
        fn property_deposit_diff_preserves_pool_order(kept in proptest::collection::vec(any::<bool>(), 0..40)) {
            let pool = (0..kept.len())
                .map(|index| mk_record(&index.to_string(), "K", None))
                .collect::<Vec<_>>();
            let snapshot = Snapshot {
                items: pool
                    .iter()
                    .zip(&kept)
                    .filter(|(_, keep)| **keep)
                    .map(|(record, _)| mk_descriptor(&record.external_id, "K", None))
                    .collect(),
                containers: vec![],
            };

            let diff = diff_for_deposit(&pool, &snapshot);
            let expected = pool
                .iter()
                .zip(&kept)
                .filter(|(_, keep)| !**keep)
                .map(|(record, _)| record.record_id)
                .collect::<Vec<_>>();
            prop_assert_eq!(
                diff.disappeared.iter().map(|record| record.record_id).collect::<Vec<_>>(),
                expected
            );
        }
    }
}
