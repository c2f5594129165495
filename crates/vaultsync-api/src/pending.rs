use std::collections::HashMap;

use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};
use tracing::debug;
use vaultsync_core::{
    OperationEvent, OperationState, OperationToken, OwnerId, PendingOperation, ReconcileError,
};

#[derive(Debug)]
struct PendingEntry {
    operation: PendingOperation,
    state: OperationState,
}

/// Keyed store of previewed transfers awaiting confirmation.
///
/// Entries live until they are taken or until `ttl` has elapsed since the preview.
#[derive(Debug)]
pub struct PendingOperationStore {
    ttl: Duration,
    entries: Mutex<HashMap<OperationToken, PendingEntry>>,
}

impl PendingOperationStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Register a previewed operation under its token.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Validation`] when the token is already registered.
    pub fn insert(&self, operation: PendingOperation) -> Result<OperationToken, ReconcileError> {
        let state = OperationState::None.transition(OperationEvent::Preview)?;
        let token = operation.token;
        let mut entries = self.entries.lock();
        self.purge_locked(&mut entries, OffsetDateTime::now_utc());
        if entries.contains_key(&token) {
            return Err(ReconcileError::Validation(format!("token {token} already pending")));
        }
        entries.insert(token, PendingEntry { operation, state });
        Ok(token)
    }

    /// Remove and return the operation registered under `token` for `owner`.
    ///
    /// A request from another owner leaves the entry in place.
    ///
    /// # Errors
    /// Returns [`ReconcileError::OperationNotFound`] when the token is unknown, expired,
    /// already consumed, or owned by someone else.
    pub fn take(
        &self,
        owner: &OwnerId,
        token: OperationToken,
    ) -> Result<PendingOperation, ReconcileError> {
        let mut entries = self.entries.lock();
        self.purge_locked(&mut entries, OffsetDateTime::now_utc());

        let owned = entries.get(&token).is_some_and(|entry| entry.operation.owner == *owner);
        if !owned {
            return Err(ReconcileError::OperationNotFound(format!("unknown token {token}")));
        }
        let Some(entry) = entries.remove(&token) else {
            return Err(ReconcileError::OperationNotFound(format!("unknown token {token}")));
        };
        entry.state.transition(OperationEvent::Confirm)?;
        debug!(token = %token, "pending operation consumed");
        Ok(entry.operation)
    }

    /// Drop every entry older than the configured TTL. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        self.purge_locked(&mut entries, OffsetDateTime::now_utc())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_locked(
        &self,
        entries: &mut HashMap<OperationToken, PendingEntry>,
        now: OffsetDateTime,
    ) -> usize {
        let before = entries.len();
        entries.retain(|token, entry| {
            if now - entry.operation.created_at < self.ttl {
                return true;
            }
            if let Ok(state) = entry.state.transition(OperationEvent::Expire) {
                debug!(token = %token, state = %state, "pending operation expired");
            }
            false
        });
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use vaultsync_core::{ContainerId, TransferKind};

    use super::*;

    fn owner(value: &str) -> OwnerId {
        match OwnerId::parse(value) {
            Ok(owner) => owner,
            Err(err) => panic!("fixture owner should parse: {err}"),
        }
    }

    fn mk_operation(owner: &OwnerId) -> PendingOperation {
        PendingOperation {
            token: OperationToken::new(),
            owner: owner.clone(),
            kind: TransferKind::Deposit,
            container_id: ContainerId::new(),
            record_ids: Vec::new(),
            rewrites: Vec::new(),
            container_report: None,
            snapshot_digest: "snap_fixture".to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn take_is_single_use() -> Result<(), ReconcileError> {
        let store = PendingOperationStore::new(Duration::minutes(30));
        let alice = owner("alice");
        let token = store.insert(mk_operation(&alice))?;

        let taken = store.take(&alice, token)?;
        assert_eq!(taken.token, token);
        assert!(matches!(store.take(&alice, token), Err(ReconcileError::OperationNotFound(_))));
        Ok(())
    }

    #[test]
    fn other_owner_cannot_take_or_burn_the_token() -> Result<(), ReconcileError> {
        let store = PendingOperationStore::new(Duration::minutes(30));
        let alice = owner("alice");
        let token = store.insert(mk_operation(&alice))?;

        assert!(matches!(
            store.take(&owner("mallory"), token),
            Err(ReconcileError::OperationNotFound(_))
        ));
        assert_eq!(store.len(), 1);
        assert!(store.take(&alice, token).is_ok());
        Ok(())
    }

    #[test]
    fn expired_entries_are_purged() -> Result<(), ReconcileError> {
        let store = PendingOperationStore::new(Duration::minutes(5));
        let alice = owner("alice");
        let mut stale = mk_operation(&alice);
        stale.created_at = OffsetDateTime::now_utc() - Duration::minutes(10);
        let stale_token = store.insert(stale)?;
        let fresh_token = store.insert(mk_operation(&alice))?;

        assert!(matches!(
            store.take(&alice, stale_token),
            Err(ReconcileError::OperationNotFound(_))
        ));
        assert_eq!(store.purge_expired(), 0);
        assert!(store.take(&alice, fresh_token).is_ok());
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn duplicate_token_is_rejected() -> Result<(), ReconcileError> {
        let store = PendingOperationStore::new(Duration::minutes(30));
        let operation = mk_operation(&owner("alice"));
        store.insert(operation.clone())?;

        assert!(matches!(store.insert(operation), Err(ReconcileError::Validation(_))));
        Ok(())
    }
}
