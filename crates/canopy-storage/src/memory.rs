use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use canopy_core::materialize::{CachePlan, audiences_for_subtree, plan_subtree};
use canopy_core::model::{
    Audience, CacheKey, CacheRow, Creative, CreativeId, NewCreative, NewShare, Share, ShareId,
    TenantId, User, UserId, audience_label,
};
use canopy_core::permission::Permission;
use canopy_core::tree::{TreeSnapshot, TreeView, ancestors, is_in_subtree, subtree};

use crate::traits::{
    CreativeStore, OrphanReason, PermissionCacheStore, ShareStore, StorageError, StoreFactory,
    UserStore,
};

/// Previous value of one entry, recorded before a write changes it.
#[derive(Debug)]
enum Undo {
    User(UserId, Option<User>),
    Creative(CreativeId, Option<Creative>),
    Share(ShareId, Option<Share>),
    Row(CacheKey, Option<CacheRow>),
}

#[derive(Debug, Default)]
struct InnerState {
    users: HashMap<UserId, User>,
    creatives: HashMap<CreativeId, Creative>,
    children: HashMap<CreativeId, BTreeSet<CreativeId>>,
    shares: HashMap<ShareId, Share>,
    share_index: HashMap<CreativeId, HashMap<Audience, ShareId>>,
    rows: HashMap<CacheKey, CacheRow>,
    journal: Vec<Undo>,
}

impl TreeView for InnerState {
    fn creative(&self, id: &CreativeId) -> Option<&Creative> {
        self.creatives.get(id)
    }

    fn children(&self, id: &CreativeId) -> Vec<CreativeId> {
        self.children
            .get(id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn share(&self, creative_id: &CreativeId, user_id: Option<&UserId>) -> Option<&Share> {
        self.share_index
            .get(creative_id)
            .and_then(|by_audience| by_audience.get(&user_id.copied()))
            .and_then(|id| self.shares.get(id))
    }

    fn shares_on(&self, creative_id: &CreativeId) -> Vec<&Share> {
        self.share_index
            .get(creative_id)
            .into_iter()
            .flat_map(|by_audience| by_audience.values())
            .filter_map(|id| self.shares.get(id))
            .collect()
    }
}

impl InnerState {
    fn require_user(&self, id: &UserId) -> Result<(), StorageError> {
        if self.users.contains_key(id) {
            Ok(())
        } else {
            Err(StorageError::not_found("user", id))
        }
    }

    fn require_creative(&self, id: &CreativeId) -> Result<&Creative, StorageError> {
        self.creatives
            .get(id)
            .ok_or_else(|| StorageError::not_found("creative", id))
    }

    /// The non-alias creative `id` stands for.
    fn resolve_origin(&self, id: &CreativeId) -> Result<CreativeId, StorageError> {
        let creative = self.require_creative(id)?;
        let Some(origin_id) = creative.origin_id else {
            return Ok(creative.id);
        };
        let origin = self.require_creative(&origin_id)?;
        if origin.is_alias() {
            return Err(StorageError::Integrity(format!(
                "origin {origin_id} of alias {id} is itself an alias"
            )));
        }
        Ok(origin_id)
    }

    fn has_share(&self, creative_id: &CreativeId, audience: &Audience) -> bool {
        self.share_index
            .get(creative_id)
            .is_some_and(|by_audience| by_audience.contains_key(audience))
    }

    // Journaled writes. Everything a write closure changes goes through these.

    fn set_user(&mut self, id: UserId, value: Option<User>) {
        let previous = self.swap_user(id, value);
        self.journal.push(Undo::User(id, previous));
    }

    fn set_creative(&mut self, id: CreativeId, value: Option<Creative>) {
        let previous = self.swap_creative(id, value);
        self.journal.push(Undo::Creative(id, previous));
    }

    fn set_share(&mut self, id: ShareId, value: Option<Share>) -> Option<Share> {
        let previous = self.swap_share(id, value);
        self.journal.push(Undo::Share(id, previous.clone()));
        previous
    }

    fn set_row(&mut self, key: CacheKey, value: Option<CacheRow>) {
        if value.is_none() && !self.rows.contains_key(&key) {
            return;
        }
        let previous = self.swap_row(key, value);
        self.journal.push(Undo::Row(key, previous));
    }

    // Raw writes that keep the indexes in step.

    fn swap_user(&mut self, id: UserId, value: Option<User>) -> Option<User> {
        match value {
            Some(user) => self.users.insert(id, user),
            None => self.users.remove(&id),
        }
    }

    fn swap_creative(&mut self, id: CreativeId, value: Option<Creative>) -> Option<Creative> {
        let previous = match value {
            Some(creative) => self.creatives.insert(id, creative),
            None => self.creatives.remove(&id),
        };
        if let Some(parent) = previous.as_ref().and_then(|c| c.parent_id)
            && let Some(siblings) = self.children.get_mut(&parent)
        {
            siblings.remove(&id);
            if siblings.is_empty() {
                self.children.remove(&parent);
            }
        }
        if let Some(parent) = self.creatives.get(&id).and_then(|c| c.parent_id) {
            self.children.entry(parent).or_default().insert(id);
        }
        previous
    }

    fn swap_share(&mut self, id: ShareId, value: Option<Share>) -> Option<Share> {
        let previous = match value {
            Some(share) => self.shares.insert(id, share),
            None => self.shares.remove(&id),
        };
        if let Some(ref old) = previous
            && let Some(by_audience) = self.share_index.get_mut(&old.creative_id)
        {
            by_audience.remove(&old.user_id);
            if by_audience.is_empty() {
                self.share_index.remove(&old.creative_id);
            }
        }
        if let Some(share) = self.shares.get(&id) {
            self.share_index
                .entry(share.creative_id)
                .or_default()
                .insert(share.user_id, id);
        }
        previous
    }

    fn swap_row(&mut self, key: CacheKey, value: Option<CacheRow>) -> Option<CacheRow> {
        match value {
            Some(row) => self.rows.insert(key, row),
            None => self.rows.remove(&key),
        }
    }

    /// Restores every journaled entry, newest first.
    fn roll_back(&mut self) {
        while let Some(entry) = self.journal.pop() {
            match entry {
                Undo::User(id, value) => {
                    self.swap_user(id, value);
                }
                Undo::Creative(id, value) => {
                    self.swap_creative(id, value);
                }
                Undo::Share(id, value) => {
                    self.swap_share(id, value);
                }
                Undo::Row(key, value) => {
                    self.swap_row(key, value);
                }
            }
        }
    }

    /// Rewrites every cache row under `node`.
    ///
    /// Audiences are everyone with a share that can reach the subtree plus
    /// everyone who already has a row in it, so stale rows get cleared.
    fn recompute(&mut self, node: &CreativeId) -> Result<usize, StorageError> {
        let mut audiences = audiences_for_subtree(&*self, node)?;
        let ids: HashSet<CreativeId> = subtree(&*self, node)?.into_iter().collect();
        for key in self.rows.keys() {
            if ids.contains(&key.creative_id) && !audiences.contains(&key.user_id) {
                audiences.push(key.user_id);
            }
        }

        let plan = plan_subtree(&*self, node, &audiences)?;
        Ok(self.apply(plan))
    }

    fn apply(&mut self, plan: CachePlan) -> usize {
        let written = plan.len();
        for key in plan.clears {
            self.set_row(key, None);
        }
        for row in plan.upserts {
            self.set_row(row.key(), Some(row));
        }
        written
    }

    fn orphan_reason(&self, row: &CacheRow) -> Option<OrphanReason> {
        if !self.creatives.contains_key(&row.creative_id) {
            return Some(OrphanReason::MissingCreative);
        }
        if let Some(ref user) = row.user_id
            && !self.users.contains_key(user)
        {
            return Some(OrphanReason::MissingUser);
        }
        if let Some(ref share) = row.source_share_id
            && !self.shares.contains_key(share)
        {
            return Some(OrphanReason::MissingShare);
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InnerState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` under the lock. If it fails, every change it made through
    /// the journaled setters is undone before the lock is released.
    fn write<T>(
        &self,
        f: impl FnOnce(&mut InnerState) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.journal.clear();
        let out = f(&mut *state);
        match out {
            Ok(_) => state.journal.clear(),
            Err(_) => state.roll_back(),
        }
        out
    }
}

impl UserStore for InMemoryStore {
    async fn create_user(&self, name: &str) -> Result<User, StorageError> {
        let user = User {
            id: UserId::generate(),
            name: name.to_string(),
        };
        let mut state = self.state.lock().unwrap();
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<User>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state.users.get(id).cloned())
    }

    async fn delete_user(&self, id: &UserId) -> Result<(), StorageError> {
        self.write(|state| {
            state.require_user(id)?;

            let granted: Vec<ShareId> = state
                .shares
                .values()
                .filter(|s| s.user_id.as_ref() == Some(id))
                .map(|s| s.id)
                .collect();
            for share_id in &granted {
                state.set_share(*share_id, None);
            }
            let rows: Vec<CacheKey> = state
                .rows
                .keys()
                .filter(|key| key.user_id.as_ref() == Some(id))
                .copied()
                .collect();
            for key in rows {
                state.set_row(key, None);
            }
            state.set_user(*id, None);

            tracing::debug!(user_id = %id, shares = granted.len(), "deleted user");
            Ok(())
        })
    }
}

impl CreativeStore for InMemoryStore {
    async fn create_creative(&self, new: &NewCreative) -> Result<Creative, StorageError> {
        self.write(|state| {
            state.require_user(&new.owner_id)?;
            let parent_id = match new.parent_id {
                Some(ref parent) => Some(state.resolve_origin(parent)?),
                None => None,
            };
            let origin_id = match new.origin_id {
                Some(ref origin) => Some(state.resolve_origin(origin)?),
                None => None,
            };

            let creative = Creative {
                id: CreativeId::generate(),
                parent_id,
                origin_id,
                owner_id: new.owner_id,
            };
            state.set_creative(creative.id, Some(creative.clone()));
            state.recompute(&creative.id)?;
            Ok(creative)
        })
    }

    async fn get_creative(&self, id: &CreativeId) -> Result<Option<Creative>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state.creatives.get(id).cloned())
    }

    async fn get_creatives(&self, ids: &[CreativeId]) -> Result<Vec<Creative>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| state.creatives.get(id).cloned())
            .collect())
    }

    async fn children(&self, id: &CreativeId) -> Result<Vec<Creative>, StorageError> {
        let state = self.state.lock().unwrap();
        state.require_creative(id)?;
        Ok(state
            .children(id)
            .iter()
            .filter_map(|child| state.creatives.get(child).cloned())
            .collect())
    }

    async fn move_creative(
        &self,
        id: &CreativeId,
        new_parent: Option<&CreativeId>,
    ) -> Result<Creative, StorageError> {
        self.write(|state| {
            state.require_creative(id)?;
            let parent_id = match new_parent {
                Some(parent) => Some(state.resolve_origin(parent)?),
                None => None,
            };
            if let Some(ref parent) = parent_id
                && is_in_subtree(&*state, id, parent)?
            {
                return Err(StorageError::InvalidMove(format!(
                    "creative {id} cannot move under itself or its descendant {parent}"
                )));
            }

            let mut moved = state.require_creative(id)?.clone();
            moved.parent_id = parent_id;
            state.set_creative(*id, Some(moved.clone()));

            let rewritten = state.recompute(id)?;
            tracing::debug!(creative_id = %id, rows = rewritten, "moved creative");
            Ok(moved)
        })
    }

    async fn delete_creative(&self, id: &CreativeId) -> Result<Vec<CreativeId>, StorageError> {
        self.write(|state| {
            state.require_creative(id)?;

            let mut doomed: HashSet<CreativeId> = subtree(&*state, id)?.into_iter().collect();
            loop {
                let aliases: Vec<CreativeId> = state
                    .creatives
                    .values()
                    .filter(|c| !doomed.contains(&c.id))
                    .filter(|c| c.origin_id.is_some_and(|o| doomed.contains(&o)))
                    .map(|c| c.id)
                    .collect();
                if aliases.is_empty() {
                    break;
                }
                for alias in aliases {
                    doomed.extend(subtree(&*state, &alias)?);
                }
            }

            let shares: Vec<ShareId> = state
                .shares
                .values()
                .filter(|s| doomed.contains(&s.creative_id))
                .map(|s| s.id)
                .collect();
            for share_id in &shares {
                state.set_share(*share_id, None);
            }
            let rows: Vec<CacheKey> = state
                .rows
                .keys()
                .filter(|key| doomed.contains(&key.creative_id))
                .copied()
                .collect();
            for key in rows {
                state.set_row(key, None);
            }
            for cid in &doomed {
                state.set_creative(*cid, None);
            }

            let mut deleted: Vec<CreativeId> = doomed.into_iter().collect();
            deleted.sort();
            Ok(deleted)
        })
    }

    async fn ancestry(
        &self,
        ids: &[CreativeId],
        actor: Option<&UserId>,
    ) -> Result<TreeSnapshot, StorageError> {
        let state = self.state.lock().unwrap();

        let mut snapshot = TreeSnapshot::new();
        for id in ids {
            let mut chain = vec![state.require_creative(id)?.clone()];
            chain.extend(ancestors(&*state, id)?.into_iter().cloned());
            for creative in chain {
                if snapshot.creative(&creative.id).is_some() {
                    break;
                }
                for audience in [actor, None] {
                    if let Some(share) = state.share(&creative.id, audience) {
                        snapshot.insert_share(share.clone());
                    }
                }
                snapshot.insert_creative(creative);
            }
        }
        Ok(snapshot)
    }
}

impl ShareStore for InMemoryStore {
    async fn create_share(&self, new: &NewShare) -> Result<Share, StorageError> {
        self.write(|state| {
            let creative_id = state.resolve_origin(&new.creative_id)?;
            state.require_user(&new.shared_by_id)?;
            if let Some(ref user) = new.user_id {
                state.require_user(user)?;
            }
            if state.has_share(&creative_id, &new.user_id) {
                return Err(StorageError::DuplicateShare {
                    creative_id,
                    audience: audience_label(new.user_id.as_ref()),
                });
            }

            let share = Share {
                id: ShareId::generate(),
                creative_id,
                user_id: new.user_id,
                permission: new.permission,
                shared_by_id: new.shared_by_id,
            };
            state.set_share(share.id, Some(share.clone()));

            let rewritten = state.recompute(&creative_id)?;
            tracing::debug!(share = %share, rows = rewritten, "created share");
            Ok(share)
        })
    }

    async fn update_share(
        &self,
        id: &ShareId,
        permission: Permission,
    ) -> Result<Share, StorageError> {
        self.write(|state| {
            let mut updated = state
                .shares
                .get(id)
                .cloned()
                .ok_or_else(|| StorageError::not_found("share", id))?;
            updated.permission = permission;
            state.set_share(*id, Some(updated.clone()));

            state.recompute(&updated.creative_id)?;
            Ok(updated)
        })
    }

    async fn destroy_share(&self, id: &ShareId) -> Result<Share, StorageError> {
        self.write(|state| {
            let share = state
                .set_share(*id, None)
                .ok_or_else(|| StorageError::not_found("share", id))?;

            let rewritten = state.recompute(&share.creative_id)?;
            tracing::debug!(share = %share, rows = rewritten, "destroyed share");
            Ok(share)
        })
    }

    async fn find_share(
        &self,
        creative_id: &CreativeId,
        user_id: Option<&UserId>,
    ) -> Result<Option<Share>, StorageError> {
        let state = self.state.lock().unwrap();
        let root = state.resolve_origin(creative_id)?;
        Ok(state.share(&root, user_id).cloned())
    }

    async fn get_share(&self, id: &ShareId) -> Result<Option<Share>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state.shares.get(id).cloned())
    }

    async fn list_shares(&self, creative_id: &CreativeId) -> Result<Vec<Share>, StorageError> {
        let state = self.state.lock().unwrap();
        let root = state.resolve_origin(creative_id)?;
        let mut shares: Vec<Share> = state.shares_on(&root).into_iter().cloned().collect();
        shares.sort_by_key(|s| s.user_id);
        Ok(shares)
    }
}

impl PermissionCacheStore for InMemoryStore {
    async fn cache_rows(
        &self,
        creative_ids: &[CreativeId],
        user_id: Option<&UserId>,
    ) -> Result<Vec<CacheRow>, StorageError> {
        let state = self.state.lock().unwrap();
        let mut rows = Vec::new();
        for creative_id in creative_ids {
            if let Some(user) = user_id
                && let Some(row) = state.rows.get(&CacheKey::new(*creative_id, Some(*user)))
            {
                rows.push(row.clone());
            }
            if let Some(row) = state.rows.get(&CacheKey::new(*creative_id, None)) {
                rows.push(row.clone());
            }
        }
        Ok(rows)
    }

    async fn list_cache_rows(&self) -> Result<Vec<CacheRow>, StorageError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<CacheRow> = state.rows.values().cloned().collect();
        rows.sort_by_key(|r| (r.creative_id, r.user_id));
        Ok(rows)
    }

    async fn orphan_candidates(&self) -> Result<Vec<CacheKey>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rows
            .values()
            .filter(|row| state.orphan_reason(row).is_some())
            .map(CacheRow::key)
            .collect())
    }

    async fn delete_cache_row_if_orphaned(
        &self,
        key: &CacheKey,
    ) -> Result<Option<OrphanReason>, StorageError> {
        let mut state = self.state.lock().unwrap();
        let Some(reason) = state.rows.get(key).and_then(|row| state.orphan_reason(row)) else {
            return Ok(None);
        };
        state.rows.remove(key);
        Ok(Some(reason))
    }
}

/// Out-of-band deletes that bypass cache maintenance, the way a crash or a
/// manual database edit would. They exist to produce orphaned cache rows.
#[cfg(any(test, feature = "test-utils"))]
impl InMemoryStore {
    pub fn purge_user_unchecked(&self, id: &UserId) {
        let mut state = self.state.lock().unwrap();
        state.swap_user(*id, None);
    }

    pub fn purge_creative_unchecked(&self, id: &CreativeId) {
        let mut state = self.state.lock().unwrap();
        state.swap_creative(*id, None);
    }

    pub fn purge_share_unchecked(&self, id: &ShareId) {
        let mut state = self.state.lock().unwrap();
        state.swap_share(*id, None);
    }

    pub fn insert_cache_row_unchecked(&self, row: CacheRow) {
        let mut state = self.state.lock().unwrap();
        state.rows.insert(row.key(), row);
    }
}

#[derive(Debug)]
pub struct InMemoryStoreFactory {
    stores: Mutex<HashMap<TenantId, InMemoryStore>>,
}

impl InMemoryStoreFactory {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStoreFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreFactory for InMemoryStoreFactory {
    type Store = InMemoryStore;

    fn for_tenant(&self, tenant_id: &TenantId) -> InMemoryStore {
        let mut stores = self.stores.lock().unwrap();
        stores.entry(*tenant_id).or_default().clone()
    }
}
