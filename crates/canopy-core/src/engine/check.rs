use std::fmt;
use std::sync::Arc;

use crate::model::{CacheKey, Creative, CreativeId, UserId};
use crate::permission::Permission;
use crate::resolve::{ResolvedAccess, resolve_access};
use crate::tree::TreeError;

use super::{CheckError, EngineConfig, PermissionReader, RequestMemo};

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub creative_id: CreativeId,
    /// `None` checks on behalf of an anonymous visitor.
    pub actor: Option<UserId>,
    pub required: Permission,
}

impl CheckRequest {
    pub fn new(creative_id: CreativeId, actor: Option<UserId>, required: Permission) -> Self {
        Self {
            creative_id,
            actor,
            required,
        }
    }
}

/// Which step of the check produced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Owner,
    UserRow,
    PublicRow,
    AncestorWalk,
    NoGrant,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Owner => "owner",
            DecisionSource::UserRow => "user_row",
            DecisionSource::PublicRow => "public_row",
            DecisionSource::AncestorWalk => "ancestor_walk",
            DecisionSource::NoGrant => "no_grant",
        }
    }
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
    pub source: DecisionSource,
    /// The creative whose shares were evaluated (the origin for an alias).
    pub root_id: CreativeId,
    pub from_memo: bool,
}

pub struct PermissionChecker<R: PermissionReader> {
    reader: Arc<R>,
    config: EngineConfig,
}

impl<R: PermissionReader> PermissionChecker<R> {
    pub fn new(reader: Arc<R>, config: EngineConfig) -> Self {
        Self { reader, config }
    }

    pub async fn check(&self, request: &CheckRequest) -> Result<CheckResult, CheckError> {
        let mut memo = RequestMemo::new();
        self.check_with_memo(&mut memo, request).await
    }

    /// Owner bypass, then the user row (where `no_access` is final), then the
    /// public row, then the ancestor walk when neither row exists.
    pub async fn check_with_memo(
        &self,
        memo: &mut RequestMemo,
        request: &CheckRequest,
    ) -> Result<CheckResult, CheckError> {
        let actor = request.actor.as_ref();
        if let Some(actor) = actor {
            self.ensure_user(memo, actor).await?;
        }

        let root = self.effective_origin(memo, &request.creative_id).await?;
        let decided = |allowed, source, from_memo| CheckResult {
            allowed,
            source,
            root_id: root.id,
            from_memo,
        };

        if let Some(actor) = actor
            && root.owner_id == *actor
        {
            return Ok(decided(true, DecisionSource::Owner, false));
        }

        let (user_row, public_row, from_memo) = self.cached_rows(memo, &root.id, actor).await?;

        if let Some(own) = user_row {
            return Ok(decided(
                own.allows(request.required),
                DecisionSource::UserRow,
                from_memo,
            ));
        }
        if let Some(public) = public_row {
            return Ok(decided(
                public.allows(request.required),
                DecisionSource::PublicRow,
                from_memo,
            ));
        }

        if !self.config.ancestor_fallback {
            return Ok(decided(false, DecisionSource::NoGrant, from_memo));
        }

        let walk_key = CacheKey::new(root.id, actor.copied());
        let (access, from_memo) = match memo.walk(&walk_key) {
            Some(access) => (access, true),
            None => {
                tracing::debug!(
                    creative_id = %root.id,
                    actor = ?request.actor,
                    "no cache rows, walking ancestors"
                );
                let access = self.resolve_via_ancestry(&root.id, actor).await?;
                memo.remember_walk(walk_key, access);
                (access, false)
            }
        };

        let source = if access.is_empty() {
            DecisionSource::NoGrant
        } else {
            DecisionSource::AncestorWalk
        };

        Ok(decided(access.allows(request.required), source, from_memo))
    }

    /// Answers from shares alone, ignoring the cache table. The owner bypass
    /// still applies.
    pub async fn check_via_ancestry(
        &self,
        request: &CheckRequest,
    ) -> Result<CheckResult, CheckError> {
        let mut memo = RequestMemo::new();
        let actor = request.actor.as_ref();
        if let Some(actor) = actor {
            self.ensure_user(&mut memo, actor).await?;
        }
        let root = self.effective_origin(&mut memo, &request.creative_id).await?;

        if let Some(actor) = actor
            && root.owner_id == *actor
        {
            return Ok(CheckResult {
                allowed: true,
                source: DecisionSource::Owner,
                root_id: root.id,
                from_memo: false,
            });
        }

        let access = self.resolve_via_ancestry(&root.id, actor).await?;
        Ok(CheckResult {
            allowed: access.allows(request.required),
            source: DecisionSource::AncestorWalk,
            root_id: root.id,
            from_memo: false,
        })
    }

    /// Resolves an alias to its origin; any other creative to itself.
    pub async fn effective_origin(
        &self,
        memo: &mut RequestMemo,
        id: &CreativeId,
    ) -> Result<Creative, CheckError> {
        let creative = self
            .load_creative(memo, id)
            .await?
            .ok_or(CheckError::CreativeNotFound(*id))?;

        let Some(origin_id) = creative.origin_id else {
            return Ok(creative);
        };

        let origin = self
            .load_creative(memo, &origin_id)
            .await?
            .ok_or(CheckError::CreativeNotFound(origin_id))?;

        if origin.is_alias() {
            return Err(TreeError::ChainedOrigin {
                alias: creative.id,
                origin: origin_id,
            }
            .into());
        }

        Ok(origin)
    }

    /// Loads creatives, their origins and their cache rows for `actor` in
    /// batches so that checks over `ids` afterwards are answered from `memo`.
    pub async fn prefetch(
        &self,
        memo: &mut RequestMemo,
        ids: &[CreativeId],
        actor: Option<&UserId>,
    ) -> Result<(), CheckError> {
        if let Some(actor) = actor {
            self.ensure_user(memo, actor).await?;
        }

        let missing = unique(ids.iter().filter(|id| memo.creative(id).is_none()).copied());
        if !missing.is_empty() {
            for creative in self.reader.creatives(&missing).await? {
                memo.remember_creative(creative);
            }
        }

        let origins = unique(
            ids.iter()
                .filter_map(|id| memo.creative(id))
                .filter_map(|c| c.origin_id)
                .filter(|origin| memo.creative(origin).is_none()),
        );
        if !origins.is_empty() {
            for creative in self.reader.creatives(&origins).await? {
                memo.remember_creative(creative);
            }
        }

        let roots = unique(
            ids.iter()
                .filter_map(|id| memo.creative(id))
                .map(|c| c.authorization_root_id()),
        );
        let unread: Vec<CreativeId> = roots
            .iter()
            .filter(|root| !rows_known(&*memo, root, actor))
            .copied()
            .collect();

        if !unread.is_empty() {
            for root in &unread {
                if let Some(actor) = actor {
                    memo.remember_row(CacheKey::new(*root, Some(*actor)), None);
                }
                memo.remember_row(CacheKey::new(*root, None), None);
            }
            for row in self.reader.cache_rows(&unread, actor).await? {
                memo.remember_row(row.key(), Some(row.permission));
            }
        }

        let unshared: Vec<CreativeId> = if self.config.ancestor_fallback {
            roots
                .iter()
                .filter(|root| needs_walk(&*memo, root, actor))
                .copied()
                .collect()
        } else {
            Vec::new()
        };

        tracing::debug!(
            creatives = ids.len(),
            rows_read = unread.len(),
            walks = unshared.len(),
            "prefetched permission rows"
        );

        if unshared.is_empty() {
            return Ok(());
        }

        let snapshot = self.reader.ancestry(&unshared, actor).await?;
        for root in unshared {
            let access = resolve_access(&snapshot, &root, actor)?;
            memo.remember_walk(CacheKey::new(root, actor.copied()), access);
        }

        Ok(())
    }

    /// The subset of `ids` the actor holds `required` on, in input order.
    /// Creatives that no longer exist are skipped.
    pub async fn filter_permitted(
        &self,
        memo: &mut RequestMemo,
        ids: &[CreativeId],
        actor: Option<&UserId>,
        required: Permission,
    ) -> Result<Vec<CreativeId>, CheckError> {
        self.prefetch(memo, ids, actor).await?;

        let mut permitted = Vec::new();
        for id in ids {
            let request = CheckRequest::new(*id, actor.copied(), required);
            match self.check_with_memo(memo, &request).await {
                Ok(result) if result.allowed => permitted.push(*id),
                Ok(_) => {}
                Err(CheckError::CreativeNotFound(missing)) => {
                    tracing::debug!(creative_id = %missing, "skipping missing creative");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(permitted)
    }

    async fn ensure_user(&self, memo: &mut RequestMemo, actor: &UserId) -> Result<(), CheckError> {
        if !self.config.verify_actor || memo.knows_user(actor) {
            return Ok(());
        }
        if !self.reader.user_exists(actor).await? {
            return Err(CheckError::UserNotFound(*actor));
        }
        memo.remember_user(*actor);
        Ok(())
    }

    async fn load_creative(
        &self,
        memo: &mut RequestMemo,
        id: &CreativeId,
    ) -> Result<Option<Creative>, CheckError> {
        if let Some(creative) = memo.creative(id) {
            return Ok(Some(creative.clone()));
        }
        let found = self
            .reader
            .creatives(std::slice::from_ref(id))
            .await?
            .into_iter()
            .find(|c| c.id == *id);
        if let Some(ref creative) = found {
            memo.remember_creative(creative.clone());
        }
        Ok(found)
    }

    async fn cached_rows(
        &self,
        memo: &mut RequestMemo,
        root: &CreativeId,
        actor: Option<&UserId>,
    ) -> Result<(Option<Permission>, Option<Permission>, bool), CheckError> {
        let user_key = actor.map(|a| CacheKey::new(*root, Some(*a)));
        let public_key = CacheKey::new(*root, None);

        let remembered_user = match user_key {
            Some(ref key) => memo.row(key),
            None => Some(None),
        };
        if let (Some(user), Some(public)) = (remembered_user, memo.row(&public_key)) {
            return Ok((user, public, true));
        }

        let rows = self
            .reader
            .cache_rows(std::slice::from_ref(root), actor)
            .await?;

        let mut user = None;
        let mut public = None;
        for row in rows.into_iter().filter(|r| r.creative_id == *root) {
            match row.user_id {
                None => public = Some(row.permission),
                Some(ref id) if Some(id) == actor => user = Some(row.permission),
                Some(_) => {}
            }
        }

        if let Some(key) = user_key {
            memo.remember_row(key, user);
        }
        memo.remember_row(public_key, public);

        Ok((user, public, false))
    }

    async fn resolve_via_ancestry(
        &self,
        root: &CreativeId,
        actor: Option<&UserId>,
    ) -> Result<ResolvedAccess, CheckError> {
        let snapshot = self
            .reader
            .ancestry(std::slice::from_ref(root), actor)
            .await?;
        Ok(resolve_access(&snapshot, root, actor)?)
    }
}

fn rows_known(memo: &RequestMemo, root: &CreativeId, actor: Option<&UserId>) -> bool {
    let user_known = match actor {
        Some(actor) => memo.row(&CacheKey::new(*root, Some(*actor))).is_some(),
        None => true,
    };
    user_known && memo.row(&CacheKey::new(*root, None)).is_some()
}

/// Both rows are known to be absent, the walk has not run yet, and the
/// owner bypass does not apply.
fn needs_walk(memo: &RequestMemo, root: &CreativeId, actor: Option<&UserId>) -> bool {
    let Some(creative) = memo.creative(root) else {
        return false;
    };
    if actor.is_some_and(|actor| creative.owner_id == *actor) {
        return false;
    }
    let user_absent = match actor {
        Some(actor) => memo.row(&CacheKey::new(*root, Some(*actor))) == Some(None),
        None => true,
    };
    user_absent
        && memo.row(&CacheKey::new(*root, None)) == Some(None)
        && memo.walk(&CacheKey::new(*root, actor.copied())).is_none()
}

fn unique(ids: impl Iterator<Item = CreativeId>) -> Vec<CreativeId> {
    let mut out: Vec<CreativeId> = ids.collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::materialize::plan_subtree;
    use crate::model::{CacheRow, Share, ShareId};
    use crate::tree::{TreeSnapshot, TreeView, ancestors};

    struct TestStore {
        tree: TreeSnapshot,
        users: Vec<UserId>,
        rows: Vec<CacheRow>,
        row_reads: AtomicUsize,
        ancestry_reads: AtomicUsize,
    }

    impl TestStore {
        fn new(tree: TreeSnapshot, users: Vec<UserId>, rows: Vec<CacheRow>) -> Self {
            Self {
                tree,
                users,
                rows,
                row_reads: AtomicUsize::new(0),
                ancestry_reads: AtomicUsize::new(0),
            }
        }
    }

    impl PermissionReader for TestStore {
        async fn creatives(&self, ids: &[CreativeId]) -> Result<Vec<Creative>, CheckError> {
            Ok(ids
                .iter()
                .filter_map(|id| self.tree.creative(id).cloned())
                .collect())
        }

        async fn user_exists(&self, id: &UserId) -> Result<bool, CheckError> {
            Ok(self.users.contains(id))
        }

        async fn cache_rows(
            &self,
            creative_ids: &[CreativeId],
            user_id: Option<&UserId>,
        ) -> Result<Vec<CacheRow>, CheckError> {
            self.row_reads.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .rows
                .iter()
                .filter(|r| creative_ids.contains(&r.creative_id))
                .filter(|r| r.user_id.is_none() || r.user_id.as_ref() == user_id)
                .cloned()
                .collect())
        }

        async fn ancestry(
            &self,
            ids: &[CreativeId],
            _actor: Option<&UserId>,
        ) -> Result<TreeSnapshot, CheckError> {
            self.ancestry_reads.fetch_add(1, Ordering::SeqCst);
            let mut snapshot = TreeSnapshot::new();
            for id in ids {
                let start = self
                    .tree
                    .creative(id)
                    .cloned()
                    .ok_or(CheckError::CreativeNotFound(*id))?;
                let mut chain = vec![start];
                chain.extend(ancestors(&self.tree, id)?.into_iter().cloned());
                for creative in chain {
                    for share in self.tree.shares_on(&creative.id) {
                        snapshot.insert_share(share.clone());
                    }
                    snapshot.insert_creative(creative);
                }
            }
            Ok(snapshot)
        }
    }

    struct Fixture {
        tree: TreeSnapshot,
        rows: Vec<CacheRow>,
        owner: UserId,
        alice: UserId,
        bob: UserId,
        root: CreativeId,
        child: CreativeId,
        grandchild: CreativeId,
    }

    impl Fixture {
        fn new() -> Self {
            let owner = UserId::generate();
            let root = CreativeId::generate();
            let child = CreativeId::generate();
            let grandchild = CreativeId::generate();
            let tree = TreeSnapshot::from_parts(
                [
                    Creative::new(root, owner),
                    Creative::new(child, owner).with_parent(root),
                    Creative::new(grandchild, owner).with_parent(child),
                ],
                [],
            );
            Self {
                tree,
                rows: Vec::new(),
                owner,
                alice: UserId::generate(),
                bob: UserId::generate(),
                root,
                child,
                grandchild,
            }
        }

        fn share(&mut self, on: CreativeId, user: Option<UserId>, permission: Permission) {
            self.tree.insert_share(Share {
                id: ShareId::generate(),
                creative_id: on,
                user_id: user,
                permission,
                shared_by_id: self.owner,
            });
        }

        fn row(&mut self, on: CreativeId, user: Option<UserId>, permission: Permission) {
            self.rows.push(CacheRow {
                creative_id: on,
                user_id: user,
                permission,
                source_share_id: None,
            });
        }

        fn checker(self) -> (PermissionChecker<TestStore>, Arc<TestStore>) {
            let users = vec![self.owner, self.alice, self.bob];
            let store = Arc::new(TestStore::new(self.tree, users, self.rows));
            (
                PermissionChecker::new(Arc::clone(&store), EngineConfig::default()),
                store,
            )
        }
    }

    #[tokio::test]
    async fn owner_always_allowed() {
        let mut f = Fixture::new();
        let (owner, child) = (f.owner, f.child);
        f.share(child, Some(owner), Permission::NoAccess);
        let (checker, store) = f.checker();

        let result = checker
            .check(&CheckRequest::new(child, Some(owner), Permission::Admin))
            .await
            .unwrap();

        assert!(result.allowed);
        assert_eq!(result.source, DecisionSource::Owner);
        assert_eq!(store.row_reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn user_row_decides() {
        let mut f = Fixture::new();
        let (alice, child) = (f.alice, f.child);
        f.row(child, Some(alice), Permission::Write);
        let (checker, _) = f.checker();

        let write = checker
            .check(&CheckRequest::new(child, Some(alice), Permission::Write))
            .await
            .unwrap();
        let admin = checker
            .check(&CheckRequest::new(child, Some(alice), Permission::Admin))
            .await
            .unwrap();

        assert!(write.allowed);
        assert_eq!(write.source, DecisionSource::UserRow);
        assert!(!admin.allowed);
    }

    #[tokio::test]
    async fn no_access_row_is_a_hard_stop() {
        let mut f = Fixture::new();
        let (alice, child) = (f.alice, f.child);
        f.row(child, Some(alice), Permission::NoAccess);
        f.row(child, None, Permission::Admin);
        let (checker, store) = f.checker();

        for required in Permission::ALL {
            let result = checker
                .check(&CheckRequest::new(child, Some(alice), required))
                .await
                .unwrap();
            assert!(!result.allowed, "{required} should be denied");
            assert_eq!(result.source, DecisionSource::UserRow);
        }
        assert_eq!(store.ancestry_reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn public_row_applies_to_strangers_and_anonymous() {
        let mut f = Fixture::new();
        let (bob, child) = (f.bob, f.child);
        f.row(child, None, Permission::Feedback);
        let (checker, _) = f.checker();

        let stranger = checker
            .check(&CheckRequest::new(child, Some(bob), Permission::Feedback))
            .await
            .unwrap();
        let anonymous = checker
            .check(&CheckRequest::new(child, None, Permission::Read))
            .await
            .unwrap();
        let too_high = checker
            .check(&CheckRequest::new(child, None, Permission::Write))
            .await
            .unwrap();

        assert!(stranger.allowed);
        assert_eq!(stranger.source, DecisionSource::PublicRow);
        assert!(anonymous.allowed);
        assert!(!too_high.allowed);
    }

    #[tokio::test]
    async fn falls_back_to_ancestors_without_rows() {
        let mut f = Fixture::new();
        let (alice, root, grandchild) = (f.alice, f.root, f.grandchild);
        f.share(root, Some(alice), Permission::Write);
        let (checker, store) = f.checker();

        let result = checker
            .check(&CheckRequest::new(grandchild, Some(alice), Permission::Write))
            .await
            .unwrap();

        assert!(result.allowed);
        assert_eq!(result.source, DecisionSource::AncestorWalk);
        assert_eq!(store.ancestry_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nearest_denial_wins_on_fallback() {
        let mut f = Fixture::new();
        let (alice, root, child, grandchild) = (f.alice, f.root, f.child, f.grandchild);
        f.share(root, Some(alice), Permission::Admin);
        f.share(child, Some(alice), Permission::NoAccess);
        f.share(root, None, Permission::Admin);
        let (checker, _) = f.checker();

        let result = checker
            .check(&CheckRequest::new(grandchild, Some(alice), Permission::Read))
            .await
            .unwrap();

        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn nearer_public_share_lifts_farther_denial() {
        let mut f = Fixture::new();
        let (alice, root, child, grandchild) = (f.alice, f.root, f.child, f.grandchild);
        f.share(root, Some(alice), Permission::NoAccess);
        f.share(child, None, Permission::Read);
        let plan = plan_subtree(&f.tree, &root, &[Some(alice), None]).unwrap();
        f.rows = plan.upserts;
        let (checker, _) = f.checker();
        let request = CheckRequest::new(grandchild, Some(alice), Permission::Read);

        let cached = checker.check(&request).await.unwrap();
        let walked = checker.check_via_ancestry(&request).await.unwrap();
        let at_root = checker
            .check(&CheckRequest::new(root, Some(alice), Permission::Read))
            .await
            .unwrap();

        assert!(cached.allowed);
        assert_eq!(cached.source, DecisionSource::PublicRow);
        assert!(walked.allowed);
        assert!(!at_root.allowed);
    }

    #[tokio::test]
    async fn walk_allows_through_nearer_public_share() {
        let mut f = Fixture::new();
        let (alice, root, child, grandchild) = (f.alice, f.root, f.child, f.grandchild);
        f.share(root, Some(alice), Permission::NoAccess);
        f.share(child, None, Permission::Read);
        let (checker, _) = f.checker();

        let result = checker
            .check(&CheckRequest::new(grandchild, Some(alice), Permission::Read))
            .await
            .unwrap();

        assert!(result.allowed);
        assert_eq!(result.source, DecisionSource::AncestorWalk);
    }

    #[tokio::test]
    async fn fallback_disabled_denies_without_rows() {
        let mut f = Fixture::new();
        let (alice, root, child) = (f.alice, f.root, f.child);
        f.share(root, Some(alice), Permission::Admin);
        let users = vec![f.owner, f.alice, f.bob];
        let store = Arc::new(TestStore::new(f.tree, users, f.rows));
        let checker = PermissionChecker::new(
            store,
            EngineConfig {
                ancestor_fallback: false,
                ..EngineConfig::default()
            },
        );

        let result = checker
            .check(&CheckRequest::new(child, Some(alice), Permission::Read))
            .await
            .unwrap();

        assert!(!result.allowed);
        assert_eq!(result.source, DecisionSource::NoGrant);
    }

    #[tokio::test]
    async fn alias_is_checked_against_origin() {
        let mut f = Fixture::new();
        let (alice, bob, owner, child) = (f.alice, f.bob, f.owner, f.child);
        let alias = Creative::new(CreativeId::generate(), bob)
            .with_parent(f.root)
            .with_origin(child);
        f.tree.insert_creative(alias.clone());
        f.row(child, Some(alice), Permission::Read);
        let (checker, _) = f.checker();

        let alice_result = checker
            .check(&CheckRequest::new(alias.id, Some(alice), Permission::Read))
            .await
            .unwrap();
        let bob_result = checker
            .check(&CheckRequest::new(alias.id, Some(bob), Permission::Read))
            .await
            .unwrap();
        let owner_result = checker
            .check(&CheckRequest::new(alias.id, Some(owner), Permission::Admin))
            .await
            .unwrap();

        assert!(alice_result.allowed);
        assert_eq!(alice_result.root_id, child);
        assert!(!bob_result.allowed);
        assert_eq!(owner_result.source, DecisionSource::Owner);
    }

    #[tokio::test]
    async fn chained_alias_is_an_integrity_error() {
        let mut f = Fixture::new();
        let alice = f.alice;
        let first = Creative::new(CreativeId::generate(), f.owner).with_origin(f.child);
        let second = Creative::new(CreativeId::generate(), f.owner).with_origin(first.id);
        f.tree.insert_creative(first);
        f.tree.insert_creative(second.clone());
        let (checker, _) = f.checker();

        let err = checker
            .check(&CheckRequest::new(second.id, Some(alice), Permission::Read))
            .await
            .unwrap_err();

        assert!(matches!(err, CheckError::Integrity(_)));
    }

    #[tokio::test]
    async fn unknown_creative_and_user_are_not_found() {
        let f = Fixture::new();
        let (alice, child) = (f.alice, f.child);
        let (checker, _) = f.checker();

        let missing_creative = checker
            .check(&CheckRequest::new(
                CreativeId::generate(),
                Some(alice),
                Permission::Read,
            ))
            .await
            .unwrap_err();
        let missing_user = checker
            .check(&CheckRequest::new(
                child,
                Some(UserId::generate()),
                Permission::Read,
            ))
            .await
            .unwrap_err();

        assert!(matches!(missing_creative, CheckError::CreativeNotFound(_)));
        assert!(matches!(missing_user, CheckError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn memo_answers_repeated_checks() {
        let mut f = Fixture::new();
        let (alice, child) = (f.alice, f.child);
        f.row(child, Some(alice), Permission::Read);
        let (checker, store) = f.checker();
        let mut memo = RequestMemo::new();

        let first = checker
            .check_with_memo(
                &mut memo,
                &CheckRequest::new(child, Some(alice), Permission::Read),
            )
            .await
            .unwrap();
        let second = checker
            .check_with_memo(
                &mut memo,
                &CheckRequest::new(child, Some(alice), Permission::Write),
            )
            .await
            .unwrap();

        assert!(!first.from_memo);
        assert!(second.from_memo);
        assert!(!second.allowed);
        assert_eq!(store.row_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prefetch_batches_row_reads() {
        let mut f = Fixture::new();
        let (alice, root, child, grandchild) = (f.alice, f.root, f.child, f.grandchild);
        f.row(root, Some(alice), Permission::Read);
        f.row(child, Some(alice), Permission::Read);
        f.row(grandchild, None, Permission::Read);
        let (checker, store) = f.checker();
        let mut memo = RequestMemo::new();

        let permitted = checker
            .filter_permitted(
                &mut memo,
                &[root, child, grandchild, CreativeId::generate()],
                Some(&alice),
                Permission::Read,
            )
            .await
            .unwrap();

        assert_eq!(permitted, vec![root, child, grandchild]);
        assert_eq!(store.row_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filter_without_any_shares_walks_once() {
        let f = Fixture::new();
        let (alice, root, child, grandchild) = (f.alice, f.root, f.child, f.grandchild);
        let (checker, store) = f.checker();
        let mut memo = RequestMemo::new();

        let permitted = checker
            .filter_permitted(
                &mut memo,
                &[root, child, grandchild],
                Some(&alice),
                Permission::Read,
            )
            .await
            .unwrap();

        assert!(permitted.is_empty());
        assert_eq!(store.row_reads.load(Ordering::SeqCst), 1);
        assert_eq!(store.ancestry_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn filter_with_missing_rows_walks_once() {
        let mut f = Fixture::new();
        let (alice, root, child, grandchild) = (f.alice, f.root, f.child, f.grandchild);
        f.share(root, Some(alice), Permission::Read);
        let (checker, store) = f.checker();
        let mut memo = RequestMemo::new();

        let permitted = checker
            .filter_permitted(
                &mut memo,
                &[grandchild, root, child],
                Some(&alice),
                Permission::Read,
            )
            .await
            .unwrap();

        assert_eq!(permitted, vec![grandchild, root, child]);
        assert_eq!(store.row_reads.load(Ordering::SeqCst), 1);
        assert_eq!(store.ancestry_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_walk_is_answered_from_memo() {
        let f = Fixture::new();
        let (bob, child) = (f.bob, f.child);
        let (checker, store) = f.checker();
        let mut memo = RequestMemo::new();

        let first = checker
            .check_with_memo(&mut memo, &CheckRequest::new(child, Some(bob), Permission::Read))
            .await
            .unwrap();
        let second = checker
            .check_with_memo(&mut memo, &CheckRequest::new(child, Some(bob), Permission::Admin))
            .await
            .unwrap();

        assert_eq!(first.source, DecisionSource::NoGrant);
        assert!(!first.from_memo);
        assert!(second.from_memo);
        assert_eq!(store.ancestry_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ancestry_check_ignores_stale_rows() {
        let mut f = Fixture::new();
        let (alice, child) = (f.alice, f.child);
        f.row(child, Some(alice), Permission::Admin);
        let (checker, _) = f.checker();

        let cached = checker
            .check(&CheckRequest::new(child, Some(alice), Permission::Admin))
            .await
            .unwrap();
        let walked = checker
            .check_via_ancestry(&CheckRequest::new(child, Some(alice), Permission::Admin))
            .await
            .unwrap();

        assert!(cached.allowed);
        assert!(!walked.allowed);
    }
}
