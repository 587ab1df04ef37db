use std::collections::{HashMap, HashSet};

use crate::model::{CacheKey, Creative, CreativeId, UserId};
use crate::permission::Permission;
use crate::resolve::ResolvedAccess;

/// Request-scoped overlay over the permission cache.
///
/// Owned by a single request and dropped with it. A remembered row of
/// `None` means the cache table was consulted and had no row for that key.
/// Walks are keyed by the authorization root and the actor.
#[derive(Debug, Default)]
pub struct RequestMemo {
    creatives: HashMap<CreativeId, Creative>,
    users: HashSet<UserId>,
    rows: HashMap<CacheKey, Option<Permission>>,
    walks: HashMap<CacheKey, ResolvedAccess>,
}

impl RequestMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn creative(&self, id: &CreativeId) -> Option<&Creative> {
        self.creatives.get(id)
    }

    pub fn remember_creative(&mut self, creative: Creative) {
        self.creatives.insert(creative.id, creative);
    }

    pub fn knows_user(&self, id: &UserId) -> bool {
        self.users.contains(id)
    }

    pub fn remember_user(&mut self, id: UserId) {
        self.users.insert(id);
    }

    pub fn row(&self, key: &CacheKey) -> Option<Option<Permission>> {
        self.rows.get(key).copied()
    }

    pub fn remember_row(&mut self, key: CacheKey, permission: Option<Permission>) {
        self.rows.insert(key, permission);
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn walk(&self, key: &CacheKey) -> Option<ResolvedAccess> {
        self.walks.get(key).copied()
    }

    pub fn remember_walk(&mut self, key: CacheKey, access: ResolvedAccess) {
        self.walks.insert(key, access);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_row_is_distinct_from_known_absent_row() {
        let mut memo = RequestMemo::new();
        let key = CacheKey::new(CreativeId::generate(), None);

        assert_eq!(memo.row(&key), None);

        memo.remember_row(key, None);
        assert_eq!(memo.row(&key), Some(None));

        memo.remember_row(key, Some(Permission::Read));
        assert_eq!(memo.row(&key), Some(Some(Permission::Read)));
        assert_eq!(memo.row_count(), 1);
    }

    #[test]
    fn walks_are_kept_apart_from_rows() {
        let mut memo = RequestMemo::new();
        let key = CacheKey::new(CreativeId::generate(), Some(UserId::generate()));

        memo.remember_walk(key, ResolvedAccess::default());

        assert_eq!(memo.walk(&key), Some(ResolvedAccess::default()));
        assert_eq!(memo.row(&key), None);
        assert_eq!(memo.row_count(), 0);
    }

    #[test]
    fn remembers_creatives_and_users() {
        let mut memo = RequestMemo::new();
        let owner = UserId::generate();
        let creative = Creative::new(CreativeId::generate(), owner);

        memo.remember_creative(creative.clone());
        memo.remember_user(owner);

        assert_eq!(memo.creative(&creative.id), Some(&creative));
        assert!(memo.knows_user(&owner));
        assert!(!memo.knows_user(&UserId::generate()));
    }
}
