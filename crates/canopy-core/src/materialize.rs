//! Derivation of permission cache rows from the tree.
//!
//! The rows for `(creative, audience)` are the two halves of
//! [`ResolvedAccess`]: a user audience gets a row when its own share
//! decides, the public audience gets the nearest public share. Rows are
//! recomputed for whole subtrees whenever a share or a tree edge changes;
//! aliases never get rows because their permissions live on the origin.

use std::collections::HashSet;

use crate::model::{Audience, CacheKey, CacheRow, CreativeId};
use crate::resolve::{Grant, ResolvedAccess, descend, resolve_access};
use crate::tree::{TreeError, TreeView, ancestors, subtree};

/// Row writes needed to bring a subtree's cache in line with the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachePlan {
    pub upserts: Vec<CacheRow>,
    pub clears: Vec<CacheKey>,
}

impl CachePlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.clears.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.clears.len()
    }

    pub fn merge(&mut self, other: CachePlan) {
        self.upserts.extend(other.upserts);
        self.clears.extend(other.clears);
    }
}

/// Plans rows for `node` and every creative below it, for each audience.
pub fn plan_subtree<V: TreeView>(
    view: &V,
    node: &CreativeId,
    audiences: &[Audience],
) -> Result<CachePlan, TreeError> {
    let start = view
        .creative(node)
        .ok_or(TreeError::CreativeNotFound(*node))?;

    let mut plan = CachePlan::default();

    for audience in audiences {
        let inherited = match start.parent_id {
            Some(ref parent) => resolve_access(view, parent, audience.as_ref())?,
            None => ResolvedAccess::default(),
        };
        plan_audience(view, node, audience, inherited, &mut plan)?;
    }

    Ok(plan)
}

fn plan_audience<V: TreeView>(
    view: &V,
    node: &CreativeId,
    audience: &Audience,
    inherited: ResolvedAccess,
    plan: &mut CachePlan,
) -> Result<(), TreeError> {
    let mut seen = HashSet::new();
    let mut stack = vec![(*node, inherited)];

    while let Some((id, inherited)) = stack.pop() {
        if !seen.insert(id) {
            return Err(TreeError::Cycle(id));
        }
        let creative = view.creative(&id).ok_or(TreeError::CreativeNotFound(id))?;
        let key = CacheKey::new(id, *audience);

        if creative.is_alias() {
            plan.clears.push(key);
            continue;
        }

        let access = descend(view, &id, audience.as_ref(), inherited);
        let grant = match audience {
            Some(_) => access.user,
            None => access.public,
        };

        match grant {
            Some(grant) => plan.upserts.push(row(id, *audience, grant)),
            None => plan.clears.push(key),
        }

        for child in view.children(&id) {
            stack.push((child, access));
        }
    }

    Ok(())
}

fn row(creative_id: CreativeId, user_id: Audience, grant: Grant) -> CacheRow {
    CacheRow {
        creative_id,
        user_id,
        permission: grant.permission,
        source_share_id: Some(grant.share_id),
    }
}

/// Audiences whose rows below `node` can depend on the tree around it:
/// anyone holding a share on `node`, on one of its ancestors, or anywhere
/// in its subtree.
pub fn audiences_for_subtree<V: TreeView>(
    view: &V,
    node: &CreativeId,
) -> Result<Vec<Audience>, TreeError> {
    let mut audiences = Vec::new();
    let mut seen = HashSet::new();

    let mut collect = |id: &CreativeId| {
        for share in view.shares_on(id) {
            if seen.insert(share.user_id) {
                audiences.push(share.user_id);
            }
        }
    };

    for ancestor in ancestors(view, node)? {
        collect(&ancestor.id);
    }
    for id in subtree(view, node)? {
        collect(&id);
    }

    Ok(audiences)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Creative, Share, ShareId, UserId};
    use crate::permission::Permission;
    use crate::resolve::resolve_access;
    use crate::tree::TreeSnapshot;

    fn share(on: CreativeId, user: Audience, permission: Permission) -> Share {
        Share {
            id: ShareId::generate(),
            creative_id: on,
            user_id: user,
            permission,
            shared_by_id: UserId::generate(),
        }
    }

    fn find(plan: &CachePlan, creative: CreativeId, user: Audience) -> Option<&CacheRow> {
        plan.upserts
            .iter()
            .find(|r| r.creative_id == creative && r.user_id == user)
    }

    #[test]
    fn grant_on_root_materialises_every_descendant() {
        let owner = UserId::generate();
        let alice = UserId::generate();
        let root = CreativeId::generate();
        let child = CreativeId::generate();
        let grandchild = CreativeId::generate();
        let root_share = share(root, Some(alice), Permission::Write);
        let snapshot = TreeSnapshot::from_parts(
            [
                Creative::new(root, owner),
                Creative::new(child, owner).with_parent(root),
                Creative::new(grandchild, owner).with_parent(child),
            ],
            [root_share.clone()],
        );

        let plan = plan_subtree(&snapshot, &root, &[Some(alice)]).unwrap();

        assert_eq!(plan.upserts.len(), 3);
        assert!(plan.clears.is_empty());
        for row in &plan.upserts {
            assert_eq!(row.permission, Permission::Write);
            assert_eq!(row.source_share_id, Some(root_share.id));
        }
    }

    #[test]
    fn nearer_share_takes_over_below_it() {
        let owner = UserId::generate();
        let alice = UserId::generate();
        let root = CreativeId::generate();
        let child = CreativeId::generate();
        let grandchild = CreativeId::generate();
        let denial = share(child, Some(alice), Permission::NoAccess);
        let snapshot = TreeSnapshot::from_parts(
            [
                Creative::new(root, owner),
                Creative::new(child, owner).with_parent(root),
                Creative::new(grandchild, owner).with_parent(child),
            ],
            [share(root, Some(alice), Permission::Admin), denial.clone()],
        );

        let plan = plan_subtree(&snapshot, &root, &[Some(alice)]).unwrap();

        assert_eq!(
            find(&plan, root, Some(alice)).unwrap().permission,
            Permission::Admin
        );
        let grandchild_row = find(&plan, grandchild, Some(alice)).unwrap();
        assert_eq!(grandchild_row.permission, Permission::NoAccess);
        assert_eq!(grandchild_row.source_share_id, Some(denial.id));
    }

    #[test]
    fn subtree_plan_inherits_from_unplanned_ancestor() {
        let owner = UserId::generate();
        let root = CreativeId::generate();
        let child = CreativeId::generate();
        let snapshot = TreeSnapshot::from_parts(
            [
                Creative::new(root, owner),
                Creative::new(child, owner).with_parent(root),
            ],
            [share(root, None, Permission::Read)],
        );

        let plan = plan_subtree(&snapshot, &child, &[None]).unwrap();

        assert_eq!(plan.upserts.len(), 1);
        assert_eq!(find(&plan, child, None).unwrap().permission, Permission::Read);
    }

    #[test]
    fn unshared_audience_is_cleared() {
        let owner = UserId::generate();
        let alice = UserId::generate();
        let root = CreativeId::generate();
        let snapshot = TreeSnapshot::from_parts([Creative::new(root, owner)], []);

        let plan = plan_subtree(&snapshot, &root, &[Some(alice)]).unwrap();

        assert!(plan.upserts.is_empty());
        assert_eq!(plan.clears, vec![CacheKey::new(root, Some(alice))]);
    }

    #[test]
    fn aliases_never_get_rows() {
        let owner = UserId::generate();
        let root = CreativeId::generate();
        let origin = CreativeId::generate();
        let alias = CreativeId::generate();
        let snapshot = TreeSnapshot::from_parts(
            [
                Creative::new(root, owner),
                Creative::new(origin, owner),
                Creative::new(alias, owner)
                    .with_parent(root)
                    .with_origin(origin),
            ],
            [share(root, None, Permission::Read)],
        );

        let plan = plan_subtree(&snapshot, &root, &[None]).unwrap();

        assert!(find(&plan, alias, None).is_none());
        assert!(plan.clears.contains(&CacheKey::new(alias, None)));
    }

    #[test]
    fn planned_rows_agree_with_resolution() {
        let owner = UserId::generate();
        let alice = UserId::generate();
        let root = CreativeId::generate();
        let child = CreativeId::generate();
        let leaf = CreativeId::generate();
        let snapshot = TreeSnapshot::from_parts(
            [
                Creative::new(root, owner),
                Creative::new(child, owner).with_parent(root),
                Creative::new(leaf, owner).with_parent(child),
            ],
            [
                share(root, None, Permission::Write),
                share(child, Some(alice), Permission::Feedback),
            ],
        );

        let plan = plan_subtree(&snapshot, &root, &[Some(alice), None]).unwrap();

        for id in [root, child, leaf] {
            let resolved = resolve_access(&snapshot, &id, Some(&alice)).unwrap();
            assert_eq!(
                find(&plan, id, Some(alice)).map(|r| r.permission),
                resolved.user.map(|g| g.permission)
            );
            assert_eq!(
                find(&plan, id, None).map(|r| r.permission),
                resolved.public.map(|g| g.permission)
            );
        }
    }

    #[test]
    fn nearer_public_share_suppresses_user_rows_below_it() {
        let owner = UserId::generate();
        let alice = UserId::generate();
        let root = CreativeId::generate();
        let child = CreativeId::generate();
        let grandchild = CreativeId::generate();
        let public = share(child, None, Permission::Read);
        let snapshot = TreeSnapshot::from_parts(
            [
                Creative::new(root, owner),
                Creative::new(child, owner).with_parent(root),
                Creative::new(grandchild, owner).with_parent(child),
            ],
            [share(root, Some(alice), Permission::NoAccess), public.clone()],
        );

        let plan = plan_subtree(&snapshot, &root, &[Some(alice), None]).unwrap();

        assert_eq!(
            find(&plan, root, Some(alice)).unwrap().permission,
            Permission::NoAccess
        );
        assert!(find(&plan, child, Some(alice)).is_none());
        assert!(find(&plan, grandchild, Some(alice)).is_none());
        assert!(plan.clears.contains(&CacheKey::new(grandchild, Some(alice))));
        let public_row = find(&plan, grandchild, None).unwrap();
        assert_eq!(public_row.source_share_id, Some(public.id));
    }

    #[test]
    fn user_share_keeps_its_rows_next_to_public_share() {
        let owner = UserId::generate();
        let alice = UserId::generate();
        let root = CreativeId::generate();
        let child = CreativeId::generate();
        let snapshot = TreeSnapshot::from_parts(
            [
                Creative::new(root, owner),
                Creative::new(child, owner).with_parent(root),
            ],
            [
                share(root, Some(alice), Permission::Write),
                share(root, None, Permission::Read),
            ],
        );

        let plan = plan_subtree(&snapshot, &child, &[Some(alice)]).unwrap();

        assert_eq!(
            find(&plan, child, Some(alice)).unwrap().permission,
            Permission::Write
        );
    }

    #[test]
    fn audiences_cover_ancestors_and_subtree() {
        let owner = UserId::generate();
        let alice = UserId::generate();
        let bob = UserId::generate();
        let root = CreativeId::generate();
        let child = CreativeId::generate();
        let leaf = CreativeId::generate();
        let snapshot = TreeSnapshot::from_parts(
            [
                Creative::new(root, owner),
                Creative::new(child, owner).with_parent(root),
                Creative::new(leaf, owner).with_parent(child),
            ],
            [
                share(root, Some(alice), Permission::Read),
                share(leaf, Some(bob), Permission::Read),
                share(leaf, None, Permission::Read),
            ],
        );

        let mut audiences = audiences_for_subtree(&snapshot, &child).unwrap();
        audiences.sort();

        let mut expected = vec![Some(alice), Some(bob), None];
        expected.sort();
        assert_eq!(audiences, expected);
    }
}
