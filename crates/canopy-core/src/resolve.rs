//! Effective-permission resolution over the tree.
//!
//! Walking from `root` towards the forest root, the first creative that
//! carries a share for the actor or a public share decides. On that
//! creative the actor's own share beats the public one; an actor share
//! further up never beats a nearer public share, whatever its rank.
//!
//! [`descend`] is the single step of that walk, applied top-down. The
//! checker's fallback folds it over an ancestor chain and the cache planner
//! folds it over a subtree, so cached and uncached answers share one
//! definition.

use crate::model::{CreativeId, Share, ShareId, UserId};
use crate::permission::Permission;
use crate::tree::{TreeError, TreeView, ancestors};

/// The share that decided, and where it was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub permission: Permission,
    pub share_id: ShareId,
    pub creative_id: CreativeId,
}

impl From<&Share> for Grant {
    fn from(share: &Share) -> Self {
        Self {
            permission: share.permission,
            share_id: share.id,
            creative_id: share.creative_id,
        }
    }
}

/// What the walk found for one actor on one creative.
///
/// `public` is the nearest public share. `user` is the actor's nearest own
/// share, kept only when no public share sits strictly closer. These are
/// exactly the two cache rows for the creative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedAccess {
    pub user: Option<Grant>,
    pub public: Option<Grant>,
}

impl ResolvedAccess {
    pub fn allows(&self, required: Permission) -> bool {
        evaluate(
            self.user.map(|g| g.permission),
            self.public.map(|g| g.permission),
            required,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.public.is_none()
    }
}

/// Combines a user row and a public row.
///
/// A user-specific entry decides on its own; an explicit `no_access` there
/// is a hard stop that no public entry can lift. The public entry only
/// applies when the actor has no entry of their own.
pub fn evaluate(
    user: Option<Permission>,
    public: Option<Permission>,
    required: Permission,
) -> bool {
    match (user, public) {
        (Some(own), _) => own.allows(required),
        (None, Some(public)) => public.allows(required),
        (None, None) => false,
    }
}

/// Moves from a parent's resolution to `node`'s.
///
/// A share on `node` itself is the nearest there is. An actor share keeps
/// the inherited public grant underneath it; a public share without an
/// actor share hides any actor grant from further up.
pub fn descend<V: TreeView>(
    view: &V,
    node: &CreativeId,
    actor: Option<&UserId>,
    inherited: ResolvedAccess,
) -> ResolvedAccess {
    let public = view.share(node, None).map(Grant::from);
    let own = actor.and_then(|actor| view.share(node, Some(actor)).map(Grant::from));

    match (own, public) {
        (Some(own), public) => ResolvedAccess {
            user: Some(own),
            public: public.or(inherited.public),
        },
        (None, Some(public)) => ResolvedAccess {
            user: None,
            public: Some(public),
        },
        (None, None) => inherited,
    }
}

/// Resolves `actor` on the authorization root `root`.
///
/// `root` must already be an effective origin. An anonymous actor only
/// ever gets a public grant.
pub fn resolve_access<V: TreeView>(
    view: &V,
    root: &CreativeId,
    actor: Option<&UserId>,
) -> Result<ResolvedAccess, TreeError> {
    let chain = ancestors(view, root)?;

    let mut access = ResolvedAccess::default();
    for ancestor in chain.iter().rev() {
        access = descend(view, &ancestor.id, actor, access);
    }
    Ok(descend(view, root, actor, access))
}
