//! Navigation over the creative forest.
//!
//! Everything here works against a [`TreeView`], a synchronous read-only
//! view of creatives and shares. Storage backends either implement it
//! directly (the in-memory store) or load the relevant slice of the forest
//! into a [`TreeSnapshot`] first (PostgreSQL, the checker's fallback path).

use std::collections::{HashMap, HashSet};

use crate::model::{Creative, CreativeId, Share, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("creative not found: {0}")]
    CreativeNotFound(CreativeId),

    #[error("origin {origin} of alias {alias} is itself an alias")]
    ChainedOrigin {
        alias: CreativeId,
        origin: CreativeId,
    },

    #[error("cycle detected at creative {0}")]
    Cycle(CreativeId),
}

pub trait TreeView {
    fn creative(&self, id: &CreativeId) -> Option<&Creative>;

    fn children(&self, id: &CreativeId) -> Vec<CreativeId>;

    /// The share on `creative_id` for `user_id`, or the public share when
    /// `user_id` is `None`.
    fn share(&self, creative_id: &CreativeId, user_id: Option<&UserId>) -> Option<&Share>;

    fn shares_on(&self, creative_id: &CreativeId) -> Vec<&Share>;
}

/// Resolves a creative to the creative its permissions are evaluated on.
///
/// Origin links are a single hop; an origin that is itself an alias is a
/// data-integrity error, not something to follow.
pub fn effective_origin<'a, V: TreeView>(
    view: &'a V,
    creative: &'a Creative,
) -> Result<&'a Creative, TreeError> {
    let Some(origin_id) = creative.origin_id else {
        return Ok(creative);
    };

    let origin = view
        .creative(&origin_id)
        .ok_or(TreeError::CreativeNotFound(origin_id))?;

    if origin.is_alias() {
        return Err(TreeError::ChainedOrigin {
            alias: creative.id,
            origin: origin_id,
        });
    }

    Ok(origin)
}

/// Ancestors of `id`, nearest first, excluding `id` itself.
pub fn ancestors<'a, V: TreeView>(
    view: &'a V,
    id: &CreativeId,
) -> Result<Vec<&'a Creative>, TreeError> {
    let start = view.creative(id).ok_or(TreeError::CreativeNotFound(*id))?;

    let mut seen = HashSet::from([*id]);
    let mut out = Vec::new();
    let mut next = start.parent_id;

    while let Some(parent_id) = next {
        if !seen.insert(parent_id) {
            return Err(TreeError::Cycle(parent_id));
        }
        let parent = view
            .creative(&parent_id)
            .ok_or(TreeError::CreativeNotFound(parent_id))?;
        out.push(parent);
        next = parent.parent_id;
    }

    Ok(out)
}

/// `id` and everything below it, in depth-first pre-order.
pub fn subtree<V: TreeView>(view: &V, id: &CreativeId) -> Result<Vec<CreativeId>, TreeError> {
    if view.creative(id).is_none() {
        return Err(TreeError::CreativeNotFound(*id));
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut stack = vec![*id];

    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            return Err(TreeError::Cycle(current));
        }
        out.push(current);
        let mut children = view.children(&current);
        // Reverse so the first child is visited first.
        children.reverse();
        stack.extend(children);
    }

    Ok(out)
}

/// Whether `candidate` is `id` or lies below it.
pub fn is_in_subtree<V: TreeView>(
    view: &V,
    id: &CreativeId,
    candidate: &CreativeId,
) -> Result<bool, TreeError> {
    if id == candidate {
        return Ok(true);
    }
    Ok(ancestors(view, candidate)?.iter().any(|a| a.id == *id))
}

/// An owned slice of the forest: whatever creatives and shares a caller
/// loaded from storage.
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    creatives: HashMap<CreativeId, Creative>,
    shares: HashMap<(CreativeId, Option<UserId>), Share>,
}

impl TreeSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        creatives: impl IntoIterator<Item = Creative>,
        shares: impl IntoIterator<Item = Share>,
    ) -> Self {
        let mut snapshot = Self::new();
        for creative in creatives {
            snapshot.insert_creative(creative);
        }
        for share in shares {
            snapshot.insert_share(share);
        }
        snapshot
    }

    pub fn insert_creative(&mut self, creative: Creative) {
        self.creatives.insert(creative.id, creative);
    }

    pub fn insert_share(&mut self, share: Share) {
        self.shares
            .insert((share.creative_id, share.user_id), share);
    }
}

impl TreeView for TreeSnapshot {
    fn creative(&self, id: &CreativeId) -> Option<&Creative> {
        self.creatives.get(id)
    }

    fn children(&self, id: &CreativeId) -> Vec<CreativeId> {
        let mut children: Vec<CreativeId> = self
            .creatives
            .values()
            .filter(|c| c.parent_id.as_ref() == Some(id))
            .map(|c| c.id)
            .collect();
        children.sort();
        children
    }

    fn share(&self, creative_id: &CreativeId, user_id: Option<&UserId>) -> Option<&Share> {
        self.shares.get(&(*creative_id, user_id.copied()))
    }

    fn shares_on(&self, creative_id: &CreativeId) -> Vec<&Share> {
        self.shares
            .values()
            .filter(|s| s.creative_id == *creative_id)
            .collect()
    }
}
