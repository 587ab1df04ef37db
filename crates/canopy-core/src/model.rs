use std::fmt;

use uuid::Uuid;

use crate::permission::Permission;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Isolates one organisation's data from another's.
    TenantId
);
uuid_id!(CreativeId);
uuid_id!(UserId);
uuid_id!(ShareId);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

/// A node in the creative forest.
///
/// When `origin_id` is set the creative is a linked alias: its content and
/// its permissions live on the origin, which is never itself an alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Creative {
    pub id: CreativeId,
    pub parent_id: Option<CreativeId>,
    pub origin_id: Option<CreativeId>,
    pub owner_id: UserId,
}

impl Creative {
    pub fn new(id: CreativeId, owner_id: UserId) -> Self {
        Self {
            id,
            parent_id: None,
            origin_id: None,
            owner_id,
        }
    }

    pub fn with_parent(mut self, parent_id: CreativeId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_origin(mut self, origin_id: CreativeId) -> Self {
        self.origin_id = Some(origin_id);
        self
    }

    pub fn is_alias(&self) -> bool {
        self.origin_id.is_some()
    }

    /// The creative whose shares govern this one.
    pub fn authorization_root_id(&self) -> CreativeId {
        self.origin_id.unwrap_or(self.id)
    }
}

impl fmt::Display for Creative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "creative:{}", self.id)?;
        if let Some(ref origin) = self.origin_id {
            write!(f, "->{origin}")?;
        }
        Ok(())
    }
}

/// Who a share or cache row applies to. `None` is the public audience.
pub type Audience = Option<UserId>;

pub fn audience_label(audience: Option<&UserId>) -> String {
    match audience {
        Some(user) => format!("user:{user}"),
        None => "public".to_string(),
    }
}

/// An explicit grant (or, with [`Permission::NoAccess`], denial).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Share {
    pub id: ShareId,
    pub creative_id: CreativeId,
    pub user_id: Audience,
    pub permission: Permission,
    pub shared_by_id: UserId,
}

impl Share {
    pub fn is_public(&self) -> bool {
        self.user_id.is_none()
    }
}

impl fmt::Display for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "creative:{}#{}@{}",
            self.creative_id,
            self.permission,
            audience_label(self.user_id.as_ref())
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewShare {
    pub creative_id: CreativeId,
    pub user_id: Audience,
    pub permission: Permission,
    pub shared_by_id: UserId,
}

impl NewShare {
    pub fn new(
        creative_id: CreativeId,
        user_id: Audience,
        permission: Permission,
        shared_by_id: UserId,
    ) -> Self {
        Self {
            creative_id,
            user_id,
            permission,
            shared_by_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCreative {
    pub owner_id: UserId,
    pub parent_id: Option<CreativeId>,
    pub origin_id: Option<CreativeId>,
}

impl NewCreative {
    pub fn root(owner_id: UserId) -> Self {
        Self {
            owner_id,
            parent_id: None,
            origin_id: None,
        }
    }

    pub fn child_of(owner_id: UserId, parent_id: CreativeId) -> Self {
        Self {
            owner_id,
            parent_id: Some(parent_id),
            origin_id: None,
        }
    }

    pub fn linked(mut self, origin_id: CreativeId) -> Self {
        self.origin_id = Some(origin_id);
        self
    }
}

/// Key of a permission cache row: at most one row exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub creative_id: CreativeId,
    pub user_id: Audience,
}

impl CacheKey {
    pub fn new(creative_id: CreativeId, user_id: Audience) -> Self {
        Self {
            creative_id,
            user_id,
        }
    }
}

/// Materialised effective permission for one creative and audience.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheRow {
    pub creative_id: CreativeId,
    pub user_id: Audience,
    pub permission: Permission,
    pub source_share_id: Option<ShareId>,
}

impl CacheRow {
    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.creative_id, self.user_id)
    }
}

impl fmt::Display for CacheRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cache[creative:{} {}]={}",
            self.creative_id,
            audience_label(self.user_id.as_ref()),
            self.permission
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_root_is_self_for_plain_creative() {
        let creative = Creative::new(CreativeId::generate(), UserId::generate());

        assert_eq!(creative.authorization_root_id(), creative.id);
        assert!(!creative.is_alias());
    }

    #[test]
    fn authorization_root_is_origin_for_alias() {
        let origin = CreativeId::generate();
        let alias = Creative::new(CreativeId::generate(), UserId::generate()).with_origin(origin);

        assert_eq!(alias.authorization_root_id(), origin);
        assert!(alias.is_alias());
    }

    #[test]
    fn share_display_names_public_audience() {
        let share = Share {
            id: ShareId::generate(),
            creative_id: CreativeId::new(Uuid::nil()),
            user_id: None,
            permission: Permission::Read,
            shared_by_id: UserId::generate(),
        };

        assert_eq!(
            share.to_string(),
            "creative:00000000-0000-0000-0000-000000000000#read@public"
        );
        assert!(share.is_public());
    }

    #[test]
    fn cache_row_key_matches_fields() {
        let user = UserId::generate();
        let row = CacheRow {
            creative_id: CreativeId::generate(),
            user_id: Some(user),
            permission: Permission::Write,
            source_share_id: None,
        };

        assert_eq!(row.key(), CacheKey::new(row.creative_id, Some(user)));
    }
}
