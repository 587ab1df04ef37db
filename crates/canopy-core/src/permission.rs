use std::fmt;
use std::str::FromStr;

/// Access levels, lowest first. A level grants everything below it except
/// that `NoAccess` grants nothing at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    /// Explicit denial. On a user-specific entry it blocks any public grant.
    NoAccess,
    #[default]
    Read,
    Feedback,
    Write,
    Admin,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::NoAccess,
        Permission::Read,
        Permission::Feedback,
        Permission::Write,
        Permission::Admin,
    ];

    pub fn rank(self) -> u8 {
        match self {
            Permission::NoAccess => 0,
            Permission::Read => 1,
            Permission::Feedback => 2,
            Permission::Write => 3,
            Permission::Admin => 4,
        }
    }

    pub fn is_denial(self) -> bool {
        self == Permission::NoAccess
    }

    /// Whether holding `self` satisfies `required`.
    pub fn allows(self, required: Permission) -> bool {
        !self.is_denial() && self.rank() >= required.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::NoAccess => "no_access",
            Permission::Read => "read",
            Permission::Feedback => "feedback",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown permission level: {0}")]
pub struct UnknownPermission(pub String);

impl FromStr for Permission {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_access" => Ok(Permission::NoAccess),
            "read" => Ok(Permission::Read),
            "feedback" => Ok(Permission::Feedback),
            "write" => Ok(Permission::Write),
            "admin" => Ok(Permission::Admin),
            other => Err(UnknownPermission(other.to_string())),
        }
    }
}
