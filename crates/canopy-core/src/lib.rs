pub mod engine;
pub mod materialize;
pub mod model;
pub mod permission;
pub mod resolve;
pub mod tree;

pub use model::{
    Audience, CacheKey, CacheRow, Creative, CreativeId, NewCreative, NewShare, Share, ShareId,
    TenantId, User, UserId,
};
pub use permission::Permission;
