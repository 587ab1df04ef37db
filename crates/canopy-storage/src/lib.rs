pub mod memory;
pub mod postgres;
pub mod sweep;
pub mod traits;

pub use memory::{InMemoryStore, InMemoryStoreFactory};
pub use postgres::{PostgresStore, PostgresStoreFactory};
pub use sweep::{SweepReport, run_sweep_cycle};
pub use traits::{
    CreativeStore, OrphanReason, PermissionCacheStore, ShareStore, StorageError, StoreFactory,
    UserStore,
};
