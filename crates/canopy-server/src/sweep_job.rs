use std::sync::Arc;
use std::time::Duration;

use canopy_core::TenantId;
use canopy_storage::StoreFactory;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::service::PermissionService;

/// Sweeps the tenant's permission cache every `interval` until `shutdown`
/// fires. A failed run is logged and retried on the next tick.
pub fn spawn_sweep_job<F>(
    service: Arc<PermissionService<F>>,
    tenant_id: TenantId,
    interval: Duration,
    mut shutdown: watch::Receiver<()>,
) -> JoinHandle<()>
where
    F: StoreFactory + 'static,
{
    tokio::spawn(async move {
        tracing::info!(
            tenant_id = %tenant_id,
            interval_secs = interval.as_secs(),
            "permission cache sweep scheduled"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = service.run_sweep(&tenant_id).await {
                tracing::error!(tenant_id = %tenant_id, error = %e, "permission cache sweep failed");
            }
        }

        tracing::info!(tenant_id = %tenant_id, "permission cache sweep stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::engine::EngineConfig;
    use canopy_core::{CacheRow, CreativeId, Permission};
    use canopy_storage::{InMemoryStoreFactory, PermissionCacheStore};

    use crate::metrics::Metrics;

    #[tokio::test]
    async fn job_removes_orphans_and_stops_on_shutdown() {
        let factory = Arc::new(InMemoryStoreFactory::new());
        let metrics = Arc::new(Metrics::new());
        let service = Arc::new(
            PermissionService::new(Arc::clone(&factory), EngineConfig::default())
                .with_metrics(Arc::clone(&metrics)),
        );
        let tenant = TenantId::generate();
        let store = factory.for_tenant(&tenant);
        store.insert_cache_row_unchecked(CacheRow {
            creative_id: CreativeId::generate(),
            user_id: None,
            permission: Permission::Read,
            source_share_id: None,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = spawn_sweep_job(
            Arc::clone(&service),
            tenant,
            Duration::from_millis(10),
            shutdown_rx,
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(store.list_cache_rows().await.unwrap().is_empty());
        assert!(metrics.sweep_runs() >= 1);
        assert_eq!(metrics.sweep_rows_removed(), 1);
    }

    #[tokio::test]
    async fn job_exits_promptly_when_shutdown_before_first_tick() {
        let factory = Arc::new(InMemoryStoreFactory::new());
        let service = Arc::new(PermissionService::new(factory, EngineConfig::default()));

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = spawn_sweep_job(
            service,
            TenantId::generate(),
            Duration::from_secs(3600),
            shutdown_rx,
        );
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
