use std::sync::Arc;
use std::time::Instant;

use canopy_core::engine::{CheckRequest, EngineConfig, PermissionChecker};
use canopy_core::{CreativeId, Permission, TenantId, UserId};
use canopy_server::adapter::StorePermissionReader;
use canopy_server::service::{CreateCreativeInput, GrantInput, PermissionService};
use canopy_storage::{InMemoryStoreFactory, StoreFactory};

fn make_service() -> (
    PermissionService<InMemoryStoreFactory>,
    Arc<InMemoryStoreFactory>,
    TenantId,
) {
    let factory = Arc::new(InMemoryStoreFactory::new());
    let service = PermissionService::new(Arc::clone(&factory), EngineConfig::default());
    let tenant_id = TenantId::new(uuid::Uuid::new_v4());
    (service, factory, tenant_id)
}

async fn create(
    service: &PermissionService<InMemoryStoreFactory>,
    tenant_id: &TenantId,
    actor: UserId,
    parent_id: Option<CreativeId>,
) -> CreativeId {
    service
        .create_creative(
            tenant_id,
            CreateCreativeInput {
                actor,
                parent_id,
                origin_id: None,
            },
        )
        .await
        .unwrap()
        .id
}

async fn grant(
    service: &PermissionService<InMemoryStoreFactory>,
    tenant_id: &TenantId,
    actor: UserId,
    creative_id: CreativeId,
    user_id: Option<UserId>,
    permission: Permission,
) {
    service
        .grant(
            tenant_id,
            GrantInput {
                actor,
                creative_id,
                user_id,
                permission,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn load_test_1000_creatives_hierarchical_check() {
    let (service, _, tenant_id) = make_service();
    let owner = service.create_user(&tenant_id, "owner").await.unwrap().id;
    let alice = service.create_user(&tenant_id, "alice").await.unwrap().id;

    // 10 folders, each with 100 documents
    let root = create(&service, &tenant_id, owner, None).await;
    let mut docs = Vec::new();
    for _ in 0..10 {
        let folder = create(&service, &tenant_id, owner, Some(root)).await;
        for _ in 0..100 {
            docs.push(create(&service, &tenant_id, owner, Some(folder)).await);
        }
    }
    assert_eq!(docs.len(), 1000);

    let grant_start = Instant::now();
    grant(&service, &tenant_id, owner, root, Some(alice), Permission::Read).await;
    let grant_elapsed = grant_start.elapsed();

    let start = Instant::now();
    for doc in &docs {
        let allowed = service
            .has_permission(&tenant_id, doc, Some(&alice), Permission::Read)
            .await
            .unwrap();
        assert!(allowed, "alice should have access to {doc}");
    }

    let elapsed = start.elapsed();
    eprintln!(
        "load_test_1000_creatives: grant rewrote the subtree in {:.2?}, 1000 checks in {:.2?} ({:.2?}/check)",
        grant_elapsed,
        elapsed,
        elapsed / 1000,
    );
}

#[tokio::test]
#[ignore]
async fn load_test_deep_chain_cache_vs_walk() {
    let (service, factory, tenant_id) = make_service();
    let owner = service.create_user(&tenant_id, "owner").await.unwrap().id;
    let alice = service.create_user(&tenant_id, "alice").await.unwrap().id;

    let root = create(&service, &tenant_id, owner, None).await;
    let mut leaf = root;
    for _ in 0..200 {
        leaf = create(&service, &tenant_id, owner, Some(leaf)).await;
    }
    grant(&service, &tenant_id, owner, root, Some(alice), Permission::Write).await;

    let store = Arc::new(factory.for_tenant(&tenant_id));
    let checker = PermissionChecker::new(
        Arc::new(StorePermissionReader::new(store)),
        EngineConfig::default(),
    );
    let request = CheckRequest::new(leaf, Some(alice), Permission::Write);

    let cache_start = Instant::now();
    for _ in 0..100 {
        assert!(checker.check(&request).await.unwrap().allowed);
    }
    let cache_elapsed = cache_start.elapsed();

    let walk_start = Instant::now();
    for _ in 0..100 {
        assert!(checker.check_via_ancestry(&request).await.unwrap().allowed);
    }
    let walk_elapsed = walk_start.elapsed();

    eprintln!(
        "load_test_deep_chain: depth 200, 100 cached checks in {:.2?}, 100 walks in {:.2?}",
        cache_elapsed, walk_elapsed,
    );
}

#[tokio::test]
#[ignore]
async fn load_test_10000_creatives_filter_permitted() {
    let (service, _, tenant_id) = make_service();
    let owner = service.create_user(&tenant_id, "owner").await.unwrap().id;
    let alice = service.create_user(&tenant_id, "alice").await.unwrap().id;

    let mut ids = Vec::with_capacity(10_000);
    for i in 0..10_000 {
        let id = create(&service, &tenant_id, owner, None).await;
        if i % 2 == 0 {
            grant(&service, &tenant_id, owner, id, Some(alice), Permission::Read).await;
        }
        ids.push(id);
    }

    let start = Instant::now();
    let permitted = service
        .filter_permitted(&tenant_id, &ids, Some(&alice), Permission::Read)
        .await
        .unwrap();

    let elapsed = start.elapsed();
    eprintln!(
        "load_test_10000_creatives: filter_permitted kept {} of {} in {:.2?}",
        permitted.len(),
        ids.len(),
        elapsed,
    );

    assert_eq!(permitted.len(), 5_000);
}

#[tokio::test]
#[ignore]
async fn load_test_sweep_after_mass_user_purge() {
    let (service, factory, tenant_id) = make_service();
    let owner = service.create_user(&tenant_id, "owner").await.unwrap().id;
    let root = create(&service, &tenant_id, owner, None).await;
    for _ in 0..100 {
        create(&service, &tenant_id, owner, Some(root)).await;
    }

    let mut users = Vec::new();
    for i in 0..100 {
        let user = service
            .create_user(&tenant_id, &format!("user{i}"))
            .await
            .unwrap()
            .id;
        grant(&service, &tenant_id, owner, root, Some(user), Permission::Read).await;
        users.push(user);
    }

    let store = factory.for_tenant(&tenant_id);
    for user in &users {
        store.purge_user_unchecked(user);
    }

    let start = Instant::now();
    let report = service.run_sweep(&tenant_id).await.unwrap();
    let elapsed = start.elapsed();

    eprintln!(
        "load_test_sweep: removed {} orphaned rows in {:.2?}",
        report.removed(),
        elapsed,
    );

    assert_eq!(report.missing_user, 100 * 101);
    assert_eq!(service.run_sweep(&tenant_id).await.unwrap().removed(), 0);
}
