mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

use storage_quota::client::{ClientId, ClientMask};
use storage_quota::manager::{
    EvictionRoundStats, StorageObserverFilter, StorageObserverParams,
    DEFAULT_MIN_AVAILABLE_DISK_SPACE_TO_START_EVICTION, INCOGNITO_DEFAULT_QUOTA_LIMIT,
    MINIMUM_PRESERVE_FOR_SYSTEM, NO_LIMIT, PER_HOST_PERSISTENT_QUOTA_LIMIT,
    SYNCABLE_DEFAULT_HOST_QUOTA,
};
use storage_quota::manager::{DiskSpaceProbe, QuotaManager, QuotaManagerProxy};
use storage_quota::policy::{PolicyChange, StoragePolicy};
use storage_quota::types::{GlobalUsage, OriginId, StorageKind, UsageAndQuota};
use storage_quota::{QuotaError, QuotaSettings};

use support::{Harness, MockStorageClient, GIB};

fn temporary_client(entries: &[(&str, i64)]) -> std::sync::Arc<MockStorageClient> {
    let client = MockStorageClient::new(ClientId::FileSystem, &[StorageKind::Temporary]);
    for (origin, usage) in entries {
        client.set_usage(origin, StorageKind::Temporary, *usage);
    }
    client
}

#[tokio::test]
async fn test_concurrent_host_queries_enumerate_once() {
    let client = temporary_client(&[("http://foo.com/", 10), ("https://foo.com/", 20)]);
    let harness = Harness::new(vec![client.clone()]);

    // Force initialization (and its bootstrap enumeration) out of the way.
    harness
        .manager
        .get_persistent_host_quota("warmup.com")
        .await
        .expect("warmup");
    let before = client.enumeration_count();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let proxy = harness.manager.proxy();
        handles.push(tokio::spawn(async move {
            proxy.get_host_usage("foo.com", StorageKind::Temporary).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.expect("join"), Ok(30));
    }
    assert_eq!(client.enumeration_count(), before + 1);
}

#[tokio::test]
async fn test_usage_sums_across_clients_and_partial_deletion() {
    let fs = MockStorageClient::new(ClientId::FileSystem, &[StorageKind::Temporary]);
    let db = MockStorageClient::new(ClientId::Database, &[StorageKind::Temporary]);
    let idb = MockStorageClient::new(ClientId::IndexedDb, &[StorageKind::Temporary]);
    fs.set_usage("http://foo.com/", StorageKind::Temporary, 10);
    db.set_usage("http://foo.com/", StorageKind::Temporary, 20);
    idb.set_usage("http://foo.com/", StorageKind::Temporary, 30);
    let harness = Harness::new(vec![fs, db, idb]);
    let origin = OriginId::from("http://foo.com/");

    assert_eq!(
        harness
            .manager
            .get_host_usage("foo.com", StorageKind::Temporary)
            .await,
        Ok(60)
    );
    assert_eq!(
        harness.manager.get_global_usage(StorageKind::Temporary).await,
        Ok(GlobalUsage { limited: 60, unlimited: 0 })
    );

    // Deleting one client's data leaves the others' bytes and the origin's
    // metadata row in place.
    harness
        .manager
        .delete_origin_data(&origin, StorageKind::Temporary, ClientMask::single(ClientId::Database))
        .await
        .expect("partial deletion");
    assert_eq!(
        harness
            .manager
            .get_host_usage("foo.com", StorageKind::Temporary)
            .await,
        Ok(40)
    );
    let rows = harness.manager.dump_origin_info_table().await.expect("dump");
    assert!(rows.iter().any(|row| row.origin == origin));

    // A full-mask deletion also drops the metadata row.
    harness
        .manager
        .delete_origin_data(&origin, StorageKind::Temporary, ClientMask::ALL)
        .await
        .expect("full deletion");
    assert_eq!(
        harness
            .manager
            .get_host_usage("foo.com", StorageKind::Temporary)
            .await,
        Ok(0)
    );
    let rows = harness.manager.dump_origin_info_table().await.expect("dump");
    assert!(!rows.iter().any(|row| row.origin == origin));
}

#[tokio::test]
async fn test_temporary_quota_derivation_and_override() {
    let client = temporary_client(&[("http://foo.com/", 10)]);
    let harness = Harness::new(vec![client]);
    harness.set_free_space(290);

    // Derived pool: (free + limited usage) / 3, one fifth per host.
    assert_eq!(harness.manager.get_temporary_global_quota().await, Ok(100));
    assert_eq!(
        harness
            .manager
            .get_usage_and_quota_for_web_apps(&OriginId::from("http://foo.com/"), StorageKind::Temporary)
            .await,
        Ok(UsageAndQuota { usage: 10, quota: 20 })
    );

    assert_eq!(
        harness
            .manager
            .set_temporary_global_override_quota(1000)
            .await,
        Ok(1000)
    );
    assert_eq!(harness.manager.get_temporary_global_quota().await, Ok(1000));
    assert_eq!(
        harness
            .manager
            .get_usage_and_quota_for_web_apps(&OriginId::from("http://foo.com/"), StorageKind::Temporary)
            .await,
        Ok(UsageAndQuota { usage: 10, quota: 200 })
    );

    // Zero clears the override and the derived value comes back.
    assert_eq!(
        harness.manager.set_temporary_global_override_quota(0).await,
        Ok(100)
    );
    assert!(matches!(
        harness.manager.set_temporary_global_override_quota(-1).await,
        Err(QuotaError::InvalidModification(_))
    ));
}

#[tokio::test]
async fn test_over_budget_pool_denies_growth_room() {
    let client = temporary_client(&[
        ("http://tiny.com/", 1),
        ("http://mid.com/", 10),
        ("http://big.com/", 200),
    ]);
    let harness = Harness::new(vec![client]);
    let big = OriginId::from("http://big.com/");

    harness
        .manager
        .set_temporary_global_override_quota(2000)
        .await
        .expect("override");
    assert_eq!(
        harness
            .manager
            .get_usage_and_quota_for_web_apps(&big, StorageKind::Temporary)
            .await,
        Ok(UsageAndQuota { usage: 200, quota: 400 })
    );

    // Shrink the pool below what is already stored (211 used vs 100): hosts
    // under their one-fifth share are frozen at current usage, hosts above
    // it still only see the share.
    harness
        .manager
        .set_temporary_global_override_quota(100)
        .await
        .expect("override");
    assert_eq!(
        harness
            .manager
            .get_usage_and_quota_for_web_apps(&OriginId::from("http://tiny.com/"), StorageKind::Temporary)
            .await,
        Ok(UsageAndQuota { usage: 1, quota: 1 })
    );
    assert_eq!(
        harness
            .manager
            .get_usage_and_quota_for_web_apps(&OriginId::from("http://mid.com/"), StorageKind::Temporary)
            .await,
        Ok(UsageAndQuota { usage: 10, quota: 10 })
    );
    assert_eq!(
        harness
            .manager
            .get_usage_and_quota_for_web_apps(&big, StorageKind::Temporary)
            .await,
        Ok(UsageAndQuota { usage: 200, quota: 20 })
    );
}

#[tokio::test]
async fn test_unlimited_origin_answers_per_variant() {
    let client = temporary_client(&[("http://u.com/", 10)]);
    let harness = Harness::new(vec![client]);
    let origin = OriginId::from("http://u.com/");
    harness.policy.grant_unlimited("http://u.com/");
    harness.set_free_space(2 * GIB);

    // Storage clients only learn "no limit"; no usage is computed.
    assert_eq!(
        harness
            .manager
            .get_usage_and_quota(&origin, StorageKind::Temporary)
            .await,
        Ok(UsageAndQuota { usage: 0, quota: NO_LIMIT })
    );

    // Web apps see real usage and a quota bounded by disk headroom.
    assert_eq!(
        harness
            .manager
            .get_usage_and_quota_for_web_apps(&origin, StorageKind::Temporary)
            .await,
        Ok(UsageAndQuota {
            usage: 10,
            quota: 2 * GIB - MINIMUM_PRESERVE_FOR_SYSTEM + 10,
        })
    );
}

#[tokio::test]
async fn test_disk_headroom_bounds_privileged_origins() {
    let client = temporary_client(&[("http://app.com/", 10)]);
    let harness = Harness::new(vec![client]);
    let origin = OriginId::from("http://app.com/");
    harness.policy.allow_disk_query("http://app.com/");
    harness
        .manager
        .set_temporary_global_override_quota(1000)
        .await
        .expect("override");

    harness.set_free_space(MINIMUM_PRESERVE_FOR_SYSTEM + 50);
    assert_eq!(
        harness
            .manager
            .get_usage_and_quota_for_web_apps(&origin, StorageKind::Temporary)
            .await,
        Ok(UsageAndQuota { usage: 10, quota: 60 })
    );

    // Below the preserved margin the origin cannot grow at all.
    harness.set_free_space(100);
    assert_eq!(
        harness
            .manager
            .get_usage_and_quota_for_web_apps(&origin, StorageKind::Temporary)
            .await,
        Ok(UsageAndQuota { usage: 10, quota: 10 })
    );
}

#[tokio::test]
async fn test_incognito_quota_is_capped() {
    let client = temporary_client(&[("http://foo.com/", 10)]);
    let harness = Harness::incognito(vec![client]);

    let answer = harness
        .manager
        .get_usage_and_quota_for_web_apps(&OriginId::from("http://foo.com/"), StorageKind::Temporary)
        .await
        .expect("usage and quota");
    assert_eq!(answer.usage, 10);
    assert_eq!(answer.quota, INCOGNITO_DEFAULT_QUOTA_LIMIT);
}

#[tokio::test]
async fn test_persistent_host_quota_roundtrip() {
    let client = MockStorageClient::new(
        ClientId::FileSystem,
        &[StorageKind::Temporary, StorageKind::Persistent],
    );
    client.set_usage("http://foo.com/", StorageKind::Persistent, 7);
    let harness = Harness::new(vec![client]);

    assert_eq!(harness.manager.get_persistent_host_quota("foo.com").await, Ok(0));
    assert_eq!(
        harness.manager.set_persistent_host_quota("foo.com", 100).await,
        Ok(100)
    );
    assert_eq!(
        harness.manager.get_persistent_host_quota("foo.com").await,
        Ok(100)
    );
    assert_eq!(
        harness
            .manager
            .get_usage_and_quota_for_web_apps(&OriginId::from("http://foo.com/"), StorageKind::Persistent)
            .await,
        Ok(UsageAndQuota { usage: 7, quota: 100 })
    );

    // Grants clamp at the hard per-host ceiling.
    assert_eq!(
        harness
            .manager
            .set_persistent_host_quota("foo.com", PER_HOST_PERSISTENT_QUOTA_LIMIT + 1)
            .await,
        Ok(PER_HOST_PERSISTENT_QUOTA_LIMIT)
    );
    assert!(matches!(
        harness.manager.set_persistent_host_quota("foo.com", -5).await,
        Err(QuotaError::InvalidModification(_))
    ));

    let rows = harness.manager.dump_host_quota_table().await.expect("dump");
    let row = rows
        .iter()
        .find(|row| row.host == "foo.com")
        .expect("host row");
    assert_eq!(row.kind, StorageKind::Persistent);
    assert_eq!(row.quota, PER_HOST_PERSISTENT_QUOTA_LIMIT);

    // Empty hosts have no quota and reject grants.
    assert_eq!(harness.manager.get_persistent_host_quota("").await, Ok(0));
    assert!(matches!(
        harness.manager.set_persistent_host_quota("", 10).await,
        Err(QuotaError::NotSupported(_))
    ));
}

#[tokio::test]
async fn test_syncable_quota_defaults() {
    let client = temporary_client(&[]);
    let harness = Harness::new(vec![client]);
    assert_eq!(
        harness.manager.get_syncable_quota("foo.com").await,
        Ok(SYNCABLE_DEFAULT_HOST_QUOTA)
    );
}

#[tokio::test]
async fn test_unmanaged_kind_is_rejected() {
    let client = temporary_client(&[]);
    let harness = Harness::new(vec![client]);
    assert!(matches!(
        harness.manager.get_global_usage(StorageKind::Unmanaged).await,
        Err(QuotaError::NotSupported(_))
    ));
    assert!(matches!(
        harness
            .manager
            .get_usage_and_quota_for_web_apps(&OriginId::from("http://foo.com/"), StorageKind::Unmanaged)
            .await,
        Err(QuotaError::NotSupported(_))
    ));
}

#[tokio::test]
async fn test_unmanaged_notifications_leave_no_rows() {
    let client = temporary_client(&[("http://foo.com/", 10)]);
    let harness = Harness::new(vec![client]);
    let origin = OriginId::from("http://x.com/");

    harness
        .manager
        .notify_storage_modified(ClientId::FileSystem, &origin, StorageKind::Unmanaged, 5)
        .await;
    harness
        .manager
        .notify_storage_accessed(ClientId::FileSystem, &origin, StorageKind::Unmanaged)
        .await;

    let rows = harness.manager.dump_origin_info_table().await.expect("dump");
    assert!(!rows.iter().any(|row| row.origin == origin));
}

#[tokio::test]
async fn test_policy_transitions_rebucket_global_usage() {
    let client = temporary_client(&[("http://foo.com/", 10), ("http://u.com/", 20)]);
    let harness = Harness::new(vec![client]);

    assert_eq!(
        harness.manager.get_global_usage(StorageKind::Temporary).await,
        Ok(GlobalUsage { limited: 30, unlimited: 0 })
    );

    harness.policy.grant_unlimited("http://u.com/");
    harness
        .manager
        .notify_policy_change(PolicyChange::GrantedUnlimited(OriginId::from("http://u.com/")))
        .await;
    assert_eq!(
        harness.manager.get_global_usage(StorageKind::Temporary).await,
        Ok(GlobalUsage { limited: 10, unlimited: 20 })
    );

    harness.policy.revoke_unlimited("http://u.com/");
    harness
        .manager
        .notify_policy_change(PolicyChange::RevokedUnlimited(OriginId::from("http://u.com/")))
        .await;
    assert_eq!(
        harness.manager.get_global_usage(StorageKind::Temporary).await,
        Ok(GlobalUsage { limited: 30, unlimited: 0 })
    );
}

#[tokio::test]
async fn test_eviction_clears_origins_under_pressure() {
    let client = temporary_client(&[
        ("http://a.com/", 10),
        ("http://b.com/", 20),
        ("http://c.com/", 30),
    ]);
    let harness = Harness::new(vec![client.clone()]);
    harness.set_free_space(0);

    for origin in ["http://a.com/", "http://b.com/", "http://c.com/"] {
        harness
            .manager
            .notify_storage_accessed(ClientId::FileSystem, &OriginId::from(origin), StorageKind::Temporary)
            .await;
        sleep(Duration::from_millis(3)).await;
    }

    let stats = harness.manager.run_eviction_round().await;
    assert_eq!(stats, EvictionRoundStats { evicted: 3, errors: 0 });
    assert_eq!(client.usage_of("http://a.com/", StorageKind::Temporary), 0);
    assert_eq!(client.usage_of("http://c.com/", StorageKind::Temporary), 0);
    assert!(harness
        .manager
        .dump_origin_info_table()
        .await
        .expect("dump")
        .is_empty());
}

#[tokio::test]
async fn test_no_eviction_without_pressure() {
    let client = temporary_client(&[("http://a.com/", 10)]);
    let harness = Harness::new(vec![client.clone()]);

    let stats = harness.manager.run_eviction_round().await;
    assert_eq!(stats, EvictionRoundStats::default());
    assert_eq!(client.usage_of("http://a.com/", StorageKind::Temporary), 10);
}

#[tokio::test]
async fn test_eviction_failures_blacklist_the_origin() {
    let client = temporary_client(&[("http://a.com/", 10), ("http://b.com/", 20)]);
    client.fail_deletions_for("http://a.com/");
    let harness = Harness::new(vec![client.clone()]);
    harness.set_free_space(0);

    for origin in ["http://a.com/", "http://b.com/"] {
        harness
            .manager
            .notify_storage_accessed(ClientId::FileSystem, &OriginId::from(origin), StorageKind::Temporary)
            .await;
        sleep(Duration::from_millis(3)).await;
    }

    // The failing origin is retried until it crosses the blacklist
    // threshold, then the round moves on and clears the healthy one.
    let stats = harness.manager.run_eviction_round().await;
    assert_eq!(stats, EvictionRoundStats { evicted: 1, errors: 4 });
    assert_eq!(client.usage_of("http://a.com/", StorageKind::Temporary), 10);
    assert_eq!(client.usage_of("http://b.com/", StorageKind::Temporary), 0);

    // Blacklisted origins are never picked again, even once deletable.
    client.allow_deletions_for("http://a.com/");
    let stats = harness.manager.run_eviction_round().await;
    assert_eq!(stats, EvictionRoundStats::default());
    assert_eq!(client.usage_of("http://a.com/", StorageKind::Temporary), 10);
}

#[tokio::test]
async fn test_in_use_origins_are_not_evicted() {
    let client = temporary_client(&[("http://a.com/", 10), ("http://b.com/", 20)]);
    let harness = Harness::new(vec![client.clone()]);
    harness.set_free_space(0);
    let pinned = OriginId::from("http://a.com/");

    harness.manager.notify_origin_in_use(&pinned);
    assert!(harness.manager.is_origin_in_use(&pinned));

    let stats = harness.manager.run_eviction_round().await;
    assert_eq!(stats, EvictionRoundStats { evicted: 1, errors: 0 });
    assert_eq!(client.usage_of("http://a.com/", StorageKind::Temporary), 10);
    assert_eq!(client.usage_of("http://b.com/", StorageKind::Temporary), 0);

    harness.manager.notify_origin_no_longer_in_use(&pinned);
    assert!(!harness.manager.is_origin_in_use(&pinned));
    let stats = harness.manager.run_eviction_round().await;
    assert_eq!(stats, EvictionRoundStats { evicted: 1, errors: 0 });
}

#[tokio::test]
async fn test_eviction_usage_info_and_direct_eviction() {
    let client = temporary_client(&[("http://a.com/", 30)]);
    let harness = Harness::new(vec![client.clone()]);
    harness
        .manager
        .set_temporary_global_override_quota(100)
        .await
        .expect("override");

    harness.set_free_space(2000);
    let info = harness
        .manager
        .get_usage_and_quota_for_eviction()
        .await
        .expect("eviction info");
    assert_eq!(info.limited_usage, 30);
    assert_eq!(info.quota, 100);
    assert_eq!(info.available_space, 2000);
    assert_eq!(
        info.min_available_space,
        DEFAULT_MIN_AVAILABLE_DISK_SPACE_TO_START_EVICTION
    );
    // 30 bytes is under the 70 % mark, but 2000 bytes free is below the
    // desired floor.
    assert!(info.under_pressure());

    harness.set_free_space(2 * GIB);
    let info = harness
        .manager
        .get_usage_and_quota_for_eviction()
        .await
        .expect("eviction info");
    assert!(!info.under_pressure());

    // Embedder-triggered eviction works without the driver loop.
    harness
        .manager
        .evict_origin_data(&OriginId::from("http://a.com/"), StorageKind::Temporary)
        .await
        .expect("evict");
    assert_eq!(client.usage_of("http://a.com/", StorageKind::Temporary), 0);
    assert!(harness
        .manager
        .dump_origin_info_table()
        .await
        .expect("dump")
        .is_empty());
}

#[tokio::test]
async fn test_origins_modified_since() {
    let client = temporary_client(&[("http://a.com/", 10), ("http://b.com/", 20)]);
    let harness = Harness::new(vec![client]);
    let origin = OriginId::from("http://a.com/");

    harness
        .manager
        .notify_storage_modified(ClientId::FileSystem, &origin, StorageKind::Temporary, 5)
        .await;

    let recent = harness
        .manager
        .get_origins_modified_since(StorageKind::Temporary, Utc::now() - chrono::Duration::hours(1))
        .await
        .expect("modified since");
    assert!(recent.contains(&origin));
    assert_eq!(recent.len(), 1);

    let future = harness
        .manager
        .get_origins_modified_since(StorageKind::Temporary, Utc::now() + chrono::Duration::hours(1))
        .await
        .expect("modified since");
    assert!(future.is_empty());
}

#[tokio::test]
async fn test_usage_report_and_access_counters() {
    let client = MockStorageClient::new(
        ClientId::FileSystem,
        &[StorageKind::Temporary, StorageKind::Persistent],
    );
    client.set_usage("http://foo.com/", StorageKind::Temporary, 10);
    client.set_usage("http://bar.com/", StorageKind::Persistent, 7);
    let harness = Harness::new(vec![client]);
    let origin = OriginId::from("http://foo.com/");

    let report = harness.manager.get_usage_info().await.expect("report");
    let temp = report
        .iter()
        .find(|info| info.kind == StorageKind::Temporary && info.host == "foo.com")
        .expect("temporary entry");
    assert_eq!(temp.usage, 10);
    let persistent = report
        .iter()
        .find(|info| info.kind == StorageKind::Persistent && info.host == "bar.com")
        .expect("persistent entry");
    assert_eq!(persistent.usage, 7);

    harness
        .manager
        .notify_storage_accessed(ClientId::FileSystem, &origin, StorageKind::Temporary)
        .await;
    harness
        .manager
        .notify_storage_accessed(ClientId::FileSystem, &origin, StorageKind::Temporary)
        .await;
    let rows = harness.manager.dump_origin_info_table().await.expect("dump");
    let row = rows.iter().find(|row| row.origin == origin).expect("row");
    assert_eq!(row.used_count, 2);
}

#[tokio::test]
async fn test_cached_origins_are_reported() {
    let client = temporary_client(&[("http://a.com/", 1), ("http://b.com/", 2)]);
    let harness = Harness::new(vec![client]);

    harness
        .manager
        .get_global_usage(StorageKind::Temporary)
        .await
        .expect("prime caches");
    let cached = harness
        .manager
        .get_cached_origins(StorageKind::Temporary)
        .await
        .expect("cached origins");
    assert_eq!(cached.len(), 2);
    assert!(cached.contains(&OriginId::from("http://a.com/")));
}

#[tokio::test]
async fn test_cache_opt_out_reads_backend_live() {
    let client = temporary_client(&[("http://foo.com/", 10)]);
    let harness = Harness::new(vec![client.clone()]);
    let origin = OriginId::from("http://foo.com/");

    assert_eq!(
        harness
            .manager
            .get_host_usage("foo.com", StorageKind::Temporary)
            .await,
        Ok(10)
    );

    // Grow behind the cache's back; the cached total is stale until the
    // origin opts out of caching.
    client.set_usage("http://foo.com/", StorageKind::Temporary, 25);
    assert_eq!(
        harness
            .manager
            .get_host_usage("foo.com", StorageKind::Temporary)
            .await,
        Ok(10)
    );
    harness
        .manager
        .set_usage_cache_enabled(ClientId::FileSystem, &origin, StorageKind::Temporary, false)
        .await;
    assert_eq!(
        harness
            .manager
            .get_host_usage("foo.com", StorageKind::Temporary)
            .await,
        Ok(25)
    );
}

#[tokio::test]
async fn test_empty_host_deletion_is_a_noop() {
    let client = temporary_client(&[("http://foo.com/", 10)]);
    let harness = Harness::new(vec![client.clone()]);
    harness
        .manager
        .delete_host_data("", StorageKind::Temporary, ClientMask::ALL)
        .await
        .expect("empty host deletion");
    assert_eq!(client.usage_of("http://foo.com/", StorageKind::Temporary), 10);
}

#[tokio::test]
async fn test_host_deletion_covers_all_host_origins() {
    let client = temporary_client(&[
        ("http://foo.com/", 10),
        ("https://foo.com/", 20),
        ("http://bar.com/", 7),
    ]);
    let harness = Harness::new(vec![client.clone()]);

    harness
        .manager
        .delete_host_data("foo.com", StorageKind::Temporary, ClientMask::ALL)
        .await
        .expect("host deletion");
    assert_eq!(client.usage_of("http://foo.com/", StorageKind::Temporary), 0);
    assert_eq!(client.usage_of("https://foo.com/", StorageKind::Temporary), 0);
    assert_eq!(client.usage_of("http://bar.com/", StorageKind::Temporary), 7);
}

#[tokio::test]
async fn test_observers_receive_rate_limited_events() {
    let client = temporary_client(&[("http://foo.com/", 10)]);
    let harness = Harness::new(vec![client]);
    let origin = OriginId::from("http://foo.com/");
    harness
        .manager
        .set_temporary_global_override_quota(1000)
        .await
        .expect("override");

    let mut rx = harness
        .manager
        .register_observer(StorageObserverParams {
            filter: StorageObserverFilter {
                kind: StorageKind::Temporary,
                origin: origin.clone(),
            },
            rate: Duration::ZERO,
            dispatch_initial: true,
        })
        .await;

    let event = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("initial event in time")
        .expect("channel open");
    assert_eq!(event.usage, 10);
    assert_eq!(event.quota, 200);

    harness
        .manager
        .notify_storage_modified(ClientId::FileSystem, &origin, StorageKind::Temporary, 5)
        .await;
    let event = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("change event in time")
        .expect("channel open");
    assert_eq!(event.usage, 15);
    assert_eq!(event.quota, 200);
}

/// Touches the target origin from inside the LRU lookup itself: the
/// eviction selector is the only caller of `is_protected`, so the touch is
/// guaranteed to land while the lookup is outstanding — the same
/// interleaving as a user access racing the lookup.
struct TouchDuringLookup {
    target: OriginId,
    proxy: Mutex<Option<QuotaManagerProxy>>,
    fired: AtomicBool,
}

impl StoragePolicy for TouchDuringLookup {
    fn is_unlimited(&self, _origin: &OriginId) -> bool {
        false
    }

    fn is_protected(&self, origin: &OriginId) -> bool {
        if *origin == self.target && !self.fired.swap(true, Ordering::SeqCst) {
            if let Some(proxy) = self.proxy.lock().expect("lock").clone() {
                let _ = proxy.notify_origin_in_use(&self.target);
                let _ = proxy.notify_origin_no_longer_in_use(&self.target);
            }
        }
        false
    }

    fn can_query_disk_size(&self, _origin: &OriginId) -> bool {
        false
    }
}

#[tokio::test]
async fn test_origin_touched_during_lru_lookup_survives_the_round() {
    let client = temporary_client(&[("http://a.com/", 10), ("http://b.com/", 20)]);
    let policy = Arc::new(TouchDuringLookup {
        target: OriginId::from("http://a.com/"),
        proxy: Mutex::new(None),
        fired: AtomicBool::new(false),
    });
    let data_dir = TempDir::new().expect("tempdir");
    let settings = QuotaSettings {
        data_dir: Some(data_dir.path().to_path_buf()),
        eviction_disabled: true,
        ..QuotaSettings::default()
    };
    let probe: DiskSpaceProbe = Arc::new(|_path| 0);
    let manager = QuotaManager::new(settings, policy.clone(), probe);
    manager.register_client(client.clone());
    client.attach_proxy(manager.proxy());
    *policy.proxy.lock().expect("lock") = Some(manager.proxy());

    for origin in ["http://a.com/", "http://b.com/"] {
        manager
            .notify_storage_accessed(ClientId::FileSystem, &OriginId::from(origin), StorageKind::Temporary)
            .await;
        sleep(Duration::from_millis(3)).await;
    }

    // The least recently used origin is touched mid-lookup: its answer is
    // stale, so the round discards it and gives up until the next cycle.
    let stats = manager.run_eviction_round().await;
    assert_eq!(stats, EvictionRoundStats::default());
    assert_eq!(client.usage_of("http://a.com/", StorageKind::Temporary), 10);
    assert_eq!(client.usage_of("http://b.com/", StorageKind::Temporary), 20);

    // Recency information has settled by the next round; eviction proceeds.
    let stats = manager.run_eviction_round().await;
    assert_eq!(stats, EvictionRoundStats { evicted: 2, errors: 0 });
}

#[tokio::test]
async fn test_proxy_calls_abort_after_manager_drop() {
    let client = temporary_client(&[("http://foo.com/", 10)]);
    let harness = Harness::new(vec![client]);
    let proxy = harness.manager.proxy();
    let origin = OriginId::from("http://foo.com/");

    assert_eq!(
        proxy.get_host_usage("foo.com", StorageKind::Temporary).await,
        Ok(10)
    );

    drop(harness);
    assert_eq!(
        proxy.get_host_usage("foo.com", StorageKind::Temporary).await,
        Err(QuotaError::Aborted)
    );
    assert_eq!(proxy.notify_origin_in_use(&origin), Err(QuotaError::Aborted));
    assert!(matches!(
        proxy
            .get_usage_and_quota_for_web_apps(&origin, StorageKind::Temporary)
            .await,
        Err(QuotaError::Aborted)
    ));
}
