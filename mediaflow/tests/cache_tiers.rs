//! Multi-tier cache behavior against a SQLite Tier 3.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use mediaflow::Result;
use mediaflow::cache::{CacheTier, MemoryLruTier, SqliteTier, TieredCache, TtlMapTier};
use mediaflow::database::{init_memory_pool, run_migrations};
use serde_json::{Value, json};

const TTL: Duration = Duration::from_secs(300);

struct Tiers {
    cache: TieredCache,
    l1: Arc<MemoryLruTier>,
    l2: Arc<TtlMapTier>,
    l3: Arc<SqliteTier>,
}

async fn tiers() -> Tiers {
    let pool = init_memory_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();

    let l1 = Arc::new(MemoryLruTier::with_capacity(64));
    let l2 = Arc::new(TtlMapTier::new());
    let l3 = Arc::new(SqliteTier::new(pool));
    let cache = TieredCache::new(l1.clone())
        .with_l2(l2.clone())
        .with_l3(l3.clone());
    Tiers { cache, l1, l2, l3 }
}

#[tokio::test]
async fn test_tier3_hit_is_promoted() {
    let tiers = tiers().await;
    let stored = json!({ "caption": "a dog runs on the beach" });
    tiers
        .l3
        .set("caption", "frame-42", &stored, TTL)
        .await
        .unwrap();

    let calls = AtomicU32::new(0);
    let compute = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<Value, mediaflow::Error>(json!("recomputed"))
    };

    let value: Value = tiers
        .cache
        .get_or_compute("caption", "frame-42", TTL, compute)
        .await
        .unwrap();
    assert_eq!(value, stored);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert_eq!(tiers.l1.get("caption", "frame-42").await.unwrap(), Some(stored.clone()));
    assert_eq!(tiers.l2.get("caption", "frame-42").await.unwrap(), Some(stored.clone()));

    let stats = tiers.cache.stats().await;
    assert_eq!(stats.tier(3).unwrap().hits, 1);
    assert_eq!(stats.tier(1).unwrap().misses, 1);
    assert_eq!(stats.computations, 0);
}

#[tokio::test]
async fn test_promotion_does_not_recompute() {
    let tiers = tiers().await;
    let calls = AtomicU32::new(0);

    let compute = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, mediaflow::Error>(vec!["intro".to_string(), "chorus".to_string()])
    };
    let first: Vec<String> = tiers
        .cache
        .get_or_compute("segments", "song-1", TTL, compute)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Only Tier 3 keeps the value now.
    tiers.l1.delete("segments", "song-1").await.unwrap();
    tiers.l2.delete("segments", "song-1").await.unwrap();

    for _ in 0..2 {
        let again: Vec<String> = tiers
            .cache
            .get_or_compute("segments", "song-1", TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            })
            .await
            .unwrap();
        assert_eq!(again, first);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(tiers.l1.get("segments", "song-1").await.unwrap().is_some());
    assert!(tiers.l2.get("segments", "song-1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_misses_share_one_computation() {
    let cache = Arc::new(
        TieredCache::new(Arc::new(MemoryLruTier::with_capacity(16)))
            .with_l3(Arc::new(TtlMapTier::new())),
    );
    let calls = Arc::new(AtomicU32::new(0));

    let lookups = (0..8).map(|_| {
        let cache = cache.clone();
        let calls = calls.clone();
        async move {
            cache
                .get_or_compute("transcript", "talk-5", TTL, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, mediaflow::Error>(json!({ "words": 1200 }))
                })
                .await
        }
    });
    let results: Vec<Result<Value>> = futures::future::join_all(lookups).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap(), json!({ "words": 1200 }));
    }
    assert_eq!(cache.in_flight_count(), 0);
}

#[tokio::test]
async fn test_invalidate_pattern_clears_every_tier() {
    let tiers = tiers().await;
    for key in ["video-1", "video-2", "audio-1"] {
        tiers.cache.set("caption", key, &json!(key), TTL).await.unwrap();
    }

    let removed = tiers
        .cache
        .invalidate_pattern("video-*", "caption")
        .await
        .unwrap();
    assert!(removed >= 2);

    for key in ["video-1", "video-2"] {
        assert!(tiers.cache.get::<Value>("caption", key, TTL).await.is_none());
        assert!(tiers.l3.get("caption", key).await.unwrap().is_none());
    }
    assert_eq!(
        tiers.cache.get::<Value>("caption", "audio-1", TTL).await,
        Some(json!("audio-1"))
    );
}

#[tokio::test]
async fn test_expired_rows_are_cleaned_up() {
    let tiers = tiers().await;
    tiers
        .l3
        .set("caption", "stale", &json!(1), Duration::ZERO)
        .await
        .unwrap();
    tiers
        .l3
        .set("caption", "fresh", &json!(2), TTL)
        .await
        .unwrap();

    assert_eq!(tiers.l3.cleanup_expired().await.unwrap(), 1);
    assert_eq!(tiers.l3.len().await, Some(1));
}
