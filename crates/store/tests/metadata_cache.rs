#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evex_core::{ExporterMetrics, MetadataError, MetadataSource, ObjectMetadata, ObjectRef};
use evex_store::ObjectMetadataCache;

/// Counts backend reads; names in `missing` answer not-found, `broken` answers an API error.
#[derive(Default)]
struct FakeSource {
    reads: AtomicUsize,
    delay: Duration,
    missing: HashSet<String>,
    broken: HashSet<String>,
}

#[async_trait::async_trait]
impl MetadataSource for FakeSource {
    async fn object_metadata(&self, r: &ObjectRef) -> Result<ObjectMetadata, MetadataError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.missing.contains(&r.name) {
            return Err(MetadataError::NotFound(r.name.clone()));
        }
        if self.broken.contains(&r.name) {
            return Err(MetadataError::Backend("apiserver unavailable".into()));
        }
        let mut meta = ObjectMetadata::default();
        meta.labels.insert("app".into(), r.name.clone());
        Ok(meta)
    }
}

fn pod(name: &str) -> ObjectRef {
    ObjectRef { api_version: "v1".into(), kind: "Pod".into(), namespace: Some("default".into()), name: name.into(), ..Default::default() }
}

fn cache(source: Arc<FakeSource>, cap: usize) -> (ObjectMetadataCache, Arc<ExporterMetrics>) {
    let metrics = Arc::new(ExporterMetrics::default());
    (ObjectMetadataCache::new(source, cap, Arc::clone(&metrics)), metrics)
}

#[tokio::test]
async fn second_lookup_is_served_from_memory() {
    let src = Arc::new(FakeSource::default());
    let (c, m) = cache(Arc::clone(&src), 16);

    let first = c.get_object_metadata(&pod("web-1")).await.unwrap();
    let second = c.get_object_metadata(&pod("web-1")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(src.reads.load(Ordering::SeqCst), 1);
    let s = m.snapshot();
    assert_eq!(s.cache_misses, 1);
    assert_eq!(s.cache_hits, 1);
}

#[tokio::test]
async fn uid_is_not_part_of_the_key() {
    let src = Arc::new(FakeSource::default());
    let (c, _) = cache(Arc::clone(&src), 16);
    let mut a = pod("web-1");
    a.uid = Some("uid-a".into());
    let mut b = pod("web-1");
    b.uid = Some("uid-b".into());
    c.get_object_metadata(&a).await.unwrap();
    c.get_object_metadata(&b).await.unwrap();
    assert_eq!(src.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn eviction_forces_fresh_read() {
    let src = Arc::new(FakeSource::default());
    let (c, m) = cache(Arc::clone(&src), 2);

    c.get_object_metadata(&pod("a")).await.unwrap();
    c.get_object_metadata(&pod("b")).await.unwrap();
    // touch a so b becomes least recently used
    c.get_object_metadata(&pod("a")).await.unwrap();
    c.get_object_metadata(&pod("c")).await.unwrap();
    assert_eq!(c.len(), 2);
    assert_eq!(c.evicted(), 1);
    assert_eq!(src.reads.load(Ordering::SeqCst), 3);

    c.get_object_metadata(&pod("a")).await.unwrap();
    assert_eq!(src.reads.load(Ordering::SeqCst), 3);
    c.get_object_metadata(&pod("b")).await.unwrap();
    assert_eq!(src.reads.load(Ordering::SeqCst), 4);
    assert_eq!(m.snapshot().cache_misses, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_share_one_read() {
    let src = Arc::new(FakeSource { delay: Duration::from_millis(50), ..Default::default() });
    let (c, m) = cache(Arc::clone(&src), 16);
    let c = Arc::new(c);

    let lookups = (0..16).map(|_| {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.get_object_metadata(&pod("burst")).await })
    });
    let results = futures::future::join_all(lookups).await;

    let first = results[0].as_ref().unwrap().as_ref().unwrap().clone();
    for r in results {
        assert_eq!(r.unwrap().unwrap(), first);
    }
    assert_eq!(src.reads.load(Ordering::SeqCst), 1);
    assert_eq!(c.inflight(), 0);
    let s = m.snapshot();
    assert_eq!(s.cache_misses, 1);
    assert_eq!(s.cache_hits, 15);
}

#[tokio::test]
async fn not_found_is_memoized() {
    let mut src = FakeSource::default();
    src.missing.insert("gone".into());
    let src = Arc::new(src);
    let (c, _) = cache(Arc::clone(&src), 16);

    for _ in 0..3 {
        let err = c.get_object_metadata(&pod("gone")).await.unwrap_err();
        assert!(err.is_not_found());
    }
    assert_eq!(src.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn backend_errors_are_not_memoized() {
    let mut src = FakeSource::default();
    src.broken.insert("flaky".into());
    let src = Arc::new(src);
    let (c, _) = cache(Arc::clone(&src), 16);

    let err = c.get_object_metadata(&pod("flaky")).await.unwrap_err();
    assert!(matches!(err, MetadataError::Backend(_)));
    c.get_object_metadata(&pod("flaky")).await.unwrap_err();
    assert_eq!(src.reads.load(Ordering::SeqCst), 2);
    assert!(c.is_empty());
}

#[tokio::test]
async fn zero_capacity_still_resolves() {
    let src = Arc::new(FakeSource::default());
    let (c, _) = cache(Arc::clone(&src), 0);
    let meta = c.get_object_metadata(&pod("x")).await.unwrap();
    assert_eq!(meta.labels.get("app").map(String::as_str), Some("x"));
    c.get_object_metadata(&pod("x")).await.unwrap();
    assert_eq!(src.reads.load(Ordering::SeqCst), 2);
    assert!(c.is_empty());
}

#[tokio::test]
async fn capacity_is_reported() {
    let src = Arc::new(FakeSource::default());
    assert_eq!(cache(Arc::clone(&src), 8).0.capacity(), 8);
    assert_eq!(cache(src, 0).0.capacity(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_read_releases_its_slot() {
    let src = Arc::new(FakeSource { delay: Duration::from_millis(300), ..Default::default() });
    let (c, m) = cache(Arc::clone(&src), 16);
    let c = Arc::new(c);

    let first = {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.get_object_metadata(&pod("slow")).await })
    };
    while src.reads.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());
    assert_eq!(c.inflight(), 0);

    c.get_object_metadata(&pod("slow")).await.unwrap();
    assert_eq!(src.reads.load(Ordering::SeqCst), 2);
    let s = m.snapshot();
    assert_eq!(s.cache_hits, 0);
    assert_eq!(s.cache_misses, 2);
    assert_eq!(c.inflight(), 0);
    assert_eq!(c.len(), 1);
}
