//! # Data Aggregator (Cache / Coalescer)
//!
//! Wraps a single [`DataProvider`] and serves the same surface, adding two
//! things in front of every upstream call:
//!
//! ## Core Functionality:
//! - **Single-flight**: concurrent identical requests share one upstream
//!   execution. Each cache key owns a lazily created async mutex; whoever
//!   holds it fetches, everyone queued behind it re-checks the cache first.
//! - **TTL cache**: a result younger than the TTL is returned without touching
//!   the provider. Failures are never cached, so the next caller retries.
//! - **Bulk snapshot coalescing**: when the provider declares
//!   `get_full_snapshot`, every `get_snapshot(codes)` is served from one shared
//!   whole-market entry and filtered in memory, so modules asking for
//!   different subsets cost one upstream request.
//!
//! Different keys never block each other. Flight locks are kept for the
//! lifetime of the aggregator; the key space is bounded by what modules ask for.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::HubResult;
use crate::providers::provider::{
    filter_quotes, Bar, DataDimension, DataProvider, Quote, SyncPolicy, Table, OP_GET_FULL_SNAPSHOT,
};

/// Default cache lifetime for wrapped providers.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Cache key shared by every snapshot request against a bulk-capable provider.
pub const FULL_SNAPSHOT_KEY: &str = "snapshot:full";

type CachedValue = Arc<dyn Any + Send + Sync>;

pub struct DataAggregator {
    name: String,
    provider: Arc<dyn DataProvider>,
    ttl: Duration,
    cache: RwLock<HashMap<String, (CachedValue, Instant)>>,
    flights: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DataAggregator {
    pub fn new(name: impl Into<String>, provider: Arc<dyn DataProvider>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            provider,
            ttl,
            cache: RwLock::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The wrapped provider, bypassing cache and coalescing.
    pub fn inner(&self) -> &Arc<dyn DataProvider> {
        &self.provider
    }

    /// Returns the fresh cached value for `key`, or runs `fetch` once for all
    /// concurrent callers of the same key.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, fetch: F) -> HubResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = HubResult<T>>,
    {
        self.get_or_fetch_with(key, false, fetch).await
    }

    /// Like [`DataAggregator::get_or_fetch`]; `force_refresh` skips both cache
    /// checks but still serializes on the key's flight lock.
    pub async fn get_or_fetch_with<T, F, Fut>(&self, key: &str, force_refresh: bool, fetch: F) -> HubResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = HubResult<T>>,
    {
        if !force_refresh {
            if let Some(hit) = self.fresh::<T>(key) {
                return Ok(hit);
            }
        }

        let flight = self.flight_lock(key);
        let _guard = flight.lock().await;

        if !force_refresh {
            if let Some(hit) = self.fresh::<T>(key) {
                log::debug!("[{}] cache hit for {} (waited)", self.name, key);
                return Ok(hit);
            }
        }

        log::debug!("[{}] executing fetch for {}", self.name, key);
        match fetch().await {
            Ok(value) => {
                let stored: CachedValue = Arc::new(value.clone());
                self.cache
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.to_string(), (stored, Instant::now()));
                Ok(value)
            }
            Err(e) => {
                log::error!("[{}] fetch for {} failed: {}", self.name, key, e);
                Err(e)
            }
        }
    }

    /// Drops every cached entry. Flight locks are kept.
    pub fn invalidate_all(&self) {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn fresh<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let (value, stored_at) = cache.get(key)?;
        if stored_at.elapsed() >= self.ttl {
            return None;
        }
        value.downcast_ref::<T>().cloned()
    }

    fn flight_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(flights.entry(key.to_string()).or_default())
    }

    fn supports_full_snapshot(&self) -> bool {
        self.provider.implements(OP_GET_FULL_SNAPSHOT)
    }
}

/// Sorted, de-duplicated code list; request order must not split the cache.
fn codes_key(codes: &[String]) -> String {
    let mut sorted: Vec<&str> = codes.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

/// `serde_json` maps are ordered by key, so serialization is canonical.
fn args_key(args: &Value) -> String {
    args.to_string()
}

#[async_trait]
impl DataProvider for DataAggregator {
    fn data_dimension(&self) -> DataDimension {
        self.provider.data_dimension()
    }

    fn sync_policy(&self) -> SyncPolicy {
        self.provider.sync_policy()
    }

    fn archive_filename_template(&self) -> String {
        self.provider.archive_filename_template()
    }

    fn get_archive_filename(&self, date: &str) -> String {
        self.provider.get_archive_filename(date)
    }

    fn operations(&self) -> Vec<String> {
        self.provider.operations()
    }

    fn implements(&self, operation: &str) -> bool {
        self.provider.implements(operation)
    }

    async fn get_price(&self, code: &str, date: Option<&str>) -> HubResult<Option<f64>> {
        let key = format!("price:{}:{}", code, date.unwrap_or("latest"));
        self.get_or_fetch(&key, || self.provider.get_price(code, date)).await
    }

    async fn get_history(&self, code: &str, start: &str, end: &str) -> HubResult<Vec<Bar>> {
        let key = format!("hist:{code}:{start}:{end}");
        self.get_or_fetch(&key, || self.provider.get_history(code, start, end)).await
    }

    async fn get_snapshot(&self, codes: &[String]) -> HubResult<Vec<Quote>> {
        if self.supports_full_snapshot() {
            let full = self.get_full_snapshot().await?;
            return Ok(filter_quotes(&full, codes));
        }
        let key = format!("snapshot:{}", codes_key(codes));
        self.get_or_fetch(&key, || self.provider.get_snapshot(codes)).await
    }

    async fn get_table(&self, name: &str, date: Option<&str>) -> HubResult<Table> {
        let key = format!("table:{}:{}", name, date.unwrap_or("latest"));
        self.get_or_fetch(&key, || self.provider.get_table(name, date)).await
    }

    async fn get_full_snapshot(&self) -> HubResult<Vec<Quote>> {
        self.get_or_fetch(FULL_SNAPSHOT_KEY, || self.provider.get_full_snapshot()).await
    }

    async fn call(&self, operation: &str, args: Value) -> HubResult<Value> {
        if operation == OP_GET_FULL_SNAPSHOT {
            return Ok(serde_json::to_value(self.get_full_snapshot().await?)?);
        }
        let key = format!("call:{}:{}", operation, args_key(&args));
        self.get_or_fetch(&key, || self.provider.call(operation, args)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HubError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Slow provider that counts upstream hits and can fail its first calls.
    struct CountingProvider {
        quotes: Vec<Quote>,
        bulk: bool,
        full_hits: AtomicUsize,
        snapshot_hits: AtomicUsize,
        failures_left: AtomicUsize,
    }

    impl CountingProvider {
        fn new(bulk: bool) -> Self {
            Self {
                quotes: vec![
                    Quote { code: "A".into(), price: 1.0, ..Default::default() },
                    Quote { code: "B".into(), price: 2.0, ..Default::default() },
                ],
                bulk,
                full_hits: AtomicUsize::new(0),
                snapshot_hits: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(0),
            }
        }

        fn failing_first(self, n: usize) -> Self {
            self.failures_left.store(n, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl DataProvider for CountingProvider {
        fn data_dimension(&self) -> DataDimension {
            DataDimension::Tick
        }

        fn sync_policy(&self) -> SyncPolicy {
            SyncPolicy::Realtime
        }

        fn operations(&self) -> Vec<String> {
            if self.bulk {
                vec![OP_GET_FULL_SNAPSHOT.to_string()]
            } else {
                Vec::new()
            }
        }

        async fn get_price(&self, _code: &str, _date: Option<&str>) -> HubResult<Option<f64>> {
            Ok(None)
        }

        async fn get_history(&self, _code: &str, _start: &str, _end: &str) -> HubResult<Vec<Bar>> {
            Ok(Vec::new())
        }

        async fn get_snapshot(&self, codes: &[String]) -> HubResult<Vec<Quote>> {
            self.snapshot_hits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(filter_quotes(&self.quotes, codes))
        }

        async fn get_table(&self, _name: &str, _date: Option<&str>) -> HubResult<Table> {
            Ok(Vec::new())
        }

        async fn get_full_snapshot(&self) -> HubResult<Vec<Quote>> {
            self.full_hits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(HubError::fetch(FULL_SNAPSHOT_KEY, "upstream timeout"));
            }
            Ok(self.quotes.clone())
        }
    }

    fn aggregator(provider: Arc<CountingProvider>, ttl: Duration) -> Arc<DataAggregator> {
        Arc::new(DataAggregator::new("test", provider, ttl))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_calls_fetch_once() {
        let agg = aggregator(Arc::new(CountingProvider::new(false)), DEFAULT_CACHE_TTL);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let agg = Arc::clone(&agg);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                agg.get_or_fetch("k", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, HubError>(42_u32)
                })
                .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_key_does_not_block_other_keys() {
        let agg = aggregator(Arc::new(CountingProvider::new(false)), DEFAULT_CACHE_TTL);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let slow = {
            let agg = Arc::clone(&agg);
            tokio::spawn(async move {
                agg.get_or_fetch("k1", || async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok::<_, HubError>(1_u32)
                })
                .await
            })
        };
        // k1's flight lock is held from here until its sleep ends
        started_rx.await.unwrap();

        let fast = tokio::time::timeout(
            Duration::from_millis(500),
            agg.get_or_fetch("k2", || async { Ok::<_, HubError>(2_u32) }),
        )
        .await
        .expect("k2 waited on k1's fetch");
        assert_eq!(fast.unwrap(), 2);
        assert!(!slow.is_finished());

        assert_eq!(slow.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let agg = aggregator(Arc::new(CountingProvider::new(false)), Duration::from_secs(1));
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fetch = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HubError>("v".to_string())
        };

        agg.get_or_fetch("k", fetch).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        agg.get_or_fetch("k", fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        agg.get_or_fetch("k", fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_fresh_entry() {
        let agg = aggregator(Arc::new(CountingProvider::new(false)), DEFAULT_CACHE_TTL);
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fetch = || async move { Ok::<_, HubError>(calls.fetch_add(1, Ordering::SeqCst)) };

        assert_eq!(agg.get_or_fetch("k", fetch).await.unwrap(), 0);
        assert_eq!(agg.get_or_fetch("k", fetch).await.unwrap(), 0);
        assert_eq!(agg.get_or_fetch_with("k", true, fetch).await.unwrap(), 1);
        assert_eq!(agg.get_or_fetch("k", fetch).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subset_snapshots_share_one_bulk_fetch() {
        let provider = Arc::new(CountingProvider::new(true));
        let agg = aggregator(Arc::clone(&provider), DEFAULT_CACHE_TTL);

        let a = {
            let agg = Arc::clone(&agg);
            tokio::spawn(async move { agg.get_snapshot(&["A.SH".to_string()]).await })
        };
        let b = {
            let agg = Arc::clone(&agg);
            tokio::spawn(async move { agg.get_snapshot(&["B".to_string()]).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(provider.full_hits.load(Ordering::SeqCst), 1);
        assert_eq!(provider.snapshot_hits.load(Ordering::SeqCst), 0);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].code, "A");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].code, "B");
    }

    #[tokio::test]
    async fn snapshots_without_bulk_are_keyed_by_sorted_codes() {
        let provider = Arc::new(CountingProvider::new(false));
        let agg = aggregator(Arc::clone(&provider), DEFAULT_CACHE_TTL);

        agg.get_snapshot(&["B".to_string(), "A".to_string()]).await.unwrap();
        agg.get_snapshot(&["A".to_string(), "B".to_string()]).await.unwrap();
        assert_eq!(provider.snapshot_hits.load(Ordering::SeqCst), 1);

        agg.get_snapshot(&["A".to_string()]).await.unwrap();
        assert_eq!(provider.snapshot_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let provider = Arc::new(CountingProvider::new(true).failing_first(1));
        let agg = aggregator(Arc::clone(&provider), DEFAULT_CACHE_TTL);

        let err = agg.get_snapshot(&["A".to_string()]).await.unwrap_err();
        assert!(matches!(err, HubError::Fetch { .. }));

        let ok = agg.get_snapshot(&["A".to_string()]).await.unwrap();
        assert_eq!(ok.len(), 1);
        assert_eq!(provider.full_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn codes_key_ignores_order_and_duplicates() {
        let a = codes_key(&["2".to_string(), "1".to_string(), "2".to_string()]);
        let b = codes_key(&["1".to_string(), "2".to_string()]);
        assert_eq!(a, b);
    }
}
