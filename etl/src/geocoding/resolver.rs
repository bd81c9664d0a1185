use super::{GeocodeCache, Geocoder};
use crate::models::{Coordinates, PlaceKey, PlaceQuery};
use crate::utils::retry::retry_with_backoff;
use common::Error;
use common::config::GeocoderConfig;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub concurrency: usize,
    pub requests_per_second: f64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub call_timeout: Duration,
}

impl From<&GeocoderConfig> for ResolverOptions {
    fn from(config: &GeocoderConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            requests_per_second: config.requests_per_second,
            max_retries: config.max_retries,
            retry_base_delay_ms: config.retry_base_delay_ms,
            call_timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolutionReport {
    /// Records that needed coordinates.
    pub requested: usize,
    pub resolved: usize,
    pub not_found: usize,
    pub failed: usize,
    /// Distinct places answered from the cache.
    pub cache_hits: usize,
    /// Distinct places sent to the geocoder.
    pub lookups: usize,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Found(Coordinates),
    NotFound,
    Failed,
}

impl Outcome {
    fn coordinates(self) -> Option<Coordinates> {
        match self {
            Outcome::Found(coords) => Some(coords),
            Outcome::NotFound | Outcome::Failed => None,
        }
    }
}

/// Hands out evenly spaced request slots shared by every worker.
struct RateLimiter {
    period: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn per_second(requests_per_second: f64) -> Self {
        let secs = 1.0 / requests_per_second;
        let secs = if secs.is_finite() {
            secs.clamp(0.000_001, 3600.0)
        } else {
            1.0
        };
        Self {
            period: Duration::from_secs_f64(secs),
            next_slot: Mutex::new(None),
        }
    }

    async fn acquire(&self) {
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next_slot.map_or(now, |next| next.max(now));
            *next_slot = Some(slot + self.period);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// Resolves coordinates for restaurants through a [`Geocoder`].
///
/// Lookups run on a bounded pool of `concurrency` workers under a global request rate. Every
/// failure (transport error, bad status, malformed body, timeout) ends as "no coordinates" for
/// that record; nothing here aborts the run.
pub struct CoordinateResolver {
    geocoder: Arc<dyn Geocoder>,
    cache: Arc<GeocodeCache>,
    limiter: RateLimiter,
    options: ResolverOptions,
}

impl CoordinateResolver {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        cache: Arc<GeocodeCache>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            geocoder,
            cache,
            limiter: RateLimiter::per_second(options.requests_per_second),
            options,
        }
    }

    /// Resolves every query and returns the answers keyed by record id. Records sharing a
    /// place are looked up once.
    pub async fn resolve_all(
        &self,
        queries: Vec<PlaceQuery>,
    ) -> (HashMap<i64, Option<Coordinates>>, ResolutionReport) {
        let mut report = ResolutionReport {
            requested: queries.len(),
            ..Default::default()
        };

        let mut ids_by_place: HashMap<PlaceKey, Vec<i64>> = HashMap::new();
        let mut pending = Vec::new();
        for query in queries {
            let ids = ids_by_place.entry(query.key()).or_default();
            if ids.is_empty() {
                pending.push(query.clone());
            }
            ids.push(query.id);
        }

        let mut outcomes: Vec<(PlaceKey, Outcome)> = Vec::with_capacity(pending.len());
        let mut to_lookup = Vec::new();
        for query in pending {
            match self.cache.get(&query.key()) {
                Some(Some(coords)) => outcomes.push((query.key(), Outcome::Found(coords))),
                Some(None) => outcomes.push((query.key(), Outcome::NotFound)),
                None => to_lookup.push(query),
            }
        }
        report.cache_hits = outcomes.len();
        report.lookups = to_lookup.len();

        info!(
            records = report.requested,
            places = report.cache_hits + report.lookups,
            cache_hits = report.cache_hits,
            concurrency = self.options.concurrency,
            "Resolving missing coordinates"
        );

        let looked_up: Vec<(PlaceKey, Outcome)> = stream::iter(to_lookup)
            .map(|query| async move {
                let outcome = self.lookup(&query).await;
                (query.key(), outcome)
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        for (key, outcome) in &looked_up {
            self.remember(key.clone(), *outcome);
        }
        outcomes.extend(looked_up);

        let mut resolved = HashMap::with_capacity(report.requested);
        for (key, outcome) in outcomes {
            let ids = ids_by_place.remove(&key).unwrap_or_default();
            for id in ids {
                match outcome {
                    Outcome::Found(_) => report.resolved += 1,
                    Outcome::NotFound => report.not_found += 1,
                    Outcome::Failed => report.failed += 1,
                }
                resolved.insert(id, outcome.coordinates());
            }
        }

        if let Err(e) = self.cache.persist() {
            warn!(error = %e, "Failed to persist geocode cache");
        }

        info!(
            resolved = report.resolved,
            not_found = report.not_found,
            failed = report.failed,
            "Coordinate resolution finished"
        );

        (resolved, report)
    }

    async fn lookup(&self, query: &PlaceQuery) -> Outcome {
        let limiter = &self.limiter;
        let geocoder = &self.geocoder;
        let call_timeout = self.options.call_timeout;

        let result = retry_with_backoff(
            self.options.max_retries,
            self.options.retry_base_delay_ms,
            move || async move {
                limiter.acquire().await;
                match tokio::time::timeout(call_timeout, geocoder.lookup(query)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::GatewayTimeout),
                }
            },
        )
        .await;

        match result {
            Ok(Some(coords)) => Outcome::Found(coords),
            Ok(None) => {
                warn!(id = query.id, query = %query.text(), "No coordinates found");
                Outcome::NotFound
            }
            Err(e) => {
                warn!(id = query.id, query = %query.text(), error = %e, "Geocoding failed, treating as no match");
                Outcome::Failed
            }
        }
    }

    fn remember(&self, key: PlaceKey, outcome: Outcome) {
        match outcome {
            Outcome::Found(coords) => self.cache.insert(key, Some(coords)),
            Outcome::NotFound => self.cache.insert(key, None),
            Outcome::Failed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubGeocoder {
        known: HashMap<String, Coordinates>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl StubGeocoder {
        fn new() -> Self {
            let mut known = HashMap::new();
            known.insert(
                "Savoria, US, Dillon".to_string(),
                Coordinates::new(39.63026, -106.04335),
            );
            Self {
                known,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Geocoder for StubGeocoder {
        async fn lookup(&self, query: &PlaceQuery) -> common::Result<Option<Coordinates>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if query.name == "Broken" {
                return Err(Error::Geocoding("unexpected status: HTTP 400".to_string()));
            }
            Ok(self.known.get(&query.text()).copied())
        }
    }

    /// Fails with a transient error a fixed number of times, then answers.
    struct FlakyGeocoder {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for FlakyGeocoder {
        async fn lookup(&self, _query: &PlaceQuery) -> common::Result<Option<Coordinates>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::RateLimit);
            }
            Ok(Some(Coordinates::new(1.0, 2.0)))
        }
    }

    fn options() -> ResolverOptions {
        ResolverOptions {
            concurrency: 2,
            requests_per_second: 1000.0,
            max_retries: 2,
            retry_base_delay_ms: 1,
            call_timeout: Duration::from_millis(500),
        }
    }

    fn resolver(geocoder: Arc<dyn Geocoder>, cache: Arc<GeocodeCache>) -> CoordinateResolver {
        CoordinateResolver::new(geocoder, cache, options())
    }

    #[tokio::test]
    async fn test_resolve_known_place() {
        let resolver = resolver(
            Arc::new(StubGeocoder::new()),
            Arc::new(GeocodeCache::in_memory()),
        );

        let (resolved, report) = resolver
            .resolve_all(vec![PlaceQuery::new(1, "Savoria", "US", "Dillon")])
            .await;
        assert_eq!(resolved[&1], Some(Coordinates::new(39.63026, -106.04335)));
        assert_eq!(report.lookups, 1);
    }

    #[tokio::test]
    async fn test_errors_and_misses_become_no_match() {
        let resolver = resolver(
            Arc::new(StubGeocoder::new()),
            Arc::new(GeocodeCache::in_memory()),
        );

        let queries = vec![
            PlaceQuery::new(1, "Savoria", "US", "Dillon"),
            PlaceQuery::new(2, "Nowhere", "US", "Dillon"),
            PlaceQuery::new(3, "Broken", "US", "Dillon"),
        ];
        let (resolved, report) = resolver.resolve_all(queries).await;

        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[&1], Some(Coordinates::new(39.63026, -106.04335)));
        assert_eq!(resolved[&2], None);
        assert_eq!(resolved[&3], None);
        assert_eq!(report.resolved, 1);
        assert_eq!(report.not_found, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_duplicate_places_share_one_lookup() {
        let geocoder = Arc::new(StubGeocoder::new());
        let resolver = resolver(geocoder.clone(), Arc::new(GeocodeCache::in_memory()));

        let queries = vec![
            PlaceQuery::new(10, "Savoria", "US", "Dillon"),
            PlaceQuery::new(11, "Savoria", "US", "Dillon"),
        ];
        let (resolved, report) = resolver.resolve_all(queries).await;

        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolved[&10], resolved[&11]);
        assert_eq!(report.resolved, 2);
        assert_eq!(report.lookups, 1);
    }

    #[tokio::test]
    async fn test_cache_skips_the_geocoder() {
        let geocoder = Arc::new(StubGeocoder::new());
        let cache = Arc::new(GeocodeCache::in_memory());
        let resolver = resolver(geocoder.clone(), cache.clone());

        let query = PlaceQuery::new(1, "Savoria", "US", "Dillon");
        resolver.resolve_all(vec![query.clone()]).await;
        let (resolved, report) = resolver.resolve_all(vec![query]).await;

        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.cache_hits, 1);
        assert_eq!(report.lookups, 0);
        assert_eq!(resolved[&1], Some(Coordinates::new(39.63026, -106.04335)));
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = Arc::new(GeocodeCache::in_memory());
        let resolver = resolver(Arc::new(StubGeocoder::new()), cache.clone());

        resolver
            .resolve_all(vec![PlaceQuery::new(1, "Broken", "US", "Dillon")])
            .await;
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let geocoder = Arc::new(StubGeocoder::new().with_delay(Duration::from_millis(20)));
        let resolver = resolver(geocoder.clone(), Arc::new(GeocodeCache::in_memory()));

        let queries = (0..8)
            .map(|i| PlaceQuery::new(i, &format!("Place {}", i), "US", "Dillon"))
            .collect();
        let (resolved, _) = resolver.resolve_all(queries).await;

        assert_eq!(resolved.len(), 8);
        assert!(geocoder.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let geocoder = Arc::new(FlakyGeocoder {
            failures_left: AtomicUsize::new(2),
            calls: AtomicUsize::new(0),
        });
        let resolver = resolver(geocoder.clone(), Arc::new(GeocodeCache::in_memory()));

        let (resolved, report) = resolver
            .resolve_all(vec![PlaceQuery::new(1, "A", "B", "C")])
            .await;
        assert_eq!(resolved[&1], Some(Coordinates::new(1.0, 2.0)));
        assert_eq!(report.failed, 0);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_becomes_no_match() {
        let geocoder = Arc::new(StubGeocoder::new().with_delay(Duration::from_secs(5)));
        let resolver = CoordinateResolver::new(
            geocoder,
            Arc::new(GeocodeCache::in_memory()),
            ResolverOptions {
                max_retries: 0,
                call_timeout: Duration::from_millis(20),
                ..options()
            },
        );

        let (resolved, report) = resolver
            .resolve_all(vec![PlaceQuery::new(1, "Savoria", "US", "Dillon")])
            .await;
        assert_eq!(resolved[&1], None);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RateLimiter::per_second(50.0);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
