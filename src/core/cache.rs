//! Shared response cache with single-flight fetches.
//!
//! Stored entries and in-flight fetches live in two `scc` maps keyed by
//! [`CacheKey`]. The first caller for a missing key registers a shared future
//! and spawns the fetch; everyone arriving while it runs awaits that same
//! future. The spawned task stores the response (when cacheable) before it
//! unregisters itself, so a new caller always finds either the fetch or the
//! stored entry. Backend I/O never happens while a map bucket is locked.
//!
//! A key holds one entry per representation. Responses carrying `Vary` keep
//! the request values of the named headers and are only served to requests
//! with the same values.
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use scc::hash_map::Entry;
use serde::Serialize;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheStatus {
    #[serde(rename = "MISS")]
    Miss,
    #[serde(rename = "HIT")]
    Hit,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Miss => "MISS",
            CacheStatus::Hit => "HIT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &str, route: &str, backend_host: &str, path_and_query: &str) -> Self {
        Self(format!("{method} {route} {backend_host} {path_and_query}"))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully buffered backend response.
#[derive(Debug)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Time the backend took to produce this response.
    pub backend_response_time: Duration,
    received_at: Instant,
    /// `Age` reported by the backend when it was received.
    initial_age: u64,
    /// Remaining freshness at receipt; `None` when not cacheable.
    ttl: Option<Duration>,
    /// Request values of the headers named in `Vary`.
    selecting: Vec<(HeaderName, Vec<HeaderValue>)>,
}

impl CachedResponse {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        backend_response_time: Duration,
    ) -> Self {
        let initial_age = backend_age(&headers).unwrap_or(0);
        let ttl = freshness_lifetime(status, &headers, Utc::now())
            .and_then(|lifetime| lifetime.checked_sub(Duration::from_secs(initial_age)))
            .filter(|ttl| !ttl.is_zero());
        Self {
            status,
            headers,
            body,
            backend_response_time,
            received_at: Instant::now(),
            initial_age,
            ttl,
            selecting: Vec::new(),
        }
    }

    /// Tie the response to the request that produced it. A response to a
    /// request with `Authorization` is only shared when the backend marked it
    /// `public`, `s-maxage` or `must-revalidate`.
    pub fn for_request(mut self, request: &HeaderMap) -> Self {
        self.selecting = vary_names(&self.headers)
            .unwrap_or_default()
            .into_iter()
            .map(|name| {
                let values = request.get_all(&name).iter().cloned().collect();
                (name, values)
            })
            .collect();
        if request.contains_key(header::AUTHORIZATION) && !shareable_when_authorized(&self.headers) {
            self.ttl = None;
        }
        self
    }

    /// Whether this representation may answer `request`.
    pub fn matches(&self, request: &HeaderMap) -> bool {
        self.selecting
            .iter()
            .all(|(name, values)| request.get_all(name).iter().eq(values.iter()))
    }

    fn same_variant(&self, other: &CachedResponse) -> bool {
        self.selecting == other.selecting
    }

    pub fn is_cacheable(&self) -> bool {
        self.ttl.is_some()
    }

    /// Seconds since the response was produced, counting the backend's own `Age`.
    pub fn age(&self) -> u64 {
        self.initial_age + self.received_at.elapsed().as_secs()
    }

    /// `Age` header sent by the backend, if any.
    pub fn backend_age(&self) -> Option<u64> {
        backend_age(&self.headers)
    }

    pub fn is_fresh(&self) -> bool {
        self.ttl.is_some_and(|ttl| self.received_at.elapsed() < ttl)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    Timeout,
    Unavailable,
}

pub type FetchResult = Result<Arc<CachedResponse>, FetchFailure>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// How a caller obtained its response.
#[derive(Debug)]
pub enum Lookup {
    /// Fresh stored entry.
    Stored(Arc<CachedResponse>),
    /// This caller started the fetch.
    Fetched(FetchResult),
    /// This caller joined a fetch another request started.
    Joined(FetchResult),
}

/// Representations kept per key; the oldest is replaced beyond this.
const MAX_VARIANTS: usize = 8;

struct CacheInner {
    entries: scc::HashMap<CacheKey, Vec<Arc<CachedResponse>>>,
    in_flight: scc::HashMap<CacheKey, SharedFetch>,
    max_entries: usize,
}

#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.inner.entries.len())
            .field("in_flight", &self.inner.in_flight.len())
            .field("max_entries", &self.inner.max_entries)
            .finish()
    }
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: scc::HashMap::new(),
                in_flight: scc::HashMap::new(),
                max_entries,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Return a fresh entry matching `request`, join the running fetch for
    /// `key`, or start one with `fetch`.
    ///
    /// `fetch` runs in its own task, so it completes and populates the cache
    /// even when every caller waiting on it goes away. A caller whose headers
    /// select a different representation than the joined fetch produced
    /// fetches on its own.
    pub async fn get_or_fetch<F>(&self, key: CacheKey, request: &HeaderMap, fetch: F) -> Lookup
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult>,
    {
        if let Some(stored) = self.fresh_entry(&key, request).await {
            return Lookup::Stored(stored);
        }

        let (shared, tx) = match self.inner.in_flight.entry_async(key.clone()).await {
            Entry::Occupied(entry) => {
                let shared = entry.get().clone();
                drop(entry);
                let result = shared.await;
                let other_variant =
                    matches!(&result, Ok(response) if !response.matches(request));
                if !other_variant {
                    return Lookup::Joined(result);
                }
                let result = fetch().await;
                if let Ok(response) = &result {
                    if response.is_cacheable() {
                        self.inner.store(key, response.clone()).await;
                    }
                }
                return Lookup::Fetched(result);
            }
            Entry::Vacant(entry) => {
                // A fetch that finished between the lookup above and taking
                // this bucket has already stored its response.
                if let Some(stored) = self.fresh_entry(&key, request).await {
                    return Lookup::Stored(stored);
                }
                let (tx, rx) = oneshot::channel();
                let shared = async move { rx.await.unwrap_or(Err(FetchFailure::Unavailable)) }
                    .boxed()
                    .shared();
                entry.insert_entry(shared.clone());
                (shared, tx)
            }
        };

        let inner = self.inner.clone();
        let future = fetch();
        tokio::spawn(async move {
            let result = future.await;
            if let Ok(response) = &result {
                if response.is_cacheable() {
                    inner.store(key.clone(), response.clone()).await;
                }
            }
            inner.in_flight.remove_async(&key).await;
            let _ = tx.send(result);
        });

        Lookup::Fetched(shared.await)
    }

    async fn fresh_entry(
        &self,
        key: &CacheKey,
        request: &HeaderMap,
    ) -> Option<Arc<CachedResponse>> {
        let variants = self
            .inner
            .entries
            .read_async(key, |_, variants| variants.clone())
            .await?;
        if let Some(found) = variants
            .iter()
            .find(|variant| variant.is_fresh() && variant.matches(request))
        {
            return Some(found.clone());
        }
        if variants.iter().all(|variant| !variant.is_fresh()) {
            self.inner
                .entries
                .remove_if_async(key, |current| current.iter().all(|variant| !variant.is_fresh()))
                .await;
        }
        None
    }
}

impl CacheInner {
    async fn store(&self, key: CacheKey, response: Arc<CachedResponse>) {
        if self.entries.len() >= self.max_entries {
            self.entries
                .retain_async(|_, variants| variants.iter().any(|variant| variant.is_fresh()))
                .await;
            if self.entries.len() >= self.max_entries
                && self.entries.read_async(&key, |_, _| ()).await.is_none()
            {
                tracing::debug!(%key, "Response cache full, not storing");
                return;
            }
        }
        match self.entries.entry_async(key).await {
            Entry::Occupied(mut entry) => {
                let variants = entry.get_mut();
                variants.retain(|variant| variant.is_fresh() && !variant.same_variant(&response));
                if variants.len() >= MAX_VARIANTS {
                    variants.remove(0);
                }
                variants.push(response);
            }
            Entry::Vacant(entry) => {
                entry.insert_entry(vec![response]);
            }
        }
    }
}

const CACHEABLE_STATUSES: [u16; 5] = [200, 203, 300, 301, 410];

/// Freshness lifetime declared by the backend, or `None` if the response must not be stored.
pub fn freshness_lifetime(
    status: StatusCode,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if !CACHEABLE_STATUSES.contains(&status.as_u16()) || vary_names(headers).is_none() {
        return None;
    }

    let mut max_age = None;
    let mut s_maxage = None;
    for (name, arg) in cache_directives(headers) {
        match name.as_str() {
            "no-store" | "no-cache" | "private" => return None,
            "max-age" => max_age = arg.and_then(|a| a.parse::<u64>().ok()),
            "s-maxage" => s_maxage = arg.and_then(|a| a.parse::<u64>().ok()),
            _ => {}
        }
    }
    if let Some(seconds) = s_maxage.or(max_age) {
        return Some(Duration::from_secs(seconds));
    }

    let expires = http_date(headers.get(header::EXPIRES)?)?;
    let date = headers
        .get(header::DATE)
        .and_then(http_date)
        .unwrap_or(now);
    (expires - date).to_std().ok()
}

/// `Cache-Control` directives as lowercase name and unquoted argument.
fn cache_directives(headers: &HeaderMap) -> Vec<(String, Option<String>)> {
    let mut directives = Vec::new();
    for value in headers.get_all(header::CACHE_CONTROL) {
        let Ok(value) = value.to_str() else { continue };
        for directive in value.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"').to_string())),
                None => (directive, None),
            };
            directives.push((name.to_ascii_lowercase(), arg));
        }
    }
    directives
}

fn shareable_when_authorized(headers: &HeaderMap) -> bool {
    cache_directives(headers)
        .iter()
        .any(|(name, _)| matches!(name.as_str(), "public" | "s-maxage" | "must-revalidate"))
}

/// Header names listed in `Vary`; `None` for `Vary: *`.
fn vary_names(headers: &HeaderMap) -> Option<Vec<HeaderName>> {
    let mut names = Vec::new();
    for value in headers.get_all(header::VARY) {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name == "*" {
                return None;
            }
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    Some(names)
}

fn http_date(value: &http::HeaderValue) -> Option<DateTime<Utc>> {
    let value = value.to_str().ok()?;
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

fn backend_age(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::AGE)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
