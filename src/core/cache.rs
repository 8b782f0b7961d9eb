use crate::core::config::CacheConfig;
use crate::core::errors::TransportError;
use crate::core::kernel::rest::HttpTransport;
use crate::core::types::{Account, CachedAccount};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Cache key of a credential pair
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_credentials(email: &str, password: &str) -> Self {
        Self(format!("{}-{}", email, password))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// the key embeds the password
impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CacheKey([REDACTED])")
    }
}

struct Slot {
    entry: CachedAccount,
    stamp: u64,
    stored_at: Instant,
}

/// LRU bookkeeping: `recency` maps a monotonically increasing stamp to its key
struct Lru {
    slots: HashMap<String, Slot>,
    recency: BTreeMap<u64, String>,
    next_stamp: u64,
    max_size: usize,
    max_age: Option<Duration>,
}

impl Lru {
    fn new(max_size: usize, max_age: Option<Duration>) -> Self {
        Self {
            slots: HashMap::new(),
            recency: BTreeMap::new(),
            next_stamp: 0,
            max_size,
            max_age,
        }
    }

    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    fn get(&mut self, key: &str) -> Option<CachedAccount> {
        let expired = {
            let slot = self.slots.get(key)?;
            self.max_age
                .is_some_and(|max_age| slot.stored_at.elapsed() > max_age)
        };
        if expired {
            debug!(email = ?self.slots.get(key).map(|s| &s.entry.email), "Cache entry expired");
            self.remove(key);
            return None;
        }

        let stamp = self.stamp();
        let slot = self.slots.get_mut(key)?;
        self.recency.remove(&slot.stamp);
        slot.stamp = stamp;
        self.recency.insert(stamp, key.to_string());
        Some(slot.entry.clone())
    }

    fn set(&mut self, key: String, entry: CachedAccount) {
        let stamp = self.stamp();
        let slot = Slot {
            entry,
            stamp,
            stored_at: Instant::now(),
        };
        if let Some(previous) = self.slots.insert(key.clone(), slot) {
            self.recency.remove(&previous.stamp);
        }
        self.recency.insert(stamp, key);

        while self.slots.len() > self.max_size {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            if let Some(evicted) = self.slots.remove(&oldest) {
                info!(email = %evicted.entry.email, "Evicted least recently used session");
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                self.recency.remove(&slot.stamp);
                true
            }
            None => false,
        }
    }

    /// Entries from least to most recently used
    fn snapshot(&self) -> Vec<(String, CachedAccount)> {
        self.recency
            .values()
            .filter_map(|key| {
                self.slots
                    .get(key)
                    .map(|slot| (key.clone(), slot.entry.clone()))
            })
            .collect()
    }
}

/// Persisted file contents, in file order
struct Persisted(Vec<(String, CachedAccount)>);

impl<'de> Deserialize<'de> for Persisted {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = Persisted;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of cache keys to cached accounts")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Persisted, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry()? {
                    entries.push(entry);
                }
                Ok(Persisted(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

enum Signal {
    Dirty,
    Shutdown(oneshot::Sender<Result<(), TransportError>>),
}

struct Shared {
    lru: Mutex<Lru>,
    path: PathBuf,
    flushes: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lru> {
        self.lru.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn flush(&self) -> Result<(), TransportError> {
        let snapshot = self.lock().snapshot();
        let count = snapshot.len();

        let mut body = Vec::new();
        let mut serializer = serde_json::Serializer::with_formatter(
            &mut body,
            serde_json::ser::PrettyFormatter::with_indent(b"  "),
        );
        serde::Serializer::collect_map(
            &mut serializer,
            snapshot.iter().map(|(key, entry)| (key, entry)),
        )
        .map_err(|e| TransportError::Cache(format!("Failed to serialize cache: {}", e)))?;

        write_atomically(&self.path, &body).await?;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        debug!(entries = count, "Cache persisted");
        Ok(())
    }
}

async fn write_atomically(path: &Path, body: &[u8]) -> Result<(), TransportError> {
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, body)
        .await
        .map_err(|e| TransportError::Cache(format!("Failed to write {}: {}", staging.display(), e)))?;
    tokio::fs::rename(&staging, path)
        .await
        .map_err(|e| TransportError::Cache(format!("Failed to replace {}: {}", path.display(), e)))
}

/// Bounded, age-aware session cache with debounced persistence
///
/// Reads and writes are served from memory. Every write restarts a quiet-period
/// timer; when it fires, the whole cache is rewritten to disk.
#[derive(Clone)]
pub struct SessionCache {
    shared: Arc<Shared>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl SessionCache {
    /// Load `config.path` if it exists and start the background flusher
    pub async fn open(config: CacheConfig) -> Result<Self, TransportError> {
        let mut lru = Lru::new(config.max_size, config.max_age);

        match tokio::fs::read_to_string(&config.path).await {
            Ok(raw) => match serde_json::from_str::<Persisted>(&raw) {
                Ok(Persisted(entries)) => {
                    let count = entries.len();
                    for (key, entry) in entries {
                        lru.set(key, entry);
                    }
                    info!(path = %config.path.display(), entries = count, "Loaded session cache");
                }
                Err(e) => warn!(
                    path = %config.path.display(),
                    "Ignoring unreadable session cache: {}", e
                ),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %config.path.display(), "No session cache yet");
            }
            Err(e) => {
                return Err(TransportError::Cache(format!(
                    "Failed to read {}: {}",
                    config.path.display(),
                    e
                )))
            }
        }

        let shared = Arc::new(Shared {
            lru: Mutex::new(lru),
            path: config.path,
            flushes: AtomicU64::new(0),
        });

        let (signals, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_flusher(shared.clone(), rx, config.debounce));

        Ok(Self { shared, signals })
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedAccount> {
        self.shared.lock().get(key.as_str())
    }

    pub fn set(&self, key: &CacheKey, entry: CachedAccount) {
        self.shared.lock().set(key.as_str().to_string(), entry);
        self.schedule_flush();
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        let removed = self.shared.lock().remove(key.as_str());
        if removed {
            self.schedule_flush();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shared.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of completed file rewrites
    pub fn flush_count(&self) -> u64 {
        self.shared.flushes.load(Ordering::SeqCst)
    }

    /// Install the cached account for `key` on `transport`, if there is one
    pub fn warm_start(&self, key: &CacheKey, transport: &HttpTransport) -> Option<Account> {
        let cached = self.get(key)?;
        transport.install_account(&cached.account);
        info!(nickname = ?cached.account.user.nickname, "Logged in from cache");
        Some(cached.account)
    }

    /// Flush once regardless of the timer, then stop the flusher
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.signals.send(Signal::Shutdown(done_tx)).is_err() {
            return self.shared.flush().await;
        }
        done_rx
            .await
            .map_err(|_| TransportError::Cache("Cache flusher stopped unexpectedly".to_string()))?
    }

    fn schedule_flush(&self) {
        if self.signals.send(Signal::Dirty).is_err() {
            warn!("Cache flusher stopped, change will not be persisted");
        }
    }
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("path", &self.shared.path)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

async fn run_flusher(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Signal>, debounce: Duration) {
    while let Some(signal) = rx.recv().await {
        if let Signal::Shutdown(done) = signal {
            let _ = done.send(shared.flush().await);
            return;
        }

        // trailing edge: every further write restarts the quiet period
        loop {
            match timeout(debounce, rx.recv()).await {
                Err(_) => {
                    if let Err(e) = shared.flush().await {
                        error!("Failed to persist session cache: {}", e);
                    }
                    break;
                }
                Ok(Some(Signal::Dirty)) => {}
                Ok(Some(Signal::Shutdown(done))) => {
                    let _ = done.send(shared.flush().await);
                    return;
                }
                Ok(None) => {
                    if let Err(e) = shared.flush().await {
                        error!("Failed to persist session cache: {}", e);
                    }
                    return;
                }
            }
        }
    }
}
