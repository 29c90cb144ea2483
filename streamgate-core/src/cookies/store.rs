//! Process-wide table of rotating per-service cookies.
//!
//! The table is loaded once from a JSON file (object of service name to
//! array of raw cookie strings), served with uniform random selection,
//! flushed back on a fixed interval while dirty, and replicated across a
//! clustered deployment through [`super::sync`]. Unrecognized or malformed
//! top-level entries are quarantined: never served, but re-emitted verbatim
//! on persistence so nothing is silently dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cookie::Cookie;
use super::refresh::{merge_refreshed_fields, protected_fields};
use super::sync::{ClusterBus, SyncMessage};
use super::CookieError;

/// The closed set of services cookies may be served for.
pub const RECOGNIZED_SERVICES: &[&str] = &[
    "instagram",
    "instagram_bearer",
    "reddit",
    "twitter",
    "youtube",
    "youtube_oauth",
    "vimeo_bearer",
];

/// One stored cookie entry, parsed lazily on first access.
#[derive(Debug)]
struct Slot {
    raw: String,
    parsed: Option<Cookie>,
}

impl Slot {
    fn new(raw: String) -> Self {
        Self { raw, parsed: None }
    }

    fn cookie(&mut self, service: &str, index: usize) -> Cookie {
        if self.parsed.is_none() {
            self.parsed = Some(Cookie::from_raw(&self.raw));
        }
        let mut cookie = self.parsed.clone().expect("just parsed");
        cookie.set_origin(service, index);
        cookie
    }

    fn serialized(&self) -> String {
        match &self.parsed {
            Some(cookie) => cookie.to_string(),
            None => self.raw.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct TableState {
    entries: HashMap<String, Vec<Slot>>,
    quarantine: serde_json::Map<String, serde_json::Value>,
    dirty: bool,
    /// Bumped on every mutation; lets flush detect a commit that landed
    /// after its snapshot was taken.
    generation: u64,
    flush_stopped: bool,
    flush_task_running: bool,
}

impl TableState {
    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }
}

/// Process-wide cookie table with cluster replication.
///
/// Reads take the lock briefly; writes mutate a single slot and flag the
/// table dirty. Concurrent updates to the same slot are last-writer-wins,
/// which is acceptable because credential refresh collisions are rare and
/// self-heal on the next upstream response.
pub struct CookieStore {
    state: RwLock<TableState>,
    bus: Option<Arc<dyn ClusterBus>>,
    primary: bool,
    flush_interval: Duration,
}

impl Default for CookieStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieStore {
    /// Creates a single-process store with no replication.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            bus: None,
            primary: true,
            flush_interval: Duration::from_secs(60),
        }
    }

    /// Creates a store attached to a cluster bus.
    ///
    /// Exactly one store per deployment should be the primary; it is the
    /// sole writer to the cookie file and relays point updates.
    pub fn with_cluster(bus: Arc<dyn ClusterBus>, primary: bool) -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            bus: Some(bus),
            primary,
            flush_interval: Duration::from_secs(60),
        }
    }

    /// Overrides the flush interval (default 60 s).
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Whether a service name is in the recognized set.
    pub fn is_recognized(service: &str) -> bool {
        RECOGNIZED_SERVICES.contains(&service)
    }

    /// Loads the cookie file, starts the flush timer, and broadcasts the
    /// resulting table to the cluster.
    ///
    /// Unrecognized keys and values that are not arrays of strings are
    /// quarantined with a warning. A heuristic scan over instagram entries
    /// warns about session fields that look copy/paste truncated without
    /// blocking the load.
    ///
    /// # Errors
    ///
    /// - `CookieError::Io` - The file could not be read
    /// - `CookieError::Json` - The file is not valid JSON
    /// - `CookieError::InvalidFile` - The top level is not an object
    pub fn load(self: &Arc<Self>, path: &Path) -> Result<(), CookieError> {
        let text = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        let object = match value {
            serde_json::Value::Object(object) => object,
            _ => {
                return Err(CookieError::InvalidFile {
                    reason: "top level is not a JSON object".to_string(),
                });
            }
        };

        let mut entries: HashMap<String, Vec<Slot>> = HashMap::new();
        let mut quarantine = serde_json::Map::new();

        for (key, value) in object {
            let raws = value.as_array().map(|array| {
                array
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<String>>>()
            });

            match raws {
                Some(Some(raws)) if Self::is_recognized(&key) => {
                    entries.insert(key, raws.into_iter().map(Slot::new).collect());
                }
                _ => {
                    warn!(key, "quarantining unrecognized or malformed cookie entry");
                    quarantine.insert(key, value);
                }
            }
        }

        Self::sanity_scan(&entries);

        let loaded: usize = entries.values().map(Vec::len).sum();
        info!(services = entries.len(), cookies = loaded, "cookie file loaded");

        {
            let mut state = self.state.write();
            state.entries = entries;
            state.quarantine = quarantine;
            state.dirty = false;
        }

        if self.primary {
            self.spawn_flush_task(path.to_path_buf());
            if let Some(bus) = &self.bus {
                bus.publish(SyncMessage::Snapshot {
                    cookies: self.snapshot(),
                });
            }
        }

        Ok(())
    }

    /// Warns about instagram session fields that look too short to be
    /// genuine credentials (usually copy/paste truncation).
    fn sanity_scan(entries: &HashMap<String, Vec<Slot>>) {
        for service in ["instagram", "instagram_bearer"] {
            let Some(slots) = entries.get(service) else {
                continue;
            };
            for (index, slot) in slots.iter().enumerate() {
                let cookie = Cookie::from_raw(&slot.raw);
                for (field, floor) in protected_fields(service) {
                    if let Some(value) = cookie.get(field) {
                        if value.len() < *floor {
                            warn!(
                                service,
                                index,
                                field,
                                length = value.len(),
                                "cookie field looks truncated; check for copy/paste loss"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Serves one cookie for a service, selected uniformly at random.
    ///
    /// Selection is memory-less: repeated calls may return the same entry.
    ///
    /// # Errors
    ///
    /// - `CookieError::UnknownService` - Name not in the recognized set
    /// - `CookieError::NoCookieAvailable` - Service has zero entries
    pub fn get(&self, service: &str) -> Result<Cookie, CookieError> {
        if !Self::is_recognized(service) {
            return Err(CookieError::UnknownService {
                service: service.to_string(),
            });
        }

        let mut state = self.state.write();
        let slots = state
            .entries
            .get_mut(service)
            .filter(|slots| !slots.is_empty())
            .ok_or_else(|| CookieError::NoCookieAvailable {
                service: service.to_string(),
            })?;

        let index = rand::rng().random_range(0..slots.len());
        Ok(slots[index].cookie(service, index))
    }

    /// Applies field mutations to a served cookie and commits the change.
    ///
    /// Returns whether any field actually changed. A changed cookie marks
    /// the store dirty and broadcasts a point update so the cluster
    /// converges. Cookies without a store origin are mutated locally only.
    ///
    /// # Errors
    ///
    /// - `CookieError::UnknownService` - Origin service not recognized;
    ///   the store is left unmodified
    pub fn update(
        &self,
        cookie: &mut Cookie,
        fields: &[(&str, &str)],
    ) -> Result<bool, CookieError> {
        if let Some(origin) = cookie.origin() {
            if !Self::is_recognized(&origin.service) {
                return Err(CookieError::UnknownService {
                    service: origin.service.clone(),
                });
            }
        }

        let changed = cookie.apply(fields.iter().copied());
        if changed {
            self.commit(cookie);
        }
        Ok(changed)
    }

    /// Folds upstream Set-Cookie header values back into a served cookie.
    ///
    /// Expired fields are unset unless protected for the service; protected
    /// fields with implausibly short fresh values are rejected rather than
    /// applied. Returns whether the cookie changed.
    pub fn apply_upstream_response(
        &self,
        cookie: &mut Cookie,
        set_cookie_values: &[String],
    ) -> Result<bool, CookieError> {
        let Some(origin) = cookie.origin().cloned() else {
            return Ok(false);
        };
        if !Self::is_recognized(&origin.service) {
            return Err(CookieError::UnknownService {
                service: origin.service,
            });
        }

        let outcome = merge_refreshed_fields(&origin.service, set_cookie_values);

        let mut changed = false;
        for name in &outcome.unset {
            changed |= cookie.unset(name);
        }
        changed |= cookie.apply(
            outcome
                .set
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        );

        if changed {
            self.commit(cookie);
        }
        Ok(changed)
    }

    /// Writes a mutated cookie back to its slot and replicates the change.
    fn commit(&self, cookie: &Cookie) {
        let Some(origin) = cookie.origin() else {
            return;
        };

        let serialized = cookie.to_string();
        {
            let mut state = self.state.write();
            if let Some(slots) = state.entries.get_mut(&origin.service) {
                if let Some(slot) = slots.get_mut(origin.index) {
                    slot.raw = serialized.clone();
                    slot.parsed = Some(cookie.clone());
                }
            }
            state.mark_dirty();
        }

        if let Some(bus) = &self.bus {
            bus.publish(SyncMessage::PointUpdate {
                service: origin.service.clone(),
                index: origin.index,
                cookie: serialized,
            });
        }
    }

    /// Applies a replication message received from the cluster.
    ///
    /// Returns whether the local table changed. The primary rebroadcasts
    /// changed point updates so every worker converges; the no-change guard
    /// is what terminates the relay.
    pub fn handle_message(&self, message: SyncMessage) -> bool {
        match message {
            SyncMessage::Snapshot { cookies } => {
                let mut state = self.state.write();
                state.entries = cookies
                    .into_iter()
                    .filter(|(service, _)| Self::is_recognized(service))
                    .map(|(service, raws)| {
                        (service, raws.into_iter().map(Slot::new).collect())
                    })
                    .collect();
                true
            }
            SyncMessage::PointUpdate {
                service,
                index,
                cookie,
            } => {
                let changed = {
                    let mut state = self.state.write();
                    match state.entries.get_mut(&service).and_then(|s| s.get_mut(index)) {
                        Some(slot) if slot.raw != cookie => {
                            slot.raw = cookie.clone();
                            slot.parsed = None;
                            true
                        }
                        Some(_) => false,
                        None => {
                            debug!(service, index, "point update for unknown slot ignored");
                            false
                        }
                    }
                };

                if changed {
                    if self.primary {
                        self.state.write().mark_dirty();
                        if let Some(bus) = &self.bus {
                            bus.publish(SyncMessage::PointUpdate {
                                service,
                                index,
                                cookie,
                            });
                        }
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Current recognized table as raw strings, for snapshot broadcast.
    pub fn snapshot(&self) -> std::collections::BTreeMap<String, Vec<String>> {
        let state = self.state.read();
        state
            .entries
            .iter()
            .map(|(service, slots)| {
                (
                    service.clone(),
                    slots.iter().map(Slot::serialized).collect(),
                )
            })
            .collect()
    }

    /// Serializes the recognized table merged with the quarantine back to
    /// disk, if dirty.
    ///
    /// # Errors
    ///
    /// - `CookieError::Io` - The file could not be written
    pub fn flush(&self, path: &Path) -> Result<(), CookieError> {
        let (serialized, generation) = {
            let state = self.state.read();
            if !state.dirty {
                return Ok(());
            }

            let mut object = serde_json::Map::new();
            for (service, slots) in &state.entries {
                object.insert(
                    service.clone(),
                    serde_json::Value::Array(
                        slots
                            .iter()
                            .map(|slot| serde_json::Value::String(slot.serialized()))
                            .collect(),
                    ),
                );
            }
            // Quarantined entries go back out byte-for-byte.
            for (key, value) in &state.quarantine {
                object.insert(key.clone(), value.clone());
            }
            (
                serde_json::to_string_pretty(&serde_json::Value::Object(object))?,
                state.generation,
            )
        };

        std::fs::write(path, serialized)?;

        // A commit may have landed while the file was being written; the
        // table stays dirty then so the next tick persists it.
        let mut state = self.state.write();
        if state.generation == generation {
            state.dirty = false;
        }
        debug!(path = %path.display(), "cookie file flushed");
        Ok(())
    }

    /// Starts the repeating flush task if not already running.
    ///
    /// A write failure stops the task permanently (fail-stop); in-memory
    /// serving continues unaffected until the process restarts.
    pub fn spawn_flush_task(self: &Arc<Self>, path: PathBuf) -> Option<JoinHandle<()>> {
        {
            let mut state = self.state.write();
            if state.flush_task_running || state.flush_stopped {
                return None;
            }
            state.flush_task_running = true;
        }

        let store = Arc::clone(self);
        let interval = self.flush_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(e) = store.flush(&path) {
                    error!(error = %e, "cookie flush failed; persistence disabled");
                    let mut state = store.state.write();
                    state.flush_stopped = true;
                    state.flush_task_running = false;
                    break;
                }
            }
        }))
    }

    /// Whether unpersisted mutations exist.
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    /// Whether the flush timer has fail-stopped.
    pub fn flush_stopped(&self) -> bool {
        self.state.read().flush_stopped
    }

    /// Entry counts per recognized service, for diagnostics.
    pub fn service_counts(&self) -> Vec<(String, usize)> {
        let state = self.state.read();
        let mut counts: Vec<(String, usize)> = state
            .entries
            .iter()
            .map(|(service, slots)| (service.clone(), slots.len()))
            .collect();
        counts.sort();
        counts
    }

    /// Keys preserved in the quarantine table.
    pub fn quarantined_keys(&self) -> Vec<String> {
        let state = self.state.read();
        state.quarantine.keys().cloned().collect()
    }
}
