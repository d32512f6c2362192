//! Relay-log ring buffer.
//!
//! Recent request records are appended to a bounded in-memory ring serving
//! three consumers: bulk persistence (when enabled), bounded volatile
//! retention (when not), and live subscribers with bounded non-blocking
//! queues. Log ids are 63-bit millisecond timestamps bumped by one on
//! collision, giving stable descending-id ordering across restarts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::error::Result;
use crate::services::settings::{self, SettingsService};
use crate::store::entities::RelayLog;
use crate::store::Store;

/// Flush threshold when persistence is enabled.
const RING_MAX: usize = 20;
/// Volatile retention bound when persistence is disabled.
const RING_MAX_NO_DB: usize = 100;
/// Per-subscriber queue depth; a full queue drops new entries.
const SUBSCRIBER_BUFFER: usize = 10;

pub struct RelayLogService {
    store: Store,
    settings: Arc<SettingsService>,

    ring: Mutex<Vec<RelayLog>>,
    /// Serializes DB flushes without blocking ring appends.
    flush_lock: tokio::sync::Mutex<()>,

    subscribers: Mutex<HashMap<u64, mpsc::Sender<RelayLog>>>,
    next_subscriber_id: AtomicU64,

    stream_tokens: Mutex<HashSet<String>>,

    last_id: Mutex<i64>,
}

impl RelayLogService {
    pub fn new(store: Store, settings: Arc<SettingsService>) -> Self {
        Self {
            store,
            settings,
            ring: Mutex::new(Vec::with_capacity(RING_MAX)),
            flush_lock: tokio::sync::Mutex::new(()),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            stream_tokens: Mutex::new(HashSet::new()),
            last_id: Mutex::new(0),
        }
    }

    /// Mint a monotonic millisecond id; a wall-clock collision (or
    /// regression) bumps the previous id by one.
    fn generate_id(&self) -> i64 {
        let mut last = self.last_id.lock().unwrap();
        let now = Utc::now().timestamp_millis();
        if now <= *last {
            *last += 1;
        } else {
            *last = now;
        }
        *last
    }

    fn keep_enabled(&self) -> bool {
        self.settings
            .get_bool(settings::RELAY_LOG_KEEP_ENABLED)
            .unwrap_or(true)
    }

    /// Append one record: assign the id, notify subscribers, and either
    /// flush (persistence enabled, ring full) or drop the oldest half
    /// (volatile mode, ring full).
    pub async fn add(&self, mut log: RelayLog) -> Result<()> {
        let enabled = self.keep_enabled();
        log.id = self.generate_id();

        self.notify_subscribers(&log);

        let should_flush = {
            let mut ring = self.ring.lock().unwrap();
            ring.push(log);
            let max = if enabled { RING_MAX } else { RING_MAX_NO_DB };
            if ring.len() >= max {
                if enabled {
                    true
                } else {
                    let keep = max / 2;
                    let drop_count = ring.len() - keep;
                    ring.drain(..drop_count);
                    false
                }
            } else {
                false
            }
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Persist the ring to the store and remove what was written.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<RelayLog> = {
            let ring = self.ring.lock().unwrap();
            if ring.is_empty() {
                return Ok(());
            }
            ring.clone()
        };

        self.store.insert_relay_logs(&batch).await?;

        let mut ring = self.ring.lock().unwrap();
        let flushed = batch.len().min(ring.len());
        ring.drain(..flushed);
        Ok(())
    }

    /// Periodic tick: flush + retention cleanup when persistence is on;
    /// otherwise trim the volatile ring.
    pub async fn periodic_flush(&self) -> Result<()> {
        debug!("relay log flush task started");
        if self.keep_enabled() {
            self.flush().await?;
            return self.cleanup().await;
        }

        let mut ring = self.ring.lock().unwrap();
        if ring.len() > RING_MAX_NO_DB {
            let keep = RING_MAX_NO_DB / 2;
            let drop_count = ring.len() - keep;
            ring.drain(..drop_count);
        }
        Ok(())
    }

    /// Delete persisted rows older than the retention period.
    pub async fn cleanup(&self) -> Result<()> {
        let keep_days = self
            .settings
            .get_int(settings::RELAY_LOG_KEEP_PERIOD)
            .unwrap_or(0);
        if keep_days <= 0 {
            return Ok(());
        }
        let cutoff = Utc::now().timestamp() - keep_days * 24 * 3600;
        let removed = self.store.delete_relay_logs_before(cutoff).await?;
        if removed > 0 {
            debug!("relay log cleanup removed {removed} rows");
        }
        Ok(())
    }

    /// Page through logs, newest first: the ring serves the head, the
    /// store (when persistence is enabled) the tail.
    pub async fn query(
        &self,
        time_range: Option<(i64, i64)>,
        page: i64,
        page_size: i64,
    ) -> Result<Vec<RelayLog>> {
        let enabled = self.keep_enabled();

        let mut cached: Vec<RelayLog> = {
            let ring = self.ring.lock().unwrap();
            ring.iter()
                .filter(|log| match time_range {
                    Some((start, end)) => log.time >= start && log.time <= end,
                    None => true,
                })
                .cloned()
                .collect()
        };
        cached.reverse();

        let cache_count = cached.len() as i64;
        let offset = (page - 1).max(0) * page_size;
        let mut result = Vec::new();

        if offset < cache_count {
            let end = (offset + page_size).min(cache_count);
            result.extend_from_slice(&cached[offset as usize..end as usize]);
        }

        if enabled {
            let remaining = page_size - result.len() as i64;
            if remaining > 0 {
                let db_offset = (offset - cache_count).max(0);
                let tail = self
                    .store
                    .list_relay_logs(time_range, db_offset, remaining)
                    .await?;
                result.extend(tail);
            }
        }

        Ok(result)
    }

    pub async fn clear(&self) -> Result<()> {
        self.ring.lock().unwrap().clear();
        self.store.clear_relay_logs().await
    }

    // ------------------------------------------------------------------
    // Live subscribers
    // ------------------------------------------------------------------

    /// Register a live subscriber with a bounded queue.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<RelayLog>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    fn notify_subscribers(&self, log: &RelayLog) {
        let subscribers = self.subscribers.lock().unwrap();
        for tx in subscribers.values() {
            // Non-blocking: a slow subscriber just misses this entry.
            let _ = tx.try_send(log.clone());
        }
    }

    // ------------------------------------------------------------------
    // One-shot stream tokens
    // ------------------------------------------------------------------

    /// Mint a short-lived token authorizing one live-stream connection.
    pub fn create_stream_token(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        self.stream_tokens.lock().unwrap().insert(token.clone());
        token
    }

    pub fn verify_stream_token(&self, token: &str) -> bool {
        self.stream_tokens.lock().unwrap().contains(token)
    }

    /// Delete a token after its stream connection is accepted.
    pub fn revoke_stream_token(&self, token: &str) {
        if !self.stream_tokens.lock().unwrap().remove(token) {
            warn!("revoking unknown stream token");
        }
    }
}
