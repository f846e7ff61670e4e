/// Pairwise relay stats aggregator
/// Smooths RTT, jitter and packet loss per ordered relay pair and builds cost matrices
use super::relay::{relays_csv, RelayInfo, RelayReport, RelaySample, RelayStatus, RelayUpdate};
use crate::config::StatsConfig;
use crate::matrix::{CostMatrix, UNROUTABLE};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Value that fills a poisoned ring; any mean touching it is unroutable
pub const INVALID_ROUTE_VALUE: f32 = 1_000_000_000.0;

/// Sliding window of samples for one (source, dest) pair
#[derive(Debug, Clone)]
pub struct DestEntry {
    last_update: Option<u64>,
    cursor: usize,
    history_rtt: Vec<f32>,
    history_jitter: Vec<f32>,
    history_packet_loss: Vec<f32>,
    pub rtt: f32,
    pub jitter: f32,
    pub packet_loss: f32,
}

impl DestEntry {
    fn new(history_size: usize) -> Self {
        let size = history_size.max(1);
        Self {
            last_update: None,
            cursor: 0,
            history_rtt: vec![INVALID_ROUTE_VALUE; size],
            history_jitter: vec![INVALID_ROUTE_VALUE; size],
            history_packet_loss: vec![INVALID_ROUTE_VALUE; size],
            rtt: INVALID_ROUTE_VALUE,
            jitter: INVALID_ROUTE_VALUE,
            packet_loss: INVALID_ROUTE_VALUE,
        }
    }

    fn poison(&mut self) {
        self.cursor = 0;
        self.history_rtt.fill(INVALID_ROUTE_VALUE);
        self.history_jitter.fill(INVALID_ROUTE_VALUE);
        self.history_packet_loss.fill(INVALID_ROUTE_VALUE);
    }

    fn is_fresh(&self, now: u64, stale_secs: u64) -> bool {
        self.last_update
            .map(|t| now.saturating_sub(t) <= stale_secs)
            .unwrap_or(false)
    }

    fn add_sample(&mut self, now: u64, sample: &RelaySample, stale_secs: u64) {
        // New pairs and pairs back from a reporting gap start poisoned
        if !self.is_fresh(now, stale_secs) {
            self.poison();
        }

        let slot = self.cursor;
        self.history_rtt[slot] = sample.rtt;
        self.history_jitter[slot] = sample.jitter;
        self.history_packet_loss[slot] = sample.packet_loss;
        self.cursor = (slot + 1) % self.history_rtt.len();

        self.rtt = history_mean(&self.history_rtt);
        self.jitter = history_mean(&self.history_jitter);
        self.packet_loss = history_mean(&self.history_packet_loss);
        self.last_update = Some(now);
    }
}

fn history_mean(history: &[f32]) -> f32 {
    let sum: f64 = history.iter().map(|v| f64::from(*v)).sum();
    (sum / history.len() as f64) as f32
}

#[derive(Debug, Clone)]
struct RelayMeta {
    name: String,
    address: SocketAddr,
    sessions: u32,
    version: String,
    shutting_down: bool,
    last_update: u64,
}

/// Aggregates relay reports into smoothed per-pair stats.
///
/// The pair map and the relay map each sit behind a coarse lock that is only
/// write-locked to insert a new key; every entry carries its own mutex.
pub struct Aggregator {
    config: StatsConfig,
    relays: Arc<RwLock<HashMap<u64, Arc<Mutex<RelayMeta>>>>>,
    pairs: Arc<RwLock<HashMap<(u64, u64), Arc<Mutex<DestEntry>>>>>,
}

impl Aggregator {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            config,
            relays: Arc::new(RwLock::new(HashMap::new())),
            pairs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Ingest one relay report
    pub async fn process_update(&self, update: &RelayUpdate) {
        let now = update.timestamp;

        let meta = self.relay_entry(update).await;
        {
            let mut meta = meta.lock().await;
            meta.name = update.relay_name.clone();
            meta.address = update.relay_address;
            meta.sessions = update.sessions;
            meta.version = update.version.clone();
            meta.shutting_down = update.shutting_down;
            meta.last_update = now;
        }

        let stale_secs = self.config.stale_timeout.as_secs();
        for sample in &update.samples {
            if sample.dest_relay_id == update.relay_id {
                continue;
            }
            let entry = self.pair_entry(update.relay_id, sample.dest_relay_id).await;
            entry.lock().await.add_sample(now, sample, stale_secs);
        }

        debug!(
            "Processed update from {} ({:016x}): {} samples",
            update.relay_name,
            update.relay_id,
            update.samples.len()
        );
    }

    async fn relay_entry(&self, update: &RelayUpdate) -> Arc<Mutex<RelayMeta>> {
        if let Some(meta) = self.relays.read().await.get(&update.relay_id) {
            return meta.clone();
        }
        let mut relays = self.relays.write().await;
        relays
            .entry(update.relay_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(RelayMeta {
                    name: update.relay_name.clone(),
                    address: update.relay_address,
                    sessions: 0,
                    version: String::new(),
                    shutting_down: false,
                    last_update: update.timestamp,
                }))
            })
            .clone()
    }

    async fn pair_entry(&self, source: u64, dest: u64) -> Arc<Mutex<DestEntry>> {
        if let Some(entry) = self.pairs.read().await.get(&(source, dest)) {
            return entry.clone();
        }
        let history_size = self.config.history_size;
        let mut pairs = self.pairs.write().await;
        pairs
            .entry((source, dest))
            .or_insert_with(|| Arc::new(Mutex::new(DestEntry::new(history_size))))
            .clone()
    }

    /// Smoothed (rtt, jitter, packet loss) for `source -> dest`, sentinel if missing or stale
    pub async fn get_sample(&self, source: u64, dest: u64, now: u64) -> (f32, f32, f32) {
        let entry = self.pairs.read().await.get(&(source, dest)).cloned();
        let stale_secs = self.config.stale_timeout.as_secs();
        match entry {
            Some(entry) => {
                let entry = entry.lock().await;
                if entry.is_fresh(now, stale_secs) {
                    (entry.rtt, entry.jitter, entry.packet_loss)
                } else {
                    invalid_sample()
                }
            }
            None => invalid_sample(),
        }
    }

    /// Snapshot of undirected costs for `relay_ids`
    pub async fn build_cost_matrix(
        &self,
        relay_ids: &[u64],
        max_jitter: f32,
        max_packet_loss: f32,
        now: u64,
    ) -> CostMatrix {
        let mut matrix = CostMatrix::new(relay_ids.to_vec());

        for i in 0..relay_ids.len() {
            for j in 0..i {
                let (source_rtt, source_jitter, source_loss) =
                    self.get_sample(relay_ids[i], relay_ids[j], now).await;
                let (dest_rtt, dest_jitter, dest_loss) =
                    self.get_sample(relay_ids[j], relay_ids[i], now).await;

                let rtt = source_rtt.max(dest_rtt);
                let routable = rtt < INVALID_ROUTE_VALUE
                    && source_jitter <= max_jitter
                    && dest_jitter <= max_jitter
                    && source_loss <= max_packet_loss
                    && dest_loss <= max_packet_loss;

                let cost = if routable {
                    rtt.ceil() as i32
                } else {
                    UNROUTABLE
                };
                matrix.set(i, j, cost);
            }
        }

        matrix
    }

    fn status_of(&self, meta: &RelayMeta, now: u64) -> RelayStatus {
        if meta.shutting_down {
            RelayStatus::ShuttingDown
        } else if now.saturating_sub(meta.last_update) > self.config.liveness_timeout.as_secs() {
            RelayStatus::Offline
        } else {
            RelayStatus::Online
        }
    }

    async fn report_for(&self, id: u64, meta: &Mutex<RelayMeta>, now: u64) -> RelayReport {
        let meta = meta.lock().await;
        RelayReport {
            id,
            name: meta.name.clone(),
            address: Some(meta.address),
            status: self.status_of(&meta, now),
            sessions: meta.sessions,
            version: meta.version.clone(),
            last_update: Some(meta.last_update),
        }
    }

    /// Every relay that has ever reported, sorted by name
    pub async fn known_relays(&self, now: u64) -> Vec<RelayReport> {
        let entries: Vec<(u64, Arc<Mutex<RelayMeta>>)> = {
            let relays = self.relays.read().await;
            relays.iter().map(|(id, meta)| (*id, meta.clone())).collect()
        };

        let mut reports = Vec::with_capacity(entries.len());
        for (id, meta) in &entries {
            reports.push(self.report_for(*id, meta, now).await);
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        reports
    }

    /// Online relays sorted by name; offline and shutting-down relays are excluded
    pub async fn active_relays(&self, now: u64) -> Vec<RelayReport> {
        self.known_relays(now)
            .await
            .into_iter()
            .filter(|r| r.status == RelayStatus::Online)
            .collect()
    }

    /// Status for each directory relay, in directory order
    pub async fn relay_statuses(&self, directory: &[RelayInfo], now: u64) -> Vec<RelayReport> {
        let mut reports = Vec::with_capacity(directory.len());
        for info in directory {
            let meta = self.relays.read().await.get(&info.id).cloned();
            let report = match meta {
                Some(meta) => self.report_for(info.id, &meta, now).await,
                None => RelayReport::unseen(info),
            };
            reports.push(report);
        }
        reports
    }

    /// Ids of online relays, in name order
    pub async fn routable_relays(&self, now: u64) -> Vec<u64> {
        self.active_relays(now)
            .await
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    /// CSV of every known relay with its status
    pub async fn relays_csv(&self, now: u64) -> String {
        relays_csv(&self.known_relays(now).await)
    }

    /// Number of (source, dest) pairs tracked
    pub async fn pair_count(&self) -> usize {
        self.pairs.read().await.len()
    }

    /// Forget a relay's metadata and every pair it is part of
    pub async fn remove_relay(&self, relay_id: u64) -> bool {
        let removed = self.relays.write().await.remove(&relay_id).is_some();
        self.pairs
            .write()
            .await
            .retain(|(source, dest), _| *source != relay_id && *dest != relay_id);
        removed
    }

    /// Drop relays silent for longer than the retention period, every pair
    /// naming them, and any pair not updated for that long.
    ///
    /// Entries locked by an in-flight update are kept. Returns the evicted relay ids.
    pub async fn evict_silent(&self, now: u64) -> Vec<u64> {
        let retention = self.config.relay_retention.as_secs();
        let expired = |last_update: u64| now.saturating_sub(last_update) > retention;

        let mut evicted = HashSet::new();
        self.relays
            .write()
            .await
            .retain(|id, meta| match meta.try_lock() {
                Ok(meta) if expired(meta.last_update) => {
                    evicted.insert(*id);
                    false
                }
                _ => true,
            });

        let mut pairs = self.pairs.write().await;
        let before = pairs.len();
        pairs.retain(|(source, dest), entry| {
            if evicted.contains(source) || evicted.contains(dest) {
                return false;
            }
            match entry.try_lock() {
                Ok(entry) => !entry.last_update.map_or(false, expired),
                Err(_) => true,
            }
        });

        if !evicted.is_empty() || pairs.len() != before {
            debug!(
                "Evicted {} relays and {} pairs",
                evicted.len(),
                before - pairs.len()
            );
        }

        let mut evicted: Vec<u64> = evicted.into_iter().collect();
        evicted.sort_unstable();
        evicted
    }
}

fn invalid_sample() -> (f32, f32, f32) {
    (INVALID_ROUTE_VALUE, INVALID_ROUTE_VALUE, INVALID_ROUTE_VALUE)
}

impl Clone for Aggregator {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            relays: self.relays.clone(),
            pairs: self.pairs.clone(),
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(StatsConfig::default())
    }
}
