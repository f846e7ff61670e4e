/// Backend service: relay reports in, route matrices out
use crate::api;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::matrix::CostMatrix;
use crate::optimize_log::{OptimizeLogEntry, OptimizeLogger};
use crate::optimizer::{optimize_matrix, OptimizeOptions};
use crate::route_matrix::RouteMatrix;
use crate::stats::{relays_csv, Aggregator, RelayInfo, RelayReport, RelayUpdate};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::RwLock;
use tokio::task::{self, JoinError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Current wall-clock time in unix seconds
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Read a relay directory (JSON array of [`RelayInfo`])
pub fn load_relay_directory(path: &Path) -> Result<Vec<RelayInfo>> {
    let content = std::fs::read_to_string(path)?;
    let relays: Vec<RelayInfo> = serde_json::from_str(&content)?;
    Ok(relays)
}

/// Owns the aggregator and the most recently published route matrix
#[derive(Clone)]
pub struct Backend {
    config: Config,
    aggregator: Aggregator,
    directory: Arc<Vec<RelayInfo>>,
    directory_index: Arc<HashMap<u64, usize>>,
    route_matrix: Arc<RwLock<Option<Arc<RouteMatrix>>>>,
    logger: OptimizeLogger,
    shutdown: Arc<RwLock<bool>>,
}

impl Backend {
    pub fn new(config: Config) -> Self {
        Self::with_directory(config, Vec::new())
    }

    /// Backend that knows the fleet's static relay metadata up front
    pub fn with_directory(config: Config, directory: Vec<RelayInfo>) -> Self {
        let directory_index = directory
            .iter()
            .enumerate()
            .map(|(index, info)| (info.id, index))
            .collect();

        Self {
            aggregator: Aggregator::new(config.stats.clone()),
            config,
            directory: Arc::new(directory),
            directory_index: Arc::new(directory_index),
            route_matrix: Arc::new(RwLock::new(None)),
            logger: OptimizeLogger::new(),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Start the backend and block until Ctrl+C / SIGTERM
    pub async fn start(&self) -> Result<()> {
        self.logger.init(self.config.log_dir.as_deref()).await?;

        let listener = TcpListener::bind(self.config.api_addr).await?;
        info!("API listening on {}", self.config.api_addr);
        info!(
            "Optimizing every {:?}, {} directory relays",
            self.config.optimize_interval,
            self.directory.len()
        );

        let api_handle = {
            let backend = self.clone();
            tokio::spawn(async move { api::serve(listener, backend).await })
        };

        let optimizer_handle = {
            let backend = self.clone();
            tokio::spawn(async move { backend.run_optimizer().await })
        };

        wait_for_shutdown().await;

        self.shutdown().await;
        info!("Shutdown signal received, stopping backend...");

        let (api_exit, optimizer_exit) = tokio::join!(api_handle, optimizer_handle);
        log_task_exit("API", api_exit);
        log_task_exit("Optimizer", optimizer_exit);

        info!("Backend stopped");
        Ok(())
    }

    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
    }

    pub async fn is_shutdown(&self) -> bool {
        *self.shutdown.read().await
    }

    /// Ingest a relay report, stamping it with the current time if it carries none
    pub async fn process_update(&self, mut update: RelayUpdate) {
        if update.timestamp == 0 {
            update.timestamp = unix_now();
        }
        self.aggregator.process_update(&update).await;
    }

    /// Latest published route matrix
    pub async fn route_matrix(&self) -> Option<Arc<RouteMatrix>> {
        self.route_matrix.read().await.clone()
    }

    /// Directory relays with their status, or every reporting relay when there is no directory
    pub async fn relay_reports(&self, now: u64) -> Vec<RelayReport> {
        if self.directory.is_empty() {
            self.aggregator.known_relays(now).await
        } else {
            self.aggregator.relay_statuses(&self.directory, now).await
        }
    }

    pub async fn relays_csv(&self, now: u64) -> String {
        relays_csv(&self.relay_reports(now).await)
    }

    /// Cost matrix over the currently online relays
    pub async fn cost_matrix(&self, now: u64) -> CostMatrix {
        let ids = self.aggregator.routable_relays(now).await;
        let stats = self.aggregator.config();
        self.aggregator
            .build_cost_matrix(&ids, stats.max_jitter, stats.max_packet_loss, now)
            .await
    }

    fn relay_info(&self, report: &RelayReport) -> RelayInfo {
        if let Some(index) = self.directory_index.get(&report.id) {
            return self.directory[*index].clone();
        }
        RelayInfo {
            id: report.id,
            name: report.name.clone(),
            address: report
                .address
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0))),
            datacenter_id: 0,
            latitude: 0.0,
            longitude: 0.0,
            dest: true,
        }
    }

    /// Run one stats -> optimize -> publish pass
    pub async fn optimize_once(&self, now: u64) -> Result<Arc<RouteMatrix>> {
        let start = Instant::now();

        let active = self.aggregator.active_relays(now).await;
        let relays: Vec<RelayInfo> = active.iter().map(|r| self.relay_info(r)).collect();
        let ids: Vec<u64> = relays.iter().map(|r| r.id).collect();

        let stats = self.aggregator.config();
        let costs = self
            .aggregator
            .build_cost_matrix(&ids, stats.max_jitter, stats.max_packet_loss, now)
            .await;
        let routable_pairs = costs.routable_pairs();

        let optimizer = self.config.optimizer.clone();
        let matrix = task::spawn_blocking(move || {
            let datacenters: Vec<u64> = relays.iter().map(|r| r.datacenter_id).collect();
            let dest_relays: Vec<bool> = relays.iter().map(|r| r.dest).collect();
            let options = OptimizeOptions::from_config(&optimizer, &datacenters, &dest_relays);
            let segments = match optimizer.segments {
                0 => relays.len(),
                n => n,
            };
            let entries = optimize_matrix(&costs, segments, &options);
            RouteMatrix::new(&relays, entries, now)
        })
        .await?;

        let matrix = Arc::new(matrix);
        *self.route_matrix.write().await = Some(matrix.clone());

        let elapsed = start.elapsed();
        let entry = OptimizeLogEntry::new(&matrix, routable_pairs, elapsed.as_millis() as u64);
        info!(
            "Published route matrix {}: {} relays, {} routes in {:?}",
            entry.pass_id,
            matrix.num_relays(),
            entry.analysis.total_routes,
            elapsed
        );
        self.logger.log(&entry).await;

        if let Some(path) = self.config.output_path.clone() {
            let snapshot = matrix.clone();
            task::spawn_blocking(move || snapshot.write_file(&path)).await??;
        }

        Ok(matrix)
    }

    /// Forget relays past retention, then optimize and publish
    pub async fn run_pass(&self, now: u64) -> Result<Arc<RouteMatrix>> {
        let evicted = self.aggregator.evict_silent(now).await;
        if !evicted.is_empty() {
            info!("Evicted {} silent relays", evicted.len());
            debug!("Evicted relay ids: {:016x?}", evicted);
        }
        self.optimize_once(now).await
    }

    async fn run_optimizer(&self) -> Result<()> {
        let mut ticker = interval(self.config.optimize_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.is_shutdown().await {
                break;
            }
            if let Err(e) = self.run_pass(unix_now()).await {
                error!("Optimize pass failed: {}", e);
            }
        }

        Ok(())
    }
}

/// Log how a backend task ended; returns whether it ended cleanly
fn log_task_exit(name: &str, exit: std::result::Result<Result<()>, JoinError>) -> bool {
    match exit {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("{} task failed: {}", name, e);
            false
        }
        Err(e) => {
            error!("{} task did not finish: {}", name, CoreError::from(e));
            false
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatsConfig;
    use crate::optimize_log::OPTIMIZE_LOG_FILE;
    use crate::stats::{relay_id, RelaySample, RelayStatus};

    fn report(name: &str, now: u64, links: &[(&str, f32)]) -> RelayUpdate {
        RelayUpdate {
            relay_id: relay_id(name),
            relay_name: name.to_string(),
            relay_address: "127.0.0.1:40000".parse().unwrap(),
            timestamp: now,
            version: "2.1.0".to_string(),
            sessions: 1,
            shutting_down: false,
            samples: links
                .iter()
                .map(|(dest, rtt)| RelaySample {
                    dest_relay_id: relay_id(dest),
                    rtt: *rtt,
                    jitter: 0.5,
                    packet_loss: 0.0,
                })
                .collect(),
        }
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            output_path: Some(dir.join("route_matrix.bin")),
            log_dir: Some(dir.to_path_buf()),
            stats: StatsConfig {
                history_size: 2,
                ..StatsConfig::default()
            },
            ..Config::default()
        }
    }

    async fn feed_triangle(backend: &Backend, now: u64) {
        for t in 0..2 {
            let ts = now - 1 + t;
            backend
                .process_update(report("la", ts, &[("chicago", 100.0), ("denver", 10.0)]))
                .await;
            backend
                .process_update(report("chicago", ts, &[("la", 100.0), ("denver", 10.0)]))
                .await;
            backend
                .process_update(report("denver", ts, &[("la", 10.0), ("chicago", 10.0)]))
                .await;
        }
    }

    #[tokio::test]
    async fn test_optimize_once_publishes_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new(test_config(dir.path()));
        backend.logger.init(Some(dir.path())).await.unwrap();
        assert!(backend.route_matrix().await.is_none());

        let now = 1_700_000_000;
        feed_triangle(&backend, now).await;

        let matrix = backend.optimize_once(now).await.unwrap();
        assert_eq!(matrix.num_relays(), 3);
        // Active relays are sorted by name: chicago, denver, la
        assert_eq!(matrix.relay_names, vec!["chicago", "denver", "la"]);
        let best = matrix.entry(2, 0).and_then(|e| e.best()).unwrap();
        assert_eq!(best.cost, 20);
        assert_eq!(best.relays, vec![2, 1, 0]);

        let published = backend.route_matrix().await.unwrap();
        assert_eq!(published.created_at, now);

        let on_disk = RouteMatrix::read_file(&dir.path().join("route_matrix.bin")).unwrap();
        assert_eq!(on_disk.route_entries, matrix.route_entries);

        let log = std::fs::read_to_string(dir.path().join(OPTIMIZE_LOG_FILE)).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_shutting_down_relay_is_left_out() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new(test_config(dir.path()));

        let now = 1_700_000_000;
        feed_triangle(&backend, now).await;
        let mut leaving = report("denver", now, &[("la", 10.0), ("chicago", 10.0)]);
        leaving.shutting_down = true;
        backend.process_update(leaving).await;

        let matrix = backend.optimize_once(now).await.unwrap();
        assert_eq!(matrix.relay_names, vec!["chicago", "la"]);
        assert_eq!(matrix.entry(1, 0).and_then(|e| e.best()).unwrap().cost, 100);

        let reports = backend.relay_reports(now).await;
        let denver = reports.iter().find(|r| r.name == "denver").unwrap();
        assert_eq!(denver.status, RelayStatus::ShuttingDown);
    }

    #[tokio::test]
    async fn test_directory_metadata_and_unseen_relays() {
        let dir = tempfile::tempdir().unwrap();
        let directory = vec![
            RelayInfo::new("la", "10.0.0.1:40000".parse().unwrap(), 7),
            RelayInfo::new("chicago", "10.0.0.2:40000".parse().unwrap(), 8),
            RelayInfo::new("tokyo", "10.0.0.3:40000".parse().unwrap(), 9),
        ];
        let path = dir.path().join("relays.json");
        std::fs::write(&path, serde_json::to_string(&directory).unwrap()).unwrap();
        let loaded = load_relay_directory(&path).unwrap();
        assert_eq!(loaded, directory);

        let backend = Backend::with_directory(test_config(dir.path()), loaded);
        let now = 1_700_000_000;
        for ts in [now - 1, now] {
            backend.process_update(report("la", ts, &[("chicago", 40.0)])).await;
            backend.process_update(report("chicago", ts, &[("la", 40.0)])).await;
        }

        let matrix = backend.optimize_once(now).await.unwrap();
        assert_eq!(matrix.relay_datacenter_ids, vec![8, 7]);
        assert_eq!(matrix.relay_addresses[1], "10.0.0.1:40000".parse::<SocketAddr>().unwrap());

        let reports = backend.relay_reports(now).await;
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[2].status, RelayStatus::Offline);
        assert_eq!(reports[2].sessions, 0);

        let csv = backend.relays_csv(now).await;
        assert_eq!(csv.lines().count(), 4);
        assert!(csv.contains("tokyo,10.0.0.3:40000"));
    }

    #[tokio::test]
    async fn test_run_pass_evicts_silent_relays() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new(test_config(dir.path()));

        let now = 1_700_000_000;
        feed_triangle(&backend, now).await;
        assert_eq!(backend.run_pass(now).await.unwrap().num_relays(), 3);

        let later = now + 3600;
        let matrix = backend.run_pass(later).await.unwrap();
        assert_eq!(matrix.num_relays(), 0);
        assert!(backend.relay_reports(later).await.is_empty());
        assert_eq!(backend.aggregator().pair_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_dest_directory_relays_only_route_as_waypoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut directory = vec![
            RelayInfo::new("la", "10.0.0.1:40000".parse().unwrap(), 1),
            RelayInfo::new("chicago", "10.0.0.2:40000".parse().unwrap(), 2),
            RelayInfo::new("denver", "10.0.0.3:40000".parse().unwrap(), 3),
        ];
        directory[0].dest = false;
        directory[2].dest = false;
        let backend = Backend::with_directory(test_config(dir.path()), directory);

        let now = 1_700_000_000;
        feed_triangle(&backend, now).await;
        let matrix = backend.optimize_once(now).await.unwrap();

        // Index order: chicago, denver, la
        assert_eq!(matrix.dest_relays, vec![true, false, false]);
        assert!(matrix.entry(2, 1).unwrap().routes.is_empty());
        assert_eq!(matrix.entry(2, 0).and_then(|e| e.best()).unwrap().relays, vec![2, 1, 0]);

        let on_disk = RouteMatrix::read_file(&dir.path().join("route_matrix.bin")).unwrap();
        assert_eq!(on_disk.dest_relays, matrix.dest_relays);
    }

    #[tokio::test]
    async fn test_task_exits_are_reported() {
        let clean = tokio::spawn(async { Ok::<(), CoreError>(()) }).await;
        assert!(log_task_exit("clean", clean));

        let failed = tokio::spawn(async {
            Err::<(), _>(CoreError::Protocol("listener closed".to_string()))
        })
        .await;
        assert!(!log_task_exit("failed", failed));

        let stuck = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok::<(), CoreError>(())
        });
        stuck.abort();
        assert!(!log_task_exit("aborted", stuck.await));
    }

    #[tokio::test]
    async fn test_missing_timestamp_is_stamped() {
        let backend = Backend::default();
        backend.process_update(report("la", 0, &[])).await;
        let reports = backend.relay_reports(unix_now()).await;
        assert_eq!(reports[0].status, RelayStatus::Online);
    }
}
