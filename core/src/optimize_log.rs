/// Optimize log - one JSON line per published route matrix
use crate::error::Result;
use crate::route_matrix::{RouteMatrix, RouteMatrixAnalysis};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

pub const OPTIMIZE_LOG_FILE: &str = "optimize_log.jsonl";

/// Summary of one optimize pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeLogEntry {
    /// RFC 3339 wall-clock time the pass finished
    pub timestamp: String,

    /// Unique label for the pass
    pub pass_id: String,

    pub relay_count: usize,

    /// Pairs with a usable direct link
    pub routable_pairs: usize,

    pub elapsed_ms: u64,

    pub analysis: RouteMatrixAnalysis,
}

impl OptimizeLogEntry {
    pub fn new(matrix: &RouteMatrix, routable_pairs: usize, elapsed_ms: u64) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            pass_id: Uuid::new_v4().to_string(),
            relay_count: matrix.num_relays(),
            routable_pairs,
            elapsed_ms,
            analysis: matrix.analyze(),
        }
    }
}

/// Appends [`OptimizeLogEntry`] lines to `<log_dir>/optimize_log.jsonl`
pub struct OptimizeLogger {
    log_file: Arc<RwLock<Option<PathBuf>>>,
}

impl OptimizeLogger {
    pub fn new() -> Self {
        Self {
            log_file: Arc::new(RwLock::new(None)),
        }
    }

    /// Point the logger at `log_dir`, or `logs/` when none is given
    pub async fn init(&self, log_dir: Option<&Path>) -> Result<()> {
        let dir = log_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("logs"));
        std::fs::create_dir_all(&dir)?;

        let mut file = self.log_file.write().await;
        *file = Some(dir.join(OPTIMIZE_LOG_FILE));
        Ok(())
    }

    pub async fn path(&self) -> Option<PathBuf> {
        self.log_file.read().await.clone()
    }

    /// Append one entry; does nothing before [`OptimizeLogger::init`]
    pub async fn log(&self, entry: &OptimizeLogEntry) {
        let path = match self.path().await {
            Some(path) => path,
            None => return,
        };

        if let Err(e) = append_line(&path, entry) {
            warn!("Failed to write optimize log {}: {}", path.display(), e);
        }
    }
}

fn append_line(path: &Path, entry: &OptimizeLogEntry) -> Result<()> {
    let json = serde_json::to_string(entry)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", json)?;
    file.flush()?;
    Ok(())
}

impl Default for OptimizeLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for OptimizeLogger {
    fn clone(&self) -> Self {
        Self {
            log_file: self.log_file.clone(),
        }
    }
}
