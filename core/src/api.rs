/// JSON-lines API for relays, the CLI and other clients
use crate::backend::{unix_now, Backend};
use crate::error::{CoreError, Result};
use crate::stats::RelayUpdate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{debug, error};

/// API request, one JSON object per line
#[derive(Debug, Deserialize)]
#[serde(tag = "command")]
enum ApiRequest {
    #[serde(rename = "relay_update")]
    RelayUpdate(RelayUpdate),
    #[serde(rename = "relays")]
    Relays,
    #[serde(rename = "relays_csv")]
    RelaysCsv,
    #[serde(rename = "analysis")]
    Analysis,
    #[serde(rename = "costs")]
    Costs,
    #[serde(rename = "status")]
    Status,
}

/// API response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(msg: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg),
        }
    }
}

/// Accept API clients on an already bound listener
pub async fn serve(listener: TcpListener, backend: Backend) -> Result<()> {
    loop {
        if backend.is_shutdown().await {
            break;
        }

        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("API client connected from {}", addr);
                        let backend = backend.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_api_client(stream, backend).await {
                                error!("Error handling API client {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept API connection: {}", e);
                        sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            _ = sleep(Duration::from_millis(100)) => {}
        }
    }

    debug!("API server stopped");
    Ok(())
}

async fn handle_api_client(mut stream: TcpStream, backend: Backend) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            debug!("API client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match handle_request(trimmed, &backend).await {
            Ok(resp) => resp,
            Err(e) => ApiResponse::error(e.to_string()),
        };

        let json = serde_json::to_string(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}

async fn handle_request(request: &str, backend: &Backend) -> Result<ApiResponse> {
    let req: ApiRequest = serde_json::from_str(request)
        .map_err(|e| CoreError::Protocol(format!("Invalid request: {}", e)))?;

    let now = unix_now();
    let response = match req {
        ApiRequest::RelayUpdate(update) => {
            let relay_id = update.relay_id;
            backend.process_update(update).await;
            ApiResponse::success(serde_json::json!({ "relay_id": relay_id }))
        }
        ApiRequest::Relays => {
            let relays = backend.relay_reports(now).await;
            ApiResponse::success(serde_json::json!({ "relays": relays }))
        }
        ApiRequest::RelaysCsv => {
            let csv = backend.relays_csv(now).await;
            ApiResponse::success(serde_json::json!({ "csv": csv }))
        }
        ApiRequest::Analysis => match backend.route_matrix().await {
            Some(matrix) => ApiResponse::success(serde_json::json!({
                "created_at": matrix.created_at,
                "relays": matrix.num_relays(),
                "analysis": matrix.analyze(),
            })),
            None => ApiResponse::error("No route matrix published yet".to_string()),
        },
        ApiRequest::Costs => {
            let costs = backend.cost_matrix(now).await;
            ApiResponse::success(serde_json::to_value(&costs)?)
        }
        ApiRequest::Status => {
            let matrix = backend.route_matrix().await;
            ApiResponse::success(serde_json::json!({
                "relays": backend.aggregator().known_relays(now).await.len(),
                "active_relays": backend.aggregator().active_relays(now).await.len(),
                "pairs": backend.aggregator().pair_count().await,
                "route_matrix_created_at": matrix.map(|m| m.created_at),
            }))
        }
    };

    Ok(response)
}
