mod config;
mod handlers;

use config::Config;
use handlers::{create_error_response, process_request, RpcRequest, RpcResponse, ServerState};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{debug, error, info, warn};
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const FALLBACK_ERROR: &str =
    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32000,"message":"Internal Server Error"}}"#;

async fn write_line(stdout: &mut Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(format!("{}\r\n", line).as_bytes()).await?;
    stdout.flush().await
}

async fn send_response(stdout: &mut Stdout, response: &RpcResponse) {
    let resp_str = match serde_json::to_string(response) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to serialize response for ID {:?}: {}", response.id, e);
            FALLBACK_ERROR.to_string()
        }
    };
    if let Err(e) = write_line(stdout, &resp_str).await {
        error!("Failed to write response for ID {:?}: {}", response.id, e);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Fatal: invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    info!(
        keystore = %config.keystore_dir.display(),
        workers = config.workers,
        timeout_secs = config.request_timeout.as_secs(),
        "Starting site bundle server on stdio..."
    );
    let state = Arc::new(ServerState::new(&config));

    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut stdout = tokio::io::stdout();
    let mut line_buffer = String::new();

    let ready_msg =
        json!({"jsonrpc": "2.0", "method": "server/ready", "params": {"status": "ready"}});
    info!("Sending server/ready notification.");
    if let Err(e) = write_line(&mut stdout, &ready_msg.to_string()).await {
        error!("Fatal: Failed to write ready message: {}", e);
        return;
    }

    loop {
        line_buffer.clear();
        match reader.read_line(&mut line_buffer).await {
            Ok(0) => {
                info!("Stdin closed (EOF). Exiting server.");
                break;
            }
            Ok(_) => {
                let trimmed_line = line_buffer.trim();
                if trimmed_line.is_empty() || !trimmed_line.starts_with('{') {
                    if !trimmed_line.is_empty() {
                        warn!("Received non-JSON input line, ignoring.");
                    }
                    continue;
                }
                // Bundles travel inline as base64, so only the size is logged
                debug!("<<< Received line ({} bytes)", trimmed_line.len());

                let parsed_json: Value = match serde_json::from_str(trimmed_line) {
                    Ok(v) => v,
                    Err(e) => {
                        let response = create_error_response(
                            Value::Null,
                            handlers::PARSE_ERROR,
                            format!("Parse error: {}", e),
                        );
                        send_response(&mut stdout, &response).await;
                        continue;
                    }
                };

                // Notifications carry no id and get no response
                if parsed_json.get("id").map_or(true, Value::is_null) {
                    match parsed_json.get("method").and_then(Value::as_str) {
                        Some(method) => info!("Received notification: {}", method),
                        None => warn!("Received notification without method field"),
                    }
                    continue;
                }

                let id = parsed_json.get("id").cloned().unwrap_or(Value::Null);
                let req: RpcRequest = match serde_json::from_value(parsed_json) {
                    Ok(r) => r,
                    Err(e) => {
                        let response = create_error_response(
                            id,
                            handlers::INVALID_REQUEST,
                            format!("Invalid Request: {}", e),
                        );
                        send_response(&mut stdout, &response).await;
                        continue;
                    }
                };

                debug!("Processing request: ID={:?}, Method='{}'", req.id, req.method);
                // Blocking methods enforce the request timeout themselves
                let response = process_request(state.clone(), req).await;
                send_response(&mut stdout, &response).await;
            }
            Err(e) => {
                error!("Error reading from stdin: {}. Exiting.", e);
                break;
            }
        }
    }
    info!("Site bundle server shutting down.");
}
