//! HTTP gateway
//!
//! A thin axum front-end over the core pipelines, for external clients
//! that do not speak libp2p: job submission, transaction broadcast, and
//! a health probe. The gateway only ever ingests WebAssembly bytes;
//! source languages are detected and turned away (compilation is an
//! external tool's job).

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::chain::tx::{unix_now, unix_now_nanos};
use crate::chain::{Blockchain, Transaction};
use crate::network::{Client, COMPUTE_CAPABILITY};
use crate::vm::JobRunner;

/// Rough shape of a submitted payload; only `Wasm` is executable here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    C,
    Rust,
    Wasm,
    Unknown,
}

/// Sniff what a job submission contains.
pub fn detect_language(bytes: &[u8]) -> Language {
    if bytes.starts_with(b"\0asm") {
        return Language::Wasm;
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(4096)]);
    if head.contains("#include") || head.contains("int main") {
        return Language::C;
    }
    if head.contains("fn main") {
        return Language::Rust;
    }
    Language::Unknown
}

#[derive(Clone)]
pub struct ApiState {
    pub client: Client,
    pub chain: Arc<Blockchain>,
    pub runner: Option<Arc<dyn JobRunner>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/v1/transaction", post(submit_transaction))
        .route("/api/jobs/submit", post(submit_job))
        .with_state(state)
}

/// Bind and serve the gateway until the process exits.
pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http gateway listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let peers = state
        .client
        .connected_peers()
        .await
        .map(|p| p.len())
        .unwrap_or(0);

    Json(json!({
        "status": "online",
        "nodeId": state.client.local_peer_id().to_string(),
        "peers": peers,
        "timestamp": unix_now(),
    }))
}

async fn submit_transaction(
    State(state): State<ApiState>,
    Json(tx): Json<Transaction>,
) -> Result<Json<Value>, (StatusCode, String)> {
    info!(id = %tx.id, amount = tx.amount, "transaction received");

    state.chain.add_transaction(tx.clone()).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("transaction rejected: {e}"),
        )
    })?;

    Ok(Json(json!({ "status": "success", "tx_id": tx.id })))
}

#[derive(Deserialize)]
struct JobSubmission {
    /// Base64-encoded wasm module
    wasm: String,
    #[serde(default)]
    input: String,
    #[serde(default, rename = "paymentTx")]
    payment_tx: String,
}

#[derive(Serialize)]
struct JobReply {
    id: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker: Option<String>,
}

async fn submit_job(
    State(state): State<ApiState>,
    Json(job): Json<JobSubmission>,
) -> Result<Json<JobReply>, (StatusCode, String)> {
    let wasm = base64::engine::general_purpose::STANDARD
        .decode(&job.wasm)
        .map_err(|_| (StatusCode::BAD_REQUEST, "wasm must be base64".to_string()))?;
    if wasm.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "wasm code is required".to_string()));
    }

    match detect_language(&wasm) {
        Language::Wasm => {}
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("{other:?} source is not accepted; compile to wasm first"),
            ));
        }
    }

    let id = format!("job_{}", unix_now_nanos());
    let input = job.input.into_bytes();
    info!(id, wasm_bytes = wasm.len(), tx_id = %job.payment_tx, "job submitted");

    // Remote first: the first discovered provider that is not ourselves.
    let providers = state
        .client
        .find_providers(COMPUTE_CAPABILITY)
        .await
        .unwrap_or_default();
    let remote_peer = providers
        .into_iter()
        .find(|p| *p != state.client.local_peer_id());

    let mut worker: Option<String> = None;
    let mut outcome: Option<Result<Vec<u8>, String>> = None;

    if let Some(peer) = remote_peer {
        match state
            .client
            .compute(peer, job.payment_tx.clone(), wasm.clone(), input.clone())
            .await
        {
            Ok(output) => {
                worker = Some(peer.to_string());
                outcome = Some(Ok(output));
            }
            Err(e) => {
                warn!(%peer, "remote compute failed: {e}");
                outcome = Some(Err(e.to_string()));
            }
        }
    }

    // Fall back to local execution when no remote peer answered.
    if !matches!(outcome, Some(Ok(_))) {
        if let Some(runner) = state.runner.clone() {
            info!("executing job locally");
            let wasm = wasm.clone();
            let input = input.clone();
            match tokio::task::spawn_blocking(move || runner.run(&wasm, &input)).await {
                Ok(Ok(output)) => {
                    worker = Some(state.client.local_peer_id().to_string());
                    outcome = Some(Ok(output));
                }
                Ok(Err(e)) => outcome = Some(Err(e.to_string())),
                Err(e) => outcome = Some(Err(e.to_string())),
            }
        }
    }

    let reply = match outcome {
        Some(Ok(output)) => JobReply {
            id,
            status: "complete",
            result: Some(String::from_utf8_lossy(&output).into_owned()),
            error: None,
            worker,
        },
        Some(Err(e)) => JobReply {
            id,
            status: "failed",
            result: None,
            error: Some(e),
            worker,
        },
        None => JobReply {
            id,
            status: "failed",
            result: None,
            error: Some("no compute providers available".to_string()),
            worker: None,
        },
    };

    Ok(Json(reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_wasm_magic() {
        assert_eq!(detect_language(b"\0asm\x01\0\0\0"), Language::Wasm);
    }

    #[test]
    fn test_detect_c_source() {
        assert_eq!(
            detect_language(b"#include <stdio.h>\nint main() { return 0; }"),
            Language::C
        );
    }

    #[test]
    fn test_detect_rust_source() {
        assert_eq!(
            detect_language(b"fn main() { println!(\"hi\"); }"),
            Language::Rust
        );
    }

    #[test]
    fn test_detect_unknown() {
        assert_eq!(detect_language(b"random bytes"), Language::Unknown);
    }
}
