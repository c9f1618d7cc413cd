// src/rpc.rs
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ErrorClass, PaymasterError};
use crate::sponsor::Sponsor;

/// Incoming JSON-RPC envelope. Only `jsonrpc` and `method` are required.
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    id: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: Some("2.0"), id: Some(id), result: Some(result), error: None }
    }

    fn failure(id: Option<Value>, message: String) -> Self {
        Self { jsonrpc: id.as_ref().map(|_| "2.0"), id, result: None, error: Some(message) }
    }
}

fn is_set(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => false,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn status_for(err: &PaymasterError) -> StatusCode {
    match err.class() {
        ErrorClass::Protocol => StatusCode::OK,
        ErrorClass::Rejected => StatusCode::BAD_REQUEST,
        ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub struct PaymasterRpc {
    sponsor: Arc<Sponsor>,
}

impl PaymasterRpc {
    pub fn new(sponsor: Arc<Sponsor>) -> Self {
        Self { sponsor }
    }

    fn resolve_chain(&self, chain: Option<&str>) -> Result<u64, PaymasterError> {
        match chain {
            Some(raw) => raw.trim().parse().map_err(|_| PaymasterError::UnknownChain(raw.to_string())),
            None => self
                .sponsor
                .registry()
                .sole_chain()
                .ok_or_else(|| PaymasterError::UnknownChain("no chain id in request path".to_string())),
        }
    }

    async fn dispatch(&self, chain: Option<&str>, method: &str, params: Value) -> Result<Value, PaymasterError> {
        match method {
            "getBlockNumber" => {
                let chain_id = self.resolve_chain(chain)?;
                Ok(Value::String(self.sponsor.block_number(chain_id).await?))
            }
            "pm_sponsorUserOperation" => {
                let chain_id = self.resolve_chain(chain)?;
                let result = self.sponsor.sponsor_user_operation(chain_id, params).await?;
                serde_json::to_value(result).map_err(|e| PaymasterError::InvalidParams(e.to_string()))
            }
            other => Err(PaymasterError::UnknownMethod(other.to_string())),
        }
    }

    /// Handles one raw request body addressed to `chain` (or the sole chain when `None`).
    pub async fn handle(&self, chain: Option<&str>, body: &[u8]) -> (StatusCode, JsonRpcResponse) {
        let request = match serde_json::from_slice::<JsonRpcRequest>(body) {
            Ok(JsonRpcRequest { jsonrpc: Some(jsonrpc), method: Some(method), params, id })
                if is_set(&jsonrpc) && !method.is_empty() =>
            {
                (method, params, id)
            }
            _ => {
                let err = PaymasterError::InvalidRequest;
                return (status_for(&err), JsonRpcResponse::failure(None, err.user_message()));
            }
        };
        let (method, params, id) = request;
        debug!(?chain, %method, "Received JSON-RPC request");

        match self.dispatch(chain, &method, params).await {
            Ok(result) => (StatusCode::OK, JsonRpcResponse::success(id, result)),
            Err(err) => {
                if err.class() == ErrorClass::Internal {
                    error!(?chain, %method, error = %err, "Request failed");
                } else {
                    debug!(?chain, %method, error = %err, "Request rejected");
                }
                (status_for(&err), JsonRpcResponse::failure(Some(id), err.user_message()))
            }
        }
    }
}

/// `POST /jrpc/:chain_id`
async fn chain_rpc(
    State(rpc): State<Arc<PaymasterRpc>>,
    Path(chain_id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let (status, response) = rpc.handle(Some(&chain_id), &body).await;
    (status, Json(response))
}

/// `POST /jrpc` for single-chain deployments.
async fn default_rpc(State(rpc): State<Arc<PaymasterRpc>>, body: Bytes) -> impl IntoResponse {
    let (status, response) = rpc.handle(None, &body).await;
    (status, Json(response))
}

/// `GET /health`: 503 while any chain is serving a stale exchange rate.
async fn health(State(rpc): State<Arc<PaymasterRpc>>) -> impl IntoResponse {
    let degraded = rpc.sponsor.registry().degraded_chains();
    if degraded.is_empty() {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "chains": degraded })),
        )
    }
}

pub fn router(rpc: Arc<PaymasterRpc>) -> Router {
    Router::new()
        .route("/jrpc/:chain_id", post(chain_rpc))
        .route("/jrpc", post(default_rpc))
        .route("/health", get(health))
        .with_state(rpc)
}

pub async fn serve(addr: SocketAddr, rpc: Arc<PaymasterRpc>, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Starting paymaster RPC server");

    axum::serve(listener, router(rpc))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("Paymaster RPC server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ethers::types::{H256, U256};

    use super::*;
    use crate::clients::tests::test_wallet;
    use crate::clients::{MockBundlerClient, MockChainClient};
    use crate::paymaster::PaymasterEncoder;
    use crate::registry::tests::{arbitrum_config, entry};
    use crate::registry::ChainRegistry;
    use crate::sponsor::tests::{estimate, params, sponsor};
    use crate::types::EntryPointVersion;

    fn rpc(chain: MockChainClient, bundler: MockBundlerClient) -> PaymasterRpc {
        PaymasterRpc::new(Arc::new(sponsor(EntryPointVersion::V0_7, chain, bundler)))
    }

    fn body(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    fn to_json(response: &JsonRpcResponse) -> Value {
        serde_json::to_value(response).unwrap()
    }

    #[tokio::test]
    async fn malformed_envelope_touches_nothing() {
        // mocks without expectations panic if called
        let rpc = rpc(MockChainClient::new(), MockBundlerClient::new());

        let bodies = [
            b"{}".to_vec(),
            b"not json".to_vec(),
            body(json!({ "jsonrpc": "2.0" })),
            body(json!({ "method": "getBlockNumber" })),
            body(json!({ "jsonrpc": false, "method": "getBlockNumber" })),
        ];
        for raw in bodies {
            let (status, response) = rpc.handle(Some("42161"), &raw).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(to_json(&response), json!({ "error": "Invalid JSON-RPC request" }));
        }
    }

    #[tokio::test]
    async fn unknown_method() {
        let rpc = rpc(MockChainClient::new(), MockBundlerClient::new());
        let request = body(json!({ "jsonrpc": "2.0", "id": 3, "method": "eth_sendUserOperation", "params": [] }));

        let (status, response) = rpc.handle(Some("42161"), &request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(to_json(&response), json!({ "jsonrpc": "2.0", "id": 3, "error": "Method not found" }));
    }

    #[tokio::test]
    async fn block_number_is_hex() {
        let mut chain = MockChainClient::new();
        chain.expect_block_number().times(2).returning(|| Ok(255));
        let rpc = rpc(chain, MockBundlerClient::new());
        let request = body(json!({ "jsonrpc": "2.0", "id": 1, "method": "getBlockNumber" }));

        let (status, response) = rpc.handle(Some("42161"), &request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(to_json(&response), json!({ "jsonrpc": "2.0", "id": 1, "result": "0xff" }));

        let (_, response) = rpc.handle(None, &request).await;
        assert_eq!(to_json(&response)["error"], Value::Null);
    }

    #[tokio::test]
    async fn unknown_or_malformed_chain() {
        let rpc = rpc(MockChainClient::new(), MockBundlerClient::new());
        let request = body(json!({ "jsonrpc": "2.0", "id": 1, "method": "getBlockNumber" }));

        let (status, response) = rpc.handle(Some("10"), &request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(to_json(&response)["error"], "Unsupported chain: 10");

        let (status, _) = rpc.handle(Some("arbitrum"), &request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upstream_failure_is_generic() {
        let mut chain = MockChainClient::new();
        chain.expect_block_number().returning(|| Err(anyhow::anyhow!("connection reset by peer")));
        let rpc = rpc(chain, MockBundlerClient::new());
        let request = body(json!({ "jsonrpc": "2.0", "id": "a", "method": "getBlockNumber" }));

        let (status, response) = rpc.handle(Some("42161"), &request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(to_json(&response), json!({ "jsonrpc": "2.0", "id": "a", "error": "Internal error" }));
    }

    #[tokio::test]
    async fn sponsor_over_http() {
        let mut chain = MockChainClient::new();
        chain.expect_paymaster_hash().returning(|_| Ok(H256::repeat_byte(0x07)));
        let mut bundler = MockBundlerClient::new();
        bundler
            .expect_estimate_user_operation_gas()
            .returning(|_, _| Ok(estimate(EntryPointVersion::V0_7)));
        let rpc = Arc::new(rpc(chain, bundler));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, router(rpc))
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .unwrap();
        });

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://{addr}/jrpc/42161"))
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "pm_sponsorUserOperation",
                "params": params(EntryPointVersion::V0_7, "ether"),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        let result = &body["result"];
        assert_eq!(result["callGasLimit"], "0x186a0");
        assert_eq!(result["verificationGasLimit"], "0x249f0");
        assert_eq!(result["preVerificationGas"], "0xc350");
        assert_eq!(result["paymaster"], "0x0101010101010101010101010101010101010101");
        assert_eq!(result["paymasterVerificationGasLimit"], "0x7530");
        assert_eq!(result["paymasterPostOpGasLimit"], "0x2710");
        // window (64 bytes) + signature (65 bytes)
        assert_eq!(result["paymasterData"].as_str().unwrap().len(), 2 + 2 * (64 + 65));

        let resp = client.post(format!("http://{addr}/jrpc/42161")).body("{}").send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.json::<Value>().await.unwrap(), json!({ "error": "Invalid JSON-RPC request" }));

        cancel.cancel();
    }

    #[tokio::test]
    async fn health_reports_degraded_price() {
        let registry = ChainRegistry::new(vec![entry(
            arbitrum_config(EntryPointVersion::V0_7),
            MockChainClient::new(),
            MockBundlerClient::new(),
            U256::one(),
        )])
        .unwrap();
        let rate = registry.entries().next().unwrap().rate.clone();
        let sponsor = Sponsor::new(
            Arc::new(registry),
            PaymasterEncoder::new(Arc::new(test_wallet())),
            Duration::from_secs(5),
        );
        let rpc = Arc::new(PaymasterRpc::new(Arc::new(sponsor)));

        let response = health(State(rpc.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        rate.record_failure(1);
        let response = health(State(rpc)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
