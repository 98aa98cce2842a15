use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, B256, Bytes};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::trace;

use super::error::RpcError;
use super::rpc::{BlockHeader, CallRequest, FilterId, Ledger, Log, LogFilter, Receipt};

/// JSON-RPC 2.0 client for a ledger node over HTTP.
pub struct JsonRpcClient {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct Response {
    result: Option<Value>,
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block_number: Option<String>,
    log_index: Option<String>,
}

#[derive(Deserialize)]
struct RawBlock {
    number: String,
    timestamp: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: B256,
    status: Option<String>,
    block_number: Option<String>,
}

fn quantity(text: &str) -> Result<u128, RpcError> {
    let digits = text
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Decode(format!("quantity without 0x prefix: {text}")))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| RpcError::Decode(format!("bad quantity {text}: {e}")))
}

fn quantity_u64(text: &str) -> Result<u64, RpcError> {
    u64::try_from(quantity(text)?)
        .map_err(|_| RpcError::Decode(format!("quantity too large: {text}")))
}

fn optional_u64(text: Option<&str>) -> Result<Option<u64>, RpcError> {
    text.map(quantity_u64).transpose()
}

fn call_object(request: &CallRequest) -> Value {
    let mut object = json!({ "to": request.to, "data": request.data });
    if let Some(from) = request.from {
        object["from"] = json!(from);
    }
    object
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self, RpcError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        trace!(id, method, "rpc request");

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(RpcError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let response = response.json::<Response>().await?;
        if let Some(error) = response.error {
            return Err(RpcError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn typed<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let value = self.request(method, params).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Decode(format!("{method}: {e}")))
    }

    async fn quantity(&self, method: &str, params: Value) -> Result<u128, RpcError> {
        let text: String = self.typed(method, params).await?;
        quantity(&text)
    }
}

impl Ledger for JsonRpcClient {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        let id = self.quantity("eth_chainId", json!([])).await?;
        u64::try_from(id).map_err(|_| RpcError::Decode("chain id too large".into()))
    }

    async fn syncing(&self) -> Result<bool, RpcError> {
        // `false` when idle, a progress object while syncing.
        let value = self.request("eth_syncing", json!([])).await?;
        Ok(!matches!(value, Value::Bool(false) | Value::Null))
    }

    async fn latest_block(&self) -> Result<BlockHeader, RpcError> {
        let block: Option<RawBlock> = self
            .typed("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let block = block.ok_or_else(|| RpcError::Decode("latest block missing".into()))?;
        Ok(BlockHeader {
            number: quantity_u64(&block.number)?,
            timestamp: quantity_u64(&block.timestamp)?,
        })
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, RpcError> {
        self.typed("eth_call", json!([call_object(request), "latest"]))
            .await
    }

    async fn new_filter(&self, filter: &LogFilter) -> Result<FilterId, RpcError> {
        let from_block = match filter.from_block {
            Some(block) => format!("{block:#x}"),
            None => "latest".to_string(),
        };
        let params = json!([{
            "address": filter.address,
            "topics": filter.topics,
            "fromBlock": from_block,
        }]);
        self.typed("eth_newFilter", params).await
    }

    async fn filter_changes(&self, id: &FilterId) -> Result<Vec<Log>, RpcError> {
        let raw: Vec<RawLog> = self.typed("eth_getFilterChanges", json!([id])).await?;
        raw.into_iter()
            .map(|log| {
                Ok(Log {
                    address: log.address,
                    topics: log.topics,
                    data: log.data,
                    block_number: optional_u64(log.block_number.as_deref())?,
                    log_index: optional_u64(log.log_index.as_deref())?,
                })
            })
            .collect()
    }

    async fn uninstall_filter(&self, id: &FilterId) -> Result<bool, RpcError> {
        self.typed("eth_uninstallFilter", json!([id])).await
    }

    async fn pending_nonce(&self, account: Address) -> Result<u64, RpcError> {
        let nonce = self
            .quantity("eth_getTransactionCount", json!([account, "pending"]))
            .await?;
        u64::try_from(nonce).map_err(|_| RpcError::Decode("nonce too large".into()))
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        self.quantity("eth_gasPrice", json!([])).await
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, RpcError> {
        let gas = self
            .quantity("eth_estimateGas", json!([call_object(request)]))
            .await?;
        u64::try_from(gas).map_err(|_| RpcError::Decode("gas estimate too large".into()))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, RpcError> {
        self.typed("eth_sendRawTransaction", json!([raw])).await
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, RpcError> {
        let raw: Option<RawReceipt> = self
            .typed("eth_getTransactionReceipt", json!([hash]))
            .await?;
        raw.map(|receipt| {
            Ok(Receipt {
                transaction_hash: receipt.transaction_hash,
                success: receipt.status.as_deref().map(quantity).transpose()? != Some(0),
                block_number: optional_u64(receipt.block_number.as_deref())?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn respond(server: &MockServer, rpc_method: &str, result: Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": rpc_method })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result })),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn quantities() {
        assert_eq!(quantity("0x0").unwrap(), 0);
        assert_eq!(quantity("0x").unwrap(), 0);
        assert_eq!(quantity("0x1a").unwrap(), 26);
        assert!(quantity("1a").is_err());
        assert!(quantity_u64("0x10000000000000000").is_err());
    }

    #[tokio::test]
    async fn chain_id_and_block() {
        let server = MockServer::start().await;
        respond(&server, "eth_chainId", json!("0x539")).await;
        respond(
            &server,
            "eth_getBlockByNumber",
            json!({ "number": "0x10", "timestamp": "0x5f5e100", "hash": "0x00" }),
        )
        .await;

        let client = JsonRpcClient::new(server.uri()).unwrap();
        assert_eq!(client.chain_id().await.unwrap(), 1337);
        assert_eq!(
            client.latest_block().await.unwrap(),
            BlockHeader {
                number: 16,
                timestamp: 100_000_000
            }
        );
    }

    #[tokio::test]
    async fn syncing_object_means_syncing() {
        let server = MockServer::start().await;
        let progress = json!({ "currentBlock": "0x1", "highestBlock": "0x9" });
        respond(&server, "eth_syncing", progress).await;
        let client = JsonRpcClient::new(server.uri()).unwrap();
        assert!(client.syncing().await.unwrap());
    }

    #[tokio::test]
    async fn filter_changes_parse_logs() {
        let server = MockServer::start().await;
        let topic = B256::repeat_byte(0xab);
        respond(
            &server,
            "eth_getFilterChanges",
            json!([{
                "address": "0x1111111111111111111111111111111111111111",
                "topics": [topic],
                "data": "0x0102",
                "blockNumber": "0x64",
                "logIndex": "0x2",
                "removed": false
            }]),
        )
        .await;

        let client = JsonRpcClient::new(server.uri()).unwrap();
        let logs = client.filter_changes(&FilterId("0x1".into())).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].address, Address::repeat_byte(0x11));
        assert_eq!(logs[0].topics, vec![topic]);
        assert_eq!(logs[0].data, Bytes::from(vec![1u8, 2]));
        assert_eq!(logs[0].block_number, Some(100));
        assert_eq!(logs[0].log_index, Some(2));
    }

    #[tokio::test]
    async fn pending_receipt_is_none() {
        let server = MockServer::start().await;
        respond(&server, "eth_getTransactionReceipt", Value::Null).await;
        let client = JsonRpcClient::new(server.uri()).unwrap();
        assert_eq!(client.transaction_receipt(B256::ZERO).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_receipt_status() {
        let server = MockServer::start().await;
        let hash = B256::repeat_byte(5);
        respond(
            &server,
            "eth_getTransactionReceipt",
            json!({ "transactionHash": hash, "status": "0x0", "blockNumber": "0x7" }),
        )
        .await;
        let client = JsonRpcClient::new(server.uri()).unwrap();
        let receipt = client.transaction_receipt(hash).await.unwrap().unwrap();
        assert!(!receipt.success);
        assert_eq!(receipt.block_number, Some(7));
    }

    #[tokio::test]
    async fn rpc_errors_are_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": -32000, "message": "filter not found" }
            })))
            .mount(&server)
            .await;

        let client = JsonRpcClient::new(server.uri()).unwrap();
        let err = client.filter_changes(&FilterId("0x9".into())).await.unwrap_err();
        assert_eq!(err.kind(), crate::ledger::RpcErrorKind::FilterNotFound);
    }

    #[tokio::test]
    async fn http_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = JsonRpcClient::new(server.uri()).unwrap();
        match client.gas_price().await.unwrap_err() {
            RpcError::Http { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
