//! RPC Client — typed wrapper over JSON-RPC 2.0 (spec §4.1).
//!
//! Wire transport is separated from the typed client via [`RpcTransport`] so
//! tests substitute an in-memory fake instead of a live HTTP endpoint.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use downloader_core::{BlockHeader, DownloaderError, HeaderSource, LogRecord};

// ─── Wire types ──────────────────────────────────────────────────────────────

/// JSON-RPC request id — number, string, or null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    pub id: RpcId,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawLog {
    address: String,
    topics: Vec<String>,
    data: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
    #[serde(rename = "blockHash")]
    block_hash: String,
    #[serde(rename = "transactionHash")]
    tx_hash: String,
    #[serde(rename = "transactionIndex")]
    tx_index: String,
    #[serde(rename = "logIndex")]
    log_index: String,
    removed: Option<bool>,
}

fn parse_hex_u64(s: &str) -> u64 {
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).unwrap_or(0)
}

fn to_hex(n: u64) -> String {
    format!("0x{n:x}")
}

impl From<RawLog> for LogRecord {
    fn from(raw: RawLog) -> Self {
        LogRecord {
            address: raw.address,
            topics: raw.topics,
            data: raw.data,
            block_number: parse_hex_u64(&raw.block_number),
            block_hash: raw.block_hash,
            tx_hash: raw.tx_hash,
            tx_index: parse_hex_u64(&raw.tx_index) as u32,
            log_index: parse_hex_u64(&raw.log_index) as u32,
            removed: raw.removed.unwrap_or(false),
        }
    }
}

fn header_from_json(v: &Value) -> Option<BlockHeader> {
    Some(BlockHeader {
        number: parse_hex_u64(v.get("number")?.as_str()?),
        hash: v.get("hash")?.as_str()?.to_string(),
        parent_hash: v.get("parentHash")?.as_str()?.to_string(),
    })
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors the RPC Client can surface (spec §4.1, §7).
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("RPC protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("rate limit exceeded")]
    RateLimit,

    /// The provider rejected the request for returning too many results.
    /// `suggested_range`, when the error body named one, is the narrower
    /// range the Fetcher should retry with (spec §4.6.3 step 3).
    #[error("too many results (suggested range: {suggested_range:?})")]
    TooManyResults { suggested_range: Option<(u64, u64)> },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<RpcError> for DownloaderError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::TooManyResults { .. } => {
                DownloaderError::Transport(format!("unexpected overflow at RPC boundary: {e}"))
            }
            other => DownloaderError::Transport(other.to_string()),
        }
    }
}

/// Patterns recognized in a "too many results" error body, with the
/// provider-specific sub-range they carry (grounded in rindexer's
/// `retry_with_block_range`, itself crediting the Ponder project).
struct OverflowMarker {
    pattern: Regex,
    extract: fn(&regex::Captures, u64, u64) -> (u64, u64),
}

fn overflow_markers() -> Vec<OverflowMarker> {
    vec![
        // Alchemy: "...this block range should work: [0x1, 0x2]"
        OverflowMarker {
            pattern: Regex::new(r"this block range should work: \[(0x[0-9a-fA-F]+),\s*(0x[0-9a-fA-F]+)\]").unwrap(),
            extract: |c, _from, _to| (parse_hex_u64(&c[1]), parse_hex_u64(&c[2])),
        },
        // Infura / Thirdweb / zkSync / Tenderly: "Try with this block range [0x1, 0x2]"
        OverflowMarker {
            pattern: Regex::new(r"Try with this block range \[0x([0-9a-fA-F]+),\s*0x([0-9a-fA-F]+)\]").unwrap(),
            extract: |c, _from, _to| {
                (
                    u64::from_str_radix(&c[1], 16).unwrap_or(0),
                    u64::from_str_radix(&c[2], 16).unwrap_or(0),
                )
            },
        },
        // QuickNode / 1RPC / zkEVM / Blast / BlockPI: "limited to a 10,000 range"
        OverflowMarker {
            pattern: Regex::new(r"limited to a ([\d,.]+)").unwrap(),
            extract: |c, from, _to| {
                let digits: String = c[1].chars().filter(char::is_ascii_digit).collect();
                let span: u64 = digits.parse().unwrap_or(0);
                (from, from.saturating_add(span.saturating_sub(1)))
            },
        },
    ]
}

/// Classify an error body against the configured markers and any
/// provider-specific regex family, returning a suggested range if one can
/// be extracted. `from`/`to` are the range that produced the error, used as
/// the anchor for markers that only give a span rather than absolute bounds.
fn classify_overflow(message: &str, data: Option<&str>, from: u64, to: u64, configured_markers: &[String]) -> Option<Option<(u64, u64)>> {
    let haystacks = [Some(message), data];
    for marker in overflow_markers() {
        for hay in haystacks.iter().flatten() {
            if let Some(caps) = marker.pattern.captures(hay) {
                return Some(Some((marker.extract)(&caps, from, to)));
            }
        }
    }
    let lower = message.to_lowercase();
    if configured_markers.iter().any(|m| lower.contains(&m.to_lowercase())) {
        return Some(None);
    }
    None
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Wire-level transport — separated from [`RpcClient`] so tests can
/// substitute an in-memory fake instead of a live endpoint.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    /// A single JSON-RPC batch request; the response vector preserves
    /// one-to-one correspondence with `calls`, or the whole call fails
    /// (spec §4.1 batch atomicity).
    async fn batch_call(&self, calls: Vec<(&str, Value)>) -> Result<Vec<Value>, RpcError>;
}

/// HTTP JSON-RPC transport over `reqwest`.
pub struct HttpRpcTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpRpcTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, body: &Value) -> Result<Value, RpcError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| RpcError::Http(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RpcError::RateLimit);
        }

        resp.json::<Value>()
            .await
            .map_err(|e| RpcError::Malformed(e.to_string()))
    }

    fn extract_result(resp: &Value) -> Result<Value, RpcError> {
        if let Some(err) = resp.get("error") {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let data = err.get("data").map(|d| d.to_string());
            return Err(RpcError::Protocol { code, message: format!("{message}{}", data.map(|d| format!(" ({d})")).unwrap_or_default()) });
        }
        resp.get("result")
            .cloned()
            .ok_or_else(|| RpcError::Malformed("response missing result".into()))
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self.post(&body).await?;
        Self::extract_result(&resp)
    }

    async fn batch_call(&self, calls: Vec<(&str, Value)>) -> Result<Vec<Value>, RpcError> {
        let body: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(i, (method, params))| {
                json!({"jsonrpc": "2.0", "id": i, "method": method, "params": params})
            })
            .collect();
        let resp = self.post(&Value::Array(body)).await?;
        let items = resp
            .as_array()
            .ok_or_else(|| RpcError::Malformed("batch response is not an array".into()))?;

        let mut by_id: std::collections::HashMap<u64, Value> = std::collections::HashMap::new();
        for item in items {
            let id = item.get("id").and_then(Value::as_u64).unwrap_or(0);
            by_id.insert(id, item.clone());
        }
        (0..calls.len())
            .map(|i| {
                by_id
                    .get(&(i as u64))
                    .ok_or_else(|| RpcError::Malformed("batch response missing an id".into()))
                    .and_then(Self::extract_result)
            })
            .collect()
    }
}

// ─── Typed client ────────────────────────────────────────────────────────────

/// Finality tag accepted by `eth_getBlockByNumber`.
#[derive(Debug, Clone, Copy)]
pub enum FinalityTag {
    Latest,
    Safe,
    Finalized,
}

impl FinalityTag {
    fn as_param(&self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Safe => "safe",
            Self::Finalized => "finalized",
        }
    }
}

/// The narrowed, active `get_logs` filter the Fetcher builds per call.
#[derive(Debug, Clone)]
pub struct GetLogsFilter {
    pub addresses: Vec<String>,
    /// `topics[i]` is the set of `topic0` values of interest for `addresses[i]`;
    /// an empty inner vec means "every topic at this address".
    pub topics: Vec<Vec<String>>,
    pub from_block: u64,
    pub to_block: u64,
}

/// Typed JSON-RPC client: `get_logs`, `get_block_header_by_tag`,
/// `get_block_header_by_number`, `batch_get_block_headers` (spec §4.1).
pub struct RpcClient<T: RpcTransport> {
    transport: T,
    too_many_results_markers: Vec<String>,
}

impl<T: RpcTransport> RpcClient<T> {
    pub fn new(transport: T, too_many_results_markers: Vec<String>) -> Self {
        Self {
            transport,
            too_many_results_markers,
        }
    }

    pub async fn get_logs(&self, filter: &GetLogsFilter) -> Result<Vec<LogRecord>, RpcError> {
        let distinct_topics: std::collections::HashSet<&str> = filter
            .topics
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();
        let topics_param: Value = if distinct_topics.is_empty() {
            json!([])
        } else {
            json!([distinct_topics.into_iter().collect::<Vec<_>>()])
        };

        let params = json!([{
            "fromBlock": to_hex(filter.from_block),
            "toBlock": to_hex(filter.to_block),
            "address": filter.addresses,
            "topics": topics_param,
        }]);

        match self.transport.call("eth_getLogs", params).await {
            Ok(value) => {
                let raw: Vec<RawLog> = serde_json::from_value(value)
                    .map_err(|e| RpcError::Malformed(e.to_string()))?;
                Ok(raw.into_iter().map(LogRecord::from).collect())
            }
            Err(RpcError::Protocol { code, message }) => {
                match classify_overflow(&message, None, filter.from_block, filter.to_block, &self.too_many_results_markers) {
                    Some(suggested) => Err(RpcError::TooManyResults { suggested_range: suggested }),
                    None => Err(RpcError::Protocol { code, message }),
                }
            }
            Err(other) => Err(other),
        }
    }

    pub async fn get_block_header_by_tag(&self, tag: FinalityTag) -> Result<BlockHeader, RpcError> {
        let params = json!([tag.as_param(), false]);
        let value = self.transport.call("eth_getBlockByNumber", params).await?;
        header_from_json(&value).ok_or_else(|| RpcError::Malformed("missing header fields".into()))
    }

    pub async fn get_block_header_by_number(&self, number: u64) -> Result<BlockHeader, RpcError> {
        let params = json!([to_hex(number), false]);
        let value = self.transport.call("eth_getBlockByNumber", params).await?;
        header_from_json(&value).ok_or_else(|| RpcError::Malformed("missing header fields".into()))
    }

    /// Fetch headers for every number in `numbers` as one JSON-RPC batch
    /// request, preserving one-to-one correspondence and failing atomically.
    pub async fn batch_get_block_headers(&self, numbers: &[u64]) -> Result<Vec<BlockHeader>, RpcError> {
        if numbers.is_empty() {
            return Ok(Vec::new());
        }
        let calls: Vec<(&str, Value)> = numbers
            .iter()
            .map(|n| ("eth_getBlockByNumber", json!([to_hex(*n), false])))
            .collect();
        let values = self.transport.batch_call(calls).await?;
        values
            .iter()
            .map(|v| header_from_json(v).ok_or_else(|| RpcError::Malformed("missing header fields".into())))
            .collect()
    }
}

#[async_trait]
impl<T: RpcTransport> HeaderSource for RpcClient<T> {
    async fn headers_for_range(&self, from: u64, to: u64) -> Result<Vec<BlockHeader>, DownloaderError> {
        let numbers: Vec<u64> = (from..=to).collect();
        self.batch_get_block_headers(&numbers)
            .await
            .map_err(DownloaderError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeTransport {
        logs_response: Mutex<Option<Result<Value, RpcError>>>,
        headers: Vec<BlockHeader>,
    }

    #[async_trait]
    impl RpcTransport for FakeTransport {
        async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            match method {
                "eth_getLogs" => self
                    .logs_response
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or_else(|| Ok(json!([]))),
                "eth_getBlockByNumber" => {
                    let requested = params[0].as_str().unwrap();
                    let number = if requested == "latest" || requested == "safe" || requested == "finalized" {
                        self.headers.last().map(|h| h.number).unwrap_or(0)
                    } else {
                        parse_hex_u64(requested)
                    };
                    let header = self.headers.iter().find(|h| h.number == number).cloned();
                    Ok(header
                        .map(|h| json!({"number": to_hex(h.number), "hash": h.hash, "parentHash": h.parent_hash}))
                        .unwrap_or(Value::Null))
                }
                other => panic!("unexpected method {other}"),
            }
        }

        async fn batch_call(&self, calls: Vec<(&str, Value)>) -> Result<Vec<Value>, RpcError> {
            let mut out = Vec::new();
            for (method, params) in calls {
                out.push(self.call(method, params).await?);
            }
            Ok(out)
        }
    }

    fn header(n: u64, hash: &str, parent: &str) -> BlockHeader {
        BlockHeader { number: n, hash: hash.into(), parent_hash: parent.into() }
    }

    #[tokio::test]
    async fn get_logs_parses_raw_logs() {
        let transport = FakeTransport {
            logs_response: Mutex::new(Some(Ok(json!([{
                "address": "0xabc",
                "topics": ["0xevt"],
                "data": "0x1234",
                "blockNumber": "0x64",
                "blockHash": "0xblockhash",
                "transactionHash": "0xtxhash",
                "transactionIndex": "0x0",
                "logIndex": "0x2",
                "removed": false,
            }])))),
            headers: vec![],
        };
        let client = RpcClient::new(transport, vec![]);
        let filter = GetLogsFilter { addresses: vec!["0xabc".into()], topics: vec![vec!["0xevt".into()]], from_block: 100, to_block: 100 };
        let logs = client.get_logs(&filter).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 100);
        assert_eq!(logs[0].log_index, 2);
    }

    #[tokio::test]
    async fn too_many_results_parses_alchemy_style_suggested_range() {
        let transport = FakeTransport {
            logs_response: Mutex::new(Some(Err(RpcError::Protocol {
                code: -32600,
                message: "query returned more than 10000 results. this block range should work: [0x0, 0x9c3]".into(),
            }))),
            headers: vec![],
        };
        let client = RpcClient::new(transport, vec!["query returned more than".into()]);
        let filter = GetLogsFilter { addresses: vec!["0xabc".into()], topics: vec![vec![]], from_block: 0, to_block: 5000 };
        let err = client.get_logs(&filter).await.unwrap_err();
        match err {
            RpcError::TooManyResults { suggested_range } => {
                assert_eq!(suggested_range, Some((0, 0x9c3)));
            }
            other => panic!("expected TooManyResults, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_without_suggested_range_falls_back_to_marker_match() {
        let transport = FakeTransport {
            logs_response: Mutex::new(Some(Err(RpcError::Protocol {
                code: -32000,
                message: "block range is too large for this provider".into(),
            }))),
            headers: vec![],
        };
        let client = RpcClient::new(transport, vec!["block range is too large".into()]);
        let filter = GetLogsFilter { addresses: vec!["0xabc".into()], topics: vec![vec![]], from_block: 0, to_block: 100 };
        let err = client.get_logs(&filter).await.unwrap_err();
        assert!(matches!(err, RpcError::TooManyResults { suggested_range: None }));
    }

    #[tokio::test]
    async fn unrecognized_protocol_error_is_not_overflow() {
        let transport = FakeTransport {
            logs_response: Mutex::new(Some(Err(RpcError::Protocol { code: -32601, message: "method not found".into() }))),
            headers: vec![],
        };
        let client = RpcClient::new(transport, vec!["too many results".into()]);
        let filter = GetLogsFilter { addresses: vec!["0xabc".into()], topics: vec![vec![]], from_block: 0, to_block: 100 };
        let err = client.get_logs(&filter).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }));
    }

    #[tokio::test]
    async fn batch_get_block_headers_preserves_order() {
        let transport = FakeTransport {
            logs_response: Mutex::new(None),
            headers: vec![header(100, "0xa", "0x0"), header(101, "0xb", "0xa"), header(102, "0xc", "0xb")],
        };
        let client = RpcClient::new(transport, vec![]);
        let headers = client.batch_get_block_headers(&[102, 100, 101]).await.unwrap();
        assert_eq!(headers.iter().map(|h| h.number).collect::<Vec<_>>(), vec![102, 100, 101]);
    }

    #[tokio::test]
    async fn header_source_impl_fetches_dense_range() {
        let transport = FakeTransport {
            logs_response: Mutex::new(None),
            headers: vec![header(100, "0xa", "0x0"), header(101, "0xb", "0xa")],
        };
        let client = RpcClient::new(transport, vec![]);
        let headers = client.headers_for_range(100, 101).await.unwrap();
        assert_eq!(headers.len(), 2);
    }
}
