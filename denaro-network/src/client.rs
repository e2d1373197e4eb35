//! The HTTP interface to one peer node.
//!
//! Every request carries the `Sender-Node` header so peers can discover us
//! back. Ordinary requests time out after three seconds, bulk block
//! fetches after ten.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use denaro_chain::amount::Amount;
use denaro_chain::block::{self, Difficulty};

/// Default timeout for peer requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
/// Timeout for bulk endpoints (`get_blocks`).
pub const BULK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum PeerError {
    /// The peer did not answer in time. Demotes, never removes.
    #[error("peer timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// The peer answered with something that does not parse. Removes.
    #[error("peer sent malformed data: {0}")]
    Malformed(String),
    /// The peer answered `ok: false`.
    #[error("peer refused: {0}")]
    Refused(String),
}

impl From<reqwest::Error> for PeerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PeerError::Timeout
        } else if e.is_decode() {
            PeerError::Malformed(e.to_string())
        } else {
            PeerError::Transport(e)
        }
    }
}

/// The `{ok, result, error}` JSON envelope every RPC route answers with.
#[derive(Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

/// What `GET /` returns: enough to test liveness and compare state.
#[derive(Deserialize)]
pub struct NodeStatus {
    pub version: u32,
    pub unspent_outputs_hash: String,
}

/// A block as a remote peer reports it. Only the header fields matter:
/// sync rebuilds the content bytes and revalidates locally.
#[derive(Clone, Debug, Deserialize)]
pub struct RemoteBlock {
    pub id: u32,
    pub hash: block::Hash,
    pub address: String,
    pub random: u32,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub reward: Amount,
    pub timestamp: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RemoteBlockResponse {
    pub block: RemoteBlock,
    #[serde(default)]
    pub transactions: Vec<String>,
}

pub struct NodeInterface {
    base_url: String,
    self_url: Option<String>,
    client: reqwest::Client,
}

impl NodeInterface {
    pub fn new(url: &str, self_url: Option<String>) -> NodeInterface {
        NodeInterface {
            base_url: url.trim_end_matches('/').to_string(),
            self_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T, PeerError> {
        let mut request = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .query(query)
            .timeout(timeout);
        if let Some(self_url) = &self.self_url {
            request = request.header("Sender-Node", self_url);
        }
        let response = request.send().await?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| PeerError::Malformed(e.to_string()))?;
        if !envelope.ok {
            return Err(PeerError::Refused(
                envelope.error.unwrap_or_else(|| "unspecified error".to_string()),
            ));
        }
        envelope
            .result
            .ok_or_else(|| PeerError::Malformed("ok response without a result".to_string()))
    }

    /// POSTs a JSON body to a gossip endpoint; only the `ok` flag matters.
    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<bool, PeerError> {
        let mut request = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .json(&body)
            .timeout(REQUEST_TIMEOUT);
        if let Some(self_url) = &self.self_url {
            request = request.header("Sender-Node", self_url);
        }
        let response = request.send().await?;
        let envelope: Envelope<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| PeerError::Malformed(e.to_string()))?;
        Ok(envelope.ok)
    }

    /// `GET /`, used for liveness checks and tip comparison.
    pub async fn get_status(&self) -> Result<NodeStatus, PeerError> {
        let mut request = self
            .client
            .get(format!("{}/", self.base_url))
            .timeout(Duration::from_secs(5));
        if let Some(self_url) = &self.self_url {
            request = request.header("Sender-Node", self_url);
        }
        let response = request.send().await?;
        response
            .json()
            .await
            .map_err(|e| PeerError::Malformed(e.to_string()))
    }

    pub async fn is_working(&self) -> bool {
        self.get_status().await.is_ok()
    }

    pub async fn get_block(&self, id: u32) -> Result<RemoteBlockResponse, PeerError> {
        self.get(
            "get_block",
            &[("block", id.to_string())],
            REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn get_blocks(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<RemoteBlockResponse>, PeerError> {
        self.get(
            "get_blocks",
            &[("offset", offset.to_string()), ("limit", limit.to_string())],
            BULK_TIMEOUT,
        )
        .await
    }

    pub async fn get_nodes(&self) -> Result<Vec<String>, PeerError> {
        self.get("get_nodes", &[], REQUEST_TIMEOUT).await
    }

    pub async fn push_tx(&self, tx_hex: &str) -> Result<bool, PeerError> {
        self.post("push_tx", serde_json::json!({ "tx_hex": tx_hex }))
            .await
    }

    pub async fn push_block(
        &self,
        block_content: &str,
        txs: &[String],
        id: u32,
    ) -> Result<bool, PeerError> {
        self.post(
            "push_block",
            serde_json::json!({
                "block_content": block_content,
                "txs": txs,
                "id": id,
            }),
        )
        .await
    }

    pub async fn add_node(&self, url: &str) -> Result<bool, PeerError> {
        self.post("add_node", serde_json::json!({ "url": url })).await
    }
}
