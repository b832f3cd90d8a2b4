//! Chain query client.
//!
//! Both nodeos and rodeos serve the same two read-only endpoints used by the harness:
//! `GET /v1/chain/get_info` and `POST /v1/chain/get_block`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

const PATH_GET_INFO: &str = "v1/chain/get_info";
const PATH_GET_BLOCK: &str = "v1/chain/get_block";
/// The timeout applied to every individual query.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The status of a chain or replica, as reported by `get_info`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChainInfo {
    #[serde(default)]
    pub head_block_num: Option<u32>,
    #[serde(default)]
    pub last_irreversible_block_num: Option<u32>,
    #[serde(default)]
    pub head_block_id: Option<String>,
    #[serde(default)]
    pub chain_id: Option<String>,
}

impl ChainInfo {
    /// The reported head block number, which every well-formed status carries.
    pub fn head(&self, endpoint: &str) -> ClusterResult<u32> {
        self.head_block_num.ok_or_else(|| ClusterError::MalformedResponse {
            endpoint: endpoint.to_string(),
            detail: "get_info response does not contain head_block_num".into(),
        })
    }
}

/// A block as reported by `get_block`. Every field is absent when the block is not materialized.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct BlockInfo {
    #[serde(default)]
    pub block_num: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
}

impl BlockInfo {
    /// A materialized block with the given number.
    pub fn materialized(block_num: u32) -> Self {
        Self { block_num: Some(block_num), ..Default::default() }
    }
}

#[derive(Serialize)]
struct GetBlockRequest {
    block_num_or_id: u32,
}

/// The read-only query surface of a chain node or replica.
#[async_trait]
pub trait QueryApi: Send + Sync {
    /// A human readable description of the queried endpoint.
    fn endpoint(&self) -> &str;

    /// Query the status of the node.
    async fn get_info(&self) -> ClusterResult<ChainInfo>;

    /// Query a single block by number.
    async fn get_block(&self, block_num: u32) -> ClusterResult<BlockInfo>;
}

/// A `QueryApi` implementation over HTTP.
#[derive(Clone)]
pub struct HttpQueryClient {
    client: reqwest::Client,
    /// The base URL, always ending with a `/`.
    base_url: String,
}

impl HttpQueryClient {
    /// Create a new instance for the given `host:port` address.
    pub fn new(addr: &str) -> ClusterResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ClusterError::Other(anyhow::Error::from(err).context("error building HTTP client")))?;
        Ok(Self { client, base_url: format!("http://{}/", addr) })
    }

    fn query_error(&self, err: reqwest::Error) -> ClusterError {
        ClusterError::Query { endpoint: self.base_url.clone(), detail: err.to_string() }
    }
}

#[async_trait]
impl QueryApi for HttpQueryClient {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn get_info(&self) -> ClusterResult<ChainInfo> {
        let body = self
            .client
            .get(format!("{}{}", self.base_url, PATH_GET_INFO))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| self.query_error(err))?
            .text()
            .await
            .map_err(|err| self.query_error(err))?;
        serde_json::from_str(&body).map_err(|err| ClusterError::MalformedResponse {
            endpoint: self.base_url.clone(),
            detail: format!("error decoding get_info body {:?}: {}", body, err),
        })
    }

    async fn get_block(&self, block_num: u32) -> ClusterResult<BlockInfo> {
        let body = self
            .client
            .post(format!("{}{}", self.base_url, PATH_GET_BLOCK))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&GetBlockRequest { block_num_or_id: block_num })
            .send()
            .await
            .map_err(|err| self.query_error(err))?
            .text()
            .await
            .map_err(|err| self.query_error(err))?;
        // Unknown blocks come back as an error document or an empty body, both mean absent.
        Ok(serde_json::from_str(&body).unwrap_or_else(|err| {
            tracing::trace!(endpoint = %self.base_url, block_num, error = ?err, "treating undecodable get_block body as absent");
            BlockInfo::default()
        }))
    }
}
