use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{ChainOracle, Receipt, ReceiptLog, TxHash};
use crate::error::OracleError;

/// Receipt lookups over Ethereum JSON-RPC (`eth_getTransactionReceipt`).
pub struct JsonRpcOracle {
    client: Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<RawReceipt>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: String,
    #[serde(default)]
    block_number: Option<String>,
    /// Post-Byzantium status: `0x1` success, `0x0` reverted.
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    logs: Vec<RawLog>,
}

#[derive(Debug, Deserialize)]
struct RawLog {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
}

impl JsonRpcOracle {
    pub fn new(url: impl Into<String>) -> Result<Self, OracleError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ChainOracle for JsonRpcOracle {
    async fn receipt(&self, tx_hash: &TxHash) -> Result<Option<Receipt>, OracleError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_getTransactionReceipt",
            "params": [tx_hash.as_str()],
        });

        let response = self.client.post(&self.url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(OracleError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<RpcResponse>().await?;
        if let Some(err) = body.error {
            return Err(OracleError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        body.result.map(Receipt::try_from).transpose()
    }
}

impl TryFrom<RawReceipt> for Receipt {
    type Error = OracleError;

    fn try_from(raw: RawReceipt) -> Result<Self, Self::Error> {
        let block_number = raw.block_number.as_deref().map(parse_quantity).transpose()?;
        let succeeded = match raw.status.as_deref() {
            Some(status) => parse_quantity(status)? == 1,
            None => {
                return Err(OracleError::InvalidResponse(
                    "receipt has no status field".into(),
                ));
            }
        };
        let logs = raw
            .logs
            .into_iter()
            .map(|log| ReceiptLog {
                address: log.address.to_ascii_lowercase(),
                topics: log
                    .topics
                    .iter()
                    .map(|topic| topic.to_ascii_lowercase())
                    .collect(),
            })
            .collect();
        Ok(Receipt {
            transaction_hash: raw.transaction_hash,
            block_number,
            succeeded,
            to: raw.to.map(|to| to.to_ascii_lowercase()),
            logs,
        })
    }
}

/// Parse a JSON-RPC hex quantity such as `0x1b4`.
fn parse_quantity(raw: &str) -> Result<u64, OracleError> {
    raw.strip_prefix("0x")
        .and_then(|digits| u64::from_str_radix(digits, 16).ok())
        .ok_or_else(|| OracleError::InvalidResponse(format!("bad hex quantity '{raw}'")))
}
