use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;

use super::{AddressSummary, BlockData, BlockTx, ProviderError, TxSlot};

const BASE_URL: &str = "https://api.blockcypher.com/v1/btc/main";

/// BlockCypher REST client.
pub struct BlockCypherApi {
    base_url: String,
    client: Client,
    api_key: Option<String>,
}

impl BlockCypherApi {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            client: Client::new(),
            api_key,
        }
    }

    pub fn name(&self) -> &'static str {
        "blockcypher"
    }

    async fn get_json(&self, path: &str) -> Result<Value, ProviderError> {
        let mut url = format!("{}{}", self.base_url, path);
        if let Some(ref key) = self.api_key {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("token=");
            url.push_str(key);
        }
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            resp.json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(ProviderError::RateLimited)
        } else {
            Err(ProviderError::Network(format!("http status {status}")))
        }
    }

    pub async fn latest_height(&self) -> Result<u64, ProviderError> {
        let json = self.get_json("").await?;
        json["height"]
            .as_u64()
            .ok_or_else(|| ProviderError::InvalidResponse("missing chain height".into()))
    }

    pub async fn block(&self, height: u64) -> Result<BlockData, ProviderError> {
        let json = self
            .get_json(&format!("/blocks/{height}?includeTxs=true"))
            .await?;
        let hash = str_field(&json, "hash")?;
        let parent_hash = str_field(&json, "prev_block")?;
        let time = json["time"]
            .as_str()
            .and_then(parse_rfc3339)
            .ok_or_else(|| ProviderError::InvalidResponse("missing block time".into()))?;

        let mut transactions = Vec::new();
        for tx in json["txs"].as_array().into_iter().flatten() {
            transactions.push(BlockTx {
                txid: str_field(tx, "hash")?,
                inputs: parse_inputs(&tx["inputs"]),
                outputs: parse_outputs(&tx["outputs"]),
            });
        }

        Ok(BlockData { height, hash, parent_hash, time, transactions })
    }

    pub async fn address_info(&self, address: &str) -> Result<AddressSummary, ProviderError> {
        let json = self.get_json(&format!("/addrs/{address}/balance")).await?;
        if json["address"].is_null() {
            return Err(ProviderError::InvalidResponse("missing address data".into()));
        }
        Ok(AddressSummary {
            address: address.to_string(),
            balance: json["balance"].as_u64().unwrap_or(0),
            tx_count: json["n_tx"].as_u64().unwrap_or(0),
            // BlockCypher's balance endpoint doesn't report last activity.
            last_activity: None,
        })
    }
}

fn str_field(value: &Value, field: &str) -> Result<String, ProviderError> {
    value[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProviderError::InvalidResponse(format!("missing field {field}")))
}

/// BlockCypher inputs carry `addresses` and the spent prevout's `output_value`.
fn parse_inputs(value: &Value) -> Vec<TxSlot> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .map(|input| TxSlot {
            address: first_address(&input["addresses"]),
            value: input["output_value"].as_u64().unwrap_or(0),
        })
        .collect()
}

fn parse_outputs(value: &Value) -> Vec<TxSlot> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .map(|output| TxSlot {
            address: first_address(&output["addresses"]),
            value: output["value"].as_u64().unwrap_or(0),
        })
        .collect()
}

fn first_address(value: &Value) -> Option<String> {
    value
        .as_array()
        .and_then(|a| a.first())
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_block_time() {
        let dt = parse_rfc3339("2024-05-01T12:30:00Z").unwrap();
        assert_eq!(dt.timestamp(), 1_714_566_600);
        assert!(parse_rfc3339("garbage").is_none());
    }

    #[test]
    fn parses_inputs_and_outputs() {
        let inputs = serde_json::json!([
            {"addresses": ["1Spender"], "output_value": 7000},
            {"addresses": [], "output_value": 100},
        ]);
        let outputs = serde_json::json!([
            {"addresses": ["1Payee"], "value": 6500},
        ]);
        let parsed_in = parse_inputs(&inputs);
        assert_eq!(parsed_in[0].address.as_deref(), Some("1Spender"));
        assert_eq!(parsed_in[1].address, None);
        let parsed_out = parse_outputs(&outputs);
        assert_eq!(parsed_out[0].value, 6500);
    }
}
