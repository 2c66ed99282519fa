use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde_json::Value;

use super::{AddressSummary, BlockData, BlockTx, ProviderError, TxSlot};

const BASE_URL: &str = "https://api.blockchair.com/bitcoin";

/// Blockchair REST client.
pub struct BlockchairApi {
    base_url: String,
    client: Client,
    api_key: Option<String>,
}

impl BlockchairApi {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            client: Client::new(),
            api_key,
        }
    }

    pub fn name(&self) -> &'static str {
        "blockchair"
    }

    async fn get_json(&self, path: &str) -> Result<Value, ProviderError> {
        let mut url = format!("{}{}", self.base_url, path);
        if let Some(ref key) = self.api_key {
            let sep = if url.contains('?') { '&' } else { '?' };
            url.push(sep);
            url.push_str("key=");
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
        let json = self.get_json("/stats").await?;
        json["data"]["best_block_height"]
            .as_u64()
            .ok_or_else(|| ProviderError::InvalidResponse("missing best_block_height".into()))
    }

    pub async fn block(&self, height: u64) -> Result<BlockData, ProviderError> {
        let json = self
            .get_json(&format!("/dashboards/block/{height}?transaction_details=true"))
            .await?;
        let entry = &json["data"][height.to_string()];
        let block = &entry["block"];
        let hash = str_field(block, "hash")?;
        let parent_hash = str_field(block, "previous_block_hash")?;
        let time = block["time"]
            .as_str()
            .and_then(parse_blockchair_time)
            .ok_or_else(|| ProviderError::InvalidResponse("missing block time".into()))?;

        let mut transactions = Vec::new();
        for tx in entry["transactions"].as_array().into_iter().flatten() {
            transactions.push(BlockTx {
                txid: str_field(tx, "hash")?,
                inputs: parse_slots(&tx["inputs"]),
                outputs: parse_slots(&tx["outputs"]),
            });
        }

        Ok(BlockData { height, hash, parent_hash, time, transactions })
    }

    pub async fn address_info(&self, address: &str) -> Result<AddressSummary, ProviderError> {
        let json = self
            .get_json(&format!("/dashboards/address/{address}"))
            .await?;
        let data = &json["data"][address]["address"];
        if data.is_null() {
            return Err(ProviderError::InvalidResponse("missing address data".into()));
        }
        Ok(AddressSummary {
            address: address.to_string(),
            balance: data["balance"].as_u64().unwrap_or(0),
            tx_count: data["transaction_count"].as_u64().unwrap_or(0),
            last_activity: data["last_seen"].as_str().and_then(parse_blockchair_time),
        })
    }
}

fn str_field(value: &Value, field: &str) -> Result<String, ProviderError> {
    value[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProviderError::InvalidResponse(format!("missing field {field}")))
}

/// Blockchair reports inputs/outputs as `{recipient, value}` pairs.
fn parse_slots(value: &Value) -> Vec<TxSlot> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .map(|slot| TxSlot {
            address: slot["recipient"].as_str().map(str::to_string),
            value: slot["value"].as_u64().unwrap_or(0),
        })
        .collect()
}

/// Timestamps come as "2024-05-01 12:30:00" in UTC.
fn parse_blockchair_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_blockchair_timestamps() {
        let dt = parse_blockchair_time("2024-05-01 12:30:00").unwrap();
        assert_eq!(dt.timestamp(), 1_714_566_600);
        assert!(parse_blockchair_time("not a date").is_none());
    }

    #[test]
    fn parses_slots_with_missing_recipients() {
        let raw = serde_json::json!([
            {"recipient": "1Abc", "value": 1000},
            {"value": 500},
        ]);
        let slots = parse_slots(&raw);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].address.as_deref(), Some("1Abc"));
        assert_eq!(slots[1].address, None);
        assert_eq!(slots[1].value, 500);
    }
}
