//! Chain data decoded from JSON-RPC responses
//!
//! Blocks, transactions, receipts and logs carry only the fields the
//! detector needs; everything else in the node's response is ignored.
//!
//! Block decoding is lenient at the transaction level: a transaction
//! object that fails to decode is kept as a `None` slot so the detector
//! can count and skip it without losing the rest of the block.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// A fetched block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockView {
    #[serde(deserialize_with = "deserialize_hex_u64")]
    pub number: u64,

    #[serde(deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    /// Unix seconds
    #[serde(deserialize_with = "deserialize_hex_u64")]
    pub timestamp: u64,

    /// Absent before London
    #[serde(default, deserialize_with = "deserialize_hex_u256_opt")]
    pub base_fee_per_gas: Option<U256>,

    /// Transactions in block order. `None` marks an entry that could not be decoded.
    ///
    /// Blocks fetched without full transactions carry only hashes, which are
    /// not kept here.
    #[serde(default, deserialize_with = "deserialize_lenient_transactions")]
    pub transactions: Vec<Option<Transaction>>,
}

impl BlockView {
    /// Number of transaction slots that failed to decode.
    pub fn malformed_count(&self) -> usize {
        self.transactions.iter().filter(|tx| tx.is_none()).count()
    }
}

/// One transaction of a full block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    #[serde(deserialize_with = "deserialize_hex_address")]
    pub from: Address,

    /// `None` for a creation transaction
    #[serde(default, deserialize_with = "deserialize_hex_address_opt")]
    pub to: Option<Address>,

    #[serde(default, deserialize_with = "deserialize_hex_u256_opt")]
    pub gas_price: Option<U256>,

    #[serde(default, deserialize_with = "deserialize_hex_u256_opt")]
    pub max_fee_per_gas: Option<U256>,

    #[serde(default, deserialize_with = "deserialize_hex_u256_opt")]
    pub max_priority_fee_per_gas: Option<U256>,

    /// Call data, or init code for a creation
    #[serde(default, deserialize_with = "deserialize_hex_bytes")]
    pub input: Vec<u8>,
}

impl Transaction {
    /// Priced with a flat `gasPrice`.
    pub fn is_legacy(&self) -> bool {
        self.gas_price.is_some() && self.max_fee_per_gas.is_none()
    }

    /// Priced with fee caps (type 2 and later).
    pub fn is_eip1559(&self) -> bool {
        self.max_fee_per_gas.is_some()
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }

    /// Whether the transaction carries call data.
    pub fn has_input(&self) -> bool {
        !self.input.is_empty()
    }
}

/// Event emitted during execution.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Emitting contract
    #[serde(deserialize_with = "deserialize_hex_address")]
    pub address: Address,

    /// topic0 is the event signature hash
    #[serde(default, deserialize_with = "deserialize_topics")]
    pub topics: Vec<B256>,

    #[serde(default, deserialize_with = "deserialize_hex_bytes")]
    pub data: Vec<u8>,
}

/// Outcome of an included transaction.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// Transaction status: 1 = success, 0 = failure.
    ///
    /// Pre-Byzantium receipts carry a state root instead and decode as `None`.
    #[serde(default, deserialize_with = "deserialize_hex_u64_opt")]
    pub status: Option<u64>,

    /// Address of the contract created by a creation transaction
    #[serde(default, deserialize_with = "deserialize_hex_address_opt")]
    pub contract_address: Option<Address>,

    #[serde(deserialize_with = "deserialize_hex_u256")]
    pub gas_used: U256,

    /// Price actually paid per gas; missing on some older nodes
    #[serde(default, deserialize_with = "deserialize_hex_u256_opt")]
    pub effective_gas_price: Option<U256>,

    /// Empty when the transaction reverted
    #[serde(default)]
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Anything but an explicit `0x0` status counts as success.
    pub fn is_success(&self) -> bool {
        self.status != Some(0)
    }

    pub fn is_failure(&self) -> bool {
        self.status == Some(0)
    }
}

/// Decode a `0x`-prefixed quantity into a u64.
pub fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Err("empty hex quantity".to_string());
    }
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex quantity {s}: {e}"))
}

/// Decode a `0x`-prefixed byte string, tolerating odd lengths.
pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Ok(Vec::new());
    }
    let decoded = if digits.len() % 2 == 1 {
        hex::decode(format!("0{digits}"))
    } else {
        hex::decode(digits)
    };
    decoded.map_err(|e| format!("invalid hex data: {e}"))
}

fn parse_fixed<const N: usize>(s: &str, what: &str) -> Result<[u8; N], String> {
    let bytes = parse_hex_bytes(s)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("Expected {} bytes for {}, got {}", N, what, b.len()))
}

/// Parse a 20-byte address from a hex string.
pub fn parse_address(s: &str) -> Result<Address, String> {
    parse_fixed::<20>(s, "address").map(Address::from)
}

/// Parse a 32-byte hash from a hex string.
pub fn parse_b256(s: &str) -> Result<B256, String> {
    parse_fixed::<32>(s, "hash").map(B256::from)
}

fn deserialize_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_hex_u64(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_hex_u64_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| parse_hex_u64(&raw))
        .transpose()
        .map_err(serde::de::Error::custom)
}

/// Quantities wider than 32 bytes are rejected.
fn parse_hex_u256(s: &str) -> Result<U256, String> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() > 32 {
        return Err(format!("quantity {s} exceeds 256 bits"));
    }
    Ok(U256::from_be_slice(&bytes))
}

fn deserialize_hex_u256<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_hex_u256(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_hex_u256_opt<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|raw| parse_hex_u256(&raw))
        .transpose()
        .map_err(serde::de::Error::custom)
}

fn deserialize_hex_b256<'de, D>(deserializer: D) -> Result<B256, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_b256(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_hex_address<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_address(&raw).map_err(serde::de::Error::custom)
}

/// Deserialize an optional address. Both `null` and `"0x"` decode as `None`.
fn deserialize_hex_address_opt<'de, D>(deserializer: D) -> Result<Option<Address>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if s.strip_prefix("0x").unwrap_or(&s).is_empty() => Ok(None),
        Some(s) => parse_address(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

fn deserialize_hex_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    parse_hex_bytes(&s).map_err(serde::de::Error::custom)
}

fn deserialize_topics<'de, D>(deserializer: D) -> Result<Vec<B256>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    raw.iter()
        .map(|t| parse_b256(t).map_err(serde::de::Error::custom))
        .collect()
}

/// Decode each transaction object independently.
///
/// Hash-only entries (blocks fetched without full transactions) are dropped;
/// objects that fail to decode become `None`.
fn deserialize_lenient_transactions<'de, D>(
    deserializer: D,
) -> Result<Vec<Option<Transaction>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter(|v| !v.is_string())
        .map(|v| serde_json::from_value::<Transaction>(v).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_block() -> Value {
        json!({
            "number": "0x64",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "timestamp": "0x5f5e100",
            "baseFeePerGas": "0x3b9aca00",
            "transactions": [
                {
                    "hash": "0x2222222222222222222222222222222222222222222222222222222222222222",
                    "from": "0x0742d35cc6634c0532925a3b844bc9e7595f0beb",
                    "to": null,
                    "gasPrice": "0x4a817c800",
                    "input": "0x6080604052"
                },
                { "hash": "0xdead", "from": "0x01" },
                {
                    "hash": "0x3333333333333333333333333333333333333333333333333333333333333333",
                    "from": "0x0742d35cc6634c0532925a3b844bc9e7595f0beb",
                    "to": "0xdac17f958d2ee523a2206206994597c13d831ec7",
                    "input": "0x"
                }
            ]
        })
    }

    #[test]
    fn test_block_keeps_malformed_slots() {
        let block: BlockView = serde_json::from_value(sample_block()).unwrap();
        assert_eq!(block.number, 100);
        assert_eq!(block.timestamp, 100_000_000);
        assert_eq!(block.transactions.len(), 3);
        assert_eq!(block.malformed_count(), 1);

        let creation = block.transactions[0].as_ref().unwrap();
        assert!(creation.is_contract_creation());
        assert!(creation.is_legacy());
        assert_eq!(creation.input, vec![0x60, 0x80, 0x60, 0x40, 0x52]);

        let transfer = block.transactions[2].as_ref().unwrap();
        assert!(!transfer.is_contract_creation());
        assert!(!transfer.has_input());
    }

    #[test]
    fn test_hash_only_block_has_no_transactions() {
        let block: BlockView = serde_json::from_value(json!({
            "number": "0x1",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "timestamp": "0x0",
            "transactions": [
                "0x2222222222222222222222222222222222222222222222222222222222222222"
            ]
        }))
        .unwrap();
        assert!(block.transactions.is_empty());
        assert_eq!(block.base_fee_per_gas, None);
    }

    #[test]
    fn test_receipt_status_and_contract_address() {
        let receipt: Receipt = serde_json::from_value(json!({
            "status": "0x1",
            "contractAddress": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "gasUsed": "0x5208",
            "logs": [{
                "address": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
                "topics": ["0x0d3648bd0f6ba80134a33ba9275ac585d9d315f0ad8355cddefde31afa28d0e9"],
                "data": "0x"
            }]
        }))
        .unwrap();
        assert!(receipt.is_success());
        assert_eq!(receipt.gas_used, U256::from(21000u64));
        assert!(receipt.contract_address.is_some());
        assert_eq!(receipt.logs[0].topics.len(), 1);

        let failed: Receipt =
            serde_json::from_value(json!({ "status": "0x0", "gasUsed": "0x1" })).unwrap();
        assert!(failed.is_failure());
        assert_eq!(failed.contract_address, None);

        let legacy: Receipt = serde_json::from_value(json!({ "gasUsed": "0x1" })).unwrap();
        assert!(legacy.is_success());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_hex_u64("0x1a").unwrap(), 26);
        assert!(parse_hex_u64("0x").is_err());
        assert_eq!(parse_hex_bytes("0xabc").unwrap(), vec![0x0a, 0xbc]);
        assert!(parse_address("0x1234").is_err());
        let addr = parse_address("0x0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap();
        assert_eq!(format!("0x{:x}", addr), "0x0742d35cc6634c0532925a3b844bc9e7595f0beb");
    }
}
