//! Key encoding and decoding utilities
//!
//! All keys use a single-byte prefix followed by binary data. Every key is
//! scoped by network name, terminated with a 0x00 byte so one network's
//! keys never sort inside another's.

use crate::config::ScanMode;
use alloy_primitives::{Address, B256};

const NETWORK_TERMINATOR: u8 = 0x00;

/// Prefix shared by every key of one kind on one network.
///
/// Format: prefix byte + network name (UTF-8) + 0x00
pub fn network_prefix(prefix: u8, network: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(network.len() + 2);
    key.push(prefix);
    key.extend_from_slice(network.as_bytes());
    key.push(NETWORK_TERMINATOR);
    key
}

/// Encode a contract record key.
///
/// Format: byte 'C' (0x43) + network + 0x00 + address (20 bytes)
pub fn encode_contract_key(network: &str, addr: Address) -> Vec<u8> {
    let mut key = network_prefix(b'C', network);
    key.extend_from_slice(addr.as_slice());
    key
}

/// Encode a contract analysis key.
///
/// Format: byte 'A' (0x41) + network + 0x00 + address (20 bytes)
pub fn encode_analysis_key(network: &str, addr: Address) -> Vec<u8> {
    let mut key = network_prefix(b'A', network);
    key.extend_from_slice(addr.as_slice());
    key
}

/// Prefix of every fingerprint index key for one bytecode hash.
///
/// Format: byte 'F' (0x46) + network + 0x00 + fingerprint (32 bytes)
pub fn fingerprint_prefix(network: &str, fingerprint: B256) -> Vec<u8> {
    let mut key = network_prefix(b'F', network);
    key.extend_from_slice(fingerprint.as_slice());
    key
}

/// Encode a fingerprint index key. The value is empty; the key is the data.
///
/// Format: `fingerprint_prefix` + address (20 bytes)
pub fn encode_fingerprint_key(network: &str, fingerprint: B256, addr: Address) -> Vec<u8> {
    let mut key = fingerprint_prefix(network, fingerprint);
    key.extend_from_slice(addr.as_slice());
    key
}

/// Decode the trailing address of a contract, analysis or fingerprint key.
pub fn decode_key_address(key: &[u8]) -> Option<Address> {
    if key.len() < 21 {
        return None;
    }
    Some(Address::from_slice(&key[key.len() - 20..]))
}

/// Encode a checkpoint key.
///
/// Format: byte 'K' (0x4B) + network + 0x00 + mode tag (1 byte)
pub fn encode_checkpoint_key(network: &str, mode: ScanMode) -> Vec<u8> {
    let mut key = network_prefix(b'K', network);
    key.push(mode.tag());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    fn sample_addr() -> Address {
        Address::from_slice(&hex::decode("0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap())
    }

    #[test]
    fn test_contract_key_encoding() {
        let addr = sample_addr();
        let key = encode_contract_key("mainnet", addr);
        assert_eq!(key.len(), 1 + 7 + 1 + 20);
        assert_eq!(key[0], b'C');
        assert_eq!(&key[1..8], b"mainnet");
        assert_eq!(key[8], 0x00);
        assert_eq!(&key[9..], addr.as_slice());
        assert_eq!(decode_key_address(&key), Some(addr));
    }

    #[test]
    fn test_network_prefixes_do_not_overlap() {
        let addr = sample_addr();
        let base = encode_contract_key("base", addr);
        let base_sepolia = encode_contract_key("base-sepolia", addr);
        assert!(base.starts_with(&network_prefix(b'C', "base")));
        assert!(!base_sepolia.starts_with(&network_prefix(b'C', "base")));
    }

    #[test]
    fn test_fingerprint_key_encoding() {
        let addr = sample_addr();
        let fp = b256!("0000000000000000000000000000000000000000000000000000000000000001");
        let key = encode_fingerprint_key("mainnet", fp, addr);
        assert_eq!(key.len(), 1 + 7 + 1 + 32 + 20);
        assert_eq!(key[0], b'F');
        assert!(key.starts_with(&fingerprint_prefix("mainnet", fp)));
        assert_eq!(decode_key_address(&key), Some(addr));
    }

    #[test]
    fn test_checkpoint_key_per_mode() {
        let historical = encode_checkpoint_key("mainnet", ScanMode::Historical);
        let both = encode_checkpoint_key("mainnet", ScanMode::Both);
        assert_eq!(historical.len(), 10);
        assert_eq!(historical[0], b'K');
        assert_eq!(*historical.last().unwrap(), b'h');
        assert_ne!(historical, both);
    }

    #[test]
    fn test_decode_short_key() {
        assert_eq!(decode_key_address(&[b'C', 0x00]), None);
    }
}
