//! Verified bytecode cache
//!
//! In-memory cache of runtime bytecode the detector has already fetched,
//! so factory logs and CREATE2 candidates that repeat an address within a
//! batch do not cost another `eth_getCode` round trip.
//!
//! Strategy:
//! - Non-empty code is cached (deployed code does not change)
//! - Empty code is never cached (the address could be deployed to later)

use alloy_primitives::Address;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Default number of addresses kept before the cache is reset.
pub const DEFAULT_CODE_CACHE_CAPACITY: usize = 4_096;

/// Shared cache of verified bytecode, keyed by address.
///
/// When full the cache is cleared wholesale; entries are cheap to refetch.
pub struct CodeCache {
    entries: Mutex<HashMap<Address, Arc<Vec<u8>>>>,
    capacity: usize,
}

impl CodeCache {
    /// Create a new empty cache.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Cached bytecode for `addr`, if any.
    pub fn get(&self, addr: Address) -> Option<Arc<Vec<u8>>> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&addr).cloned())
    }

    /// Remember the bytecode found at `addr`. Empty code is ignored.
    pub fn insert(&self, addr: Address, code: Arc<Vec<u8>>) {
        if code.is_empty() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= self.capacity && !entries.contains_key(&addr) {
                entries.clear();
            }
            entries.insert(addr, code);
        }
    }

    /// Number of cached addresses.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_cache_operations() {
        let cache = CodeCache::new(8);
        let addr1 = address!("0000000000000000000000000000000000000001");
        let addr2 = address!("0000000000000000000000000000000000000002");

        // Initially not cached
        assert!(cache.get(addr1).is_none());

        cache.insert(addr1, Arc::new(vec![0x60, 0x00]));
        assert_eq!(cache.get(addr1).unwrap().as_slice(), &[0x60, 0x00]);

        // Empty code is never cached
        cache.insert(addr2, Arc::new(Vec::new()));
        assert!(cache.get(addr2).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_resets_when_full() {
        let cache = CodeCache::new(2);
        for i in 1..=3u8 {
            let mut bytes = [0u8; 20];
            bytes[19] = i;
            cache.insert(Address::from(bytes), Arc::new(vec![i]));
        }
        assert_eq!(cache.len(), 1);
    }
}
