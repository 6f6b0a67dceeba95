//! XOR-masked in-memory session cache.
//!
//! Session state is hot on every send/receive, but plaintext secrets
//! must not sit in process memory between uses. The cache keeps each
//! serialized session only as a blob XOR-masked under a process-local
//! 256-bit mask. The mask never leaves the process, is rotated whenever
//! the cache is cleared, and a blob that fails to decode is ejected.
//!
//! Ciphertext-grade persistence is the secret store's job; this layer
//! only raises the bar against casual memory scraping.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::services::Random;

const MASK_LEN: usize = 32;

pub struct SessionCache {
    mask: RwLock<[u8; MASK_LEN]>,
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl SessionCache {
    pub fn new(random: &dyn Random) -> Self {
        Self {
            mask: RwLock::new(fresh_mask(random)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn put(&self, session_id: &str, serialized: &str) {
        let mask = *self.mask.read();
        let mut blob = serialized.as_bytes().to_vec();
        apply_mask(&mask, &mut blob);
        self.entries.write().insert(session_id.to_string(), blob);
    }

    /// Unmask and decode an entry. Undecodable entries are ejected.
    pub fn get(&self, session_id: &str) -> Option<String> {
        let mask = *self.mask.read();
        let mut blob = self.entries.read().get(session_id)?.clone();
        apply_mask(&mask, &mut blob);
        match String::from_utf8(blob) {
            Ok(serialized) => Some(serialized),
            Err(_) => {
                self.entries.write().remove(session_id);
                None
            }
        }
    }

    pub fn remove(&self, session_id: &str) {
        self.entries.write().remove(session_id);
    }

    /// Drop every entry and rotate the mask.
    pub fn clear(&self, random: &dyn Random) {
        self.entries.write().clear();
        *self.mask.write() = fresh_mask(random);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn fresh_mask(random: &dyn Random) -> [u8; MASK_LEN] {
    let mut mask = [0u8; MASK_LEN];
    random.fill(&mut mask);
    mask
}

fn apply_mask(mask: &[u8; MASK_LEN], blob: &mut [u8]) {
    for (i, byte) in blob.iter_mut().enumerate() {
        *byte ^= mask[i % MASK_LEN];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::OsRandom;

    #[test]
    fn roundtrip() {
        let cache = SessionCache::new(&OsRandom);
        cache.put("s1", r#"{"root_key":"abc"}"#);
        assert_eq!(cache.get("s1").unwrap(), r#"{"root_key":"abc"}"#);
    }

    #[test]
    fn stored_blob_is_not_plaintext() {
        let cache = SessionCache::new(&OsRandom);
        let secret = "very secret session state that is long enough to check";
        cache.put("s1", secret);
        let raw = cache.entries.read().get("s1").unwrap().clone();
        assert_ne!(raw.as_slice(), secret.as_bytes());
    }

    #[test]
    fn clear_rotates_mask_and_drops_entries() {
        let cache = SessionCache::new(&OsRandom);
        cache.put("s1", "state");
        let before = *cache.mask.read();
        cache.clear(&OsRandom);
        assert!(cache.is_empty());
        assert_ne!(*cache.mask.read(), before);
    }

    #[test]
    fn remove_ejects_entry() {
        let cache = SessionCache::new(&OsRandom);
        cache.put("s1", "state");
        cache.remove("s1");
        assert!(cache.get("s1").is_none());
    }
}
