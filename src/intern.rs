//! Marker-text interning.
//!
//! Debug marker labels repeat every frame; downstream wants a stable 64-bit
//! key instead of the raw string on every event. The first time a text is
//! seen the caller announces the (key, text) pair through the sink, after
//! that only the key travels.

use std::collections::HashMap;
use std::sync::Mutex;

pub struct StringInterner {
    inner: Mutex<InternPool>,
}

struct InternPool {
    map: HashMap<String, u64>,
    next_key: u64,
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            // Key 0 is reserved so "no key" can never alias a real entry.
            inner: Mutex::new(InternPool {
                map: HashMap::new(),
                next_key: 1,
            }),
        }
    }

    /// Returns the stable key for `text` and whether this call interned it.
    pub fn intern(&self, text: &str) -> (u64, bool) {
        let mut pool = self.inner.lock().unwrap();
        if let Some(&key) = pool.map.get(text) {
            return (key, false);
        }
        let key = pool.next_key;
        pool.next_key += 1;
        pool.map.insert(text.to_string(), key);
        (key, true)
    }

    /// Forget every interned string. Called when a capture session ends so
    /// the next session re-announces its strings to a fresh consumer.
    pub fn clear(&self) {
        let mut pool = self.inner.lock().unwrap();
        pool.map.clear();
        pool.next_key = 1;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
