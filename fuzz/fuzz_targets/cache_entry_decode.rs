#![no_main]

use std::sync::Arc;
use std::time::Duration;

use embellish_core::cache::{CacheEntry, TtlCache};
use embellish_core::clock::ManualClock;
use embellish_core::store::{KeyValueStore, MemoryStore};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Anything that decodes must decode again after a re-encode.
    if let Ok(entry) = CacheEntry::decode(text) {
        let encoded = entry.encode().expect("decoded entry re-encodes");
        let again = CacheEntry::decode(&encoded).expect("encoded entry decodes");
        assert_eq!(entry.stored_at, again.stored_at);
        assert_eq!(entry.data.is_null(), again.data.is_null());
    }

    // Whatever sits in the store, reads and cleanup never panic, and an
    // unreadable entry is gone after cleanup.
    let store = Arc::new(MemoryStore::new());
    store.set("f_key", text).expect("unbounded store accepts writes");
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let cache = TtlCache::new(store.clone(), clock, "f_", Duration::from_secs(60));

    let readable = cache.get("key").is_some();
    let _ = cache.entries();
    let _ = cache.stats();
    cache.cleanup(false);
    if !readable {
        assert_eq!(store.get("f_key").expect("memory store read"), None);
    }
});
