use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

#[derive(Debug)]
pub struct DbHolder {
    db: Db,
}

/// Handle to the shared keyspace. Cheap to clone; every connection task holds
/// one and all of them point at the same mutex-guarded map.
#[derive(Debug, Clone)]
pub struct Db {
    shared: Arc<Mutex<Store>>,
}

#[derive(Debug)]
struct Store {
    entries: HashMap<String, Entry>,
}

#[derive(Debug)]
struct Entry {
    value: Bytes,
    created_at: Instant,
    expiry: Option<Duration>,
}

impl DbHolder {
    pub fn new() -> DbHolder {
        DbHolder { db: Db::new() }
    }

    pub fn db(&self) -> Db {
        self.db.clone()
    }
}

impl Default for DbHolder {
    fn default() -> DbHolder {
        DbHolder::new()
    }
}

impl Db {
    pub fn new() -> Db {
        Db {
            shared: Arc::new(Mutex::new(Store {
                entries: HashMap::new(),
            })),
        }
    }

    /// Look up a key. An entry past its expiry is deleted here, inside the
    /// same critical section that observed it, so concurrent readers cannot
    /// race on the removal and a concurrent `set` cannot be clobbered.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut store = self.shared.lock().unwrap();

        let expired = store
            .entries
            .get(key)
            .map_or(false, |entry| entry.is_expired(Instant::now()));

        if expired {
            store.entries.remove(key);
            return None;
        }

        store.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Unconditionally overwrite `key`. `expiry` of `None` means the entry
    /// never expires.
    pub fn set(&self, key: String, value: Bytes, expiry: Option<Duration>) {
        let mut store = self.shared.lock().unwrap();

        store.entries.insert(
            key,
            Entry {
                value,
                created_at: Instant::now(),
                expiry,
            },
        );
    }
}

impl Default for Db {
    fn default() -> Db {
        Db::new()
    }
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expiry {
            Some(expiry) => now.duration_since(self.created_at) >= expiry,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn get_missing_key() {
        let db = Db::new();

        assert_eq!(db.get("absent"), None);
    }

    #[test]
    fn set_then_get() {
        let db = Db::new();

        db.set("k".to_string(), Bytes::from_static(b"v"), None);

        assert_eq!(db.get("k"), Some(Bytes::from_static(b"v")));
    }

    #[test]
    fn set_overwrites() {
        let db = Db::new();

        db.set("k".to_string(), Bytes::from_static(b"old"), None);
        db.set("k".to_string(), Bytes::from_static(b"new"), None);

        assert_eq!(db.get("k"), Some(Bytes::from_static(b"new")));
    }

    #[test]
    fn expiry_is_passive_and_idempotent() {
        let db = Db::new();

        db.set(
            "k".to_string(),
            Bytes::from_static(b"v"),
            Some(Duration::from_millis(40)),
        );

        assert_eq!(db.get("k"), Some(Bytes::from_static(b"v")));

        sleep(Duration::from_millis(60));

        assert_eq!(db.get("k"), None);
        // entry was deleted by the first expired read
        assert_eq!(db.get("k"), None);
    }

    #[test]
    fn overwrite_clears_expiry() {
        let db = Db::new();

        db.set(
            "k".to_string(),
            Bytes::from_static(b"v1"),
            Some(Duration::from_millis(40)),
        );
        db.set("k".to_string(), Bytes::from_static(b"v2"), None);

        sleep(Duration::from_millis(60));

        assert_eq!(db.get("k"), Some(Bytes::from_static(b"v2")));
    }
}
