//! Property-based invariants for the Merkle AVL tree

use canopy_db::{Database, Error, MemoryStore};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn db() -> Database<MemoryStore> {
    Database::with_backend(MemoryStore::new())
}

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 1..6)
}

fn entry_strategy() -> impl Strategy<Value = Vec<(Vec<u8>, Vec<u8>)>> {
    proptest::collection::vec((key_strategy(), key_strategy()), 0..40)
}

/// Worst-case AVL height for `n` keys
fn height_bound(n: usize) -> f64 {
    1.4405 * ((n + 2) as f64).log2()
}

proptest! {
    #[test]
    fn in_order_keys_are_strictly_ascending(entries in entry_strategy()) {
        let db = db();
        for (key, value) in &entries {
            db.put(key, value).unwrap();
        }

        let keys = db.keys().unwrap();
        prop_assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn put_get_roundtrip_with_overwrites(entries in entry_strategy()) {
        let db = db();
        let mut expected = BTreeMap::new();
        for (key, value) in &entries {
            db.put(key, value).unwrap();
            expected.insert(key.clone(), value.clone());
        }

        prop_assert_eq!(db.len().unwrap(), expected.len());
        for (key, value) in &expected {
            prop_assert_eq!(&db.get(key).unwrap(), value);
        }
    }

    #[test]
    fn deleted_keys_become_unfindable(entries in entry_strategy()) {
        let db = db();
        let mut expected = BTreeMap::new();
        for (key, value) in &entries {
            db.put(key, value).unwrap();
            expected.insert(key.clone(), value.clone());
        }

        let doomed: Vec<Vec<u8>> = expected.keys().step_by(2).cloned().collect();
        for key in &doomed {
            db.delete(key).unwrap();
            expected.remove(key);
        }

        for key in &doomed {
            prop_assert!(matches!(db.get(key), Err(Error::KeyNotFound(_))));
        }
        for (key, value) in &expected {
            prop_assert_eq!(&db.get(key).unwrap(), value);
        }

        let keys = db.keys().unwrap();
        prop_assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn tree_height_stays_logarithmic(entries in entry_strategy()) {
        let db = db();
        for (key, value) in &entries {
            db.put(key, value).unwrap();
        }

        let n = db.len().unwrap();
        prop_assert!(f64::from(db.height().unwrap()) <= height_bound(n) + 1e-9);
    }

    #[test]
    fn identical_histories_produce_identical_root_hashes(entries in entry_strategy()) {
        let first = db();
        let second = db();
        for (key, value) in &entries {
            first.put(key, value).unwrap();
            second.put(key, value).unwrap();
        }

        prop_assert_eq!(first.root_hash().unwrap(), second.root_hash().unwrap());
    }

    #[test]
    fn changing_one_value_changes_the_root_hash(entries in entry_strategy()) {
        prop_assume!(!entries.is_empty());

        let db = db();
        for (key, value) in &entries {
            db.put(key, value).unwrap();
        }
        let before = db.root_hash().unwrap();

        // Perturb one live key with a value it cannot currently hold
        let (key, _) = &entries[0];
        let mut perturbed = db.get(key).unwrap();
        perturbed.push(0xFF);
        db.put(key, &perturbed).unwrap();

        prop_assert_ne!(db.root_hash().unwrap(), before);
    }
}
