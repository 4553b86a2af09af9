#![cfg(test)]

// Property tests for SyncHashMap kept inside the crate so they can look at
// the snapshot and overlay directly.

use crate::sync_hash_map::{InsertError, SyncHashMap};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;

// Pool-indexed operations so shrinking walks toward earlier keys.
#[derive(Clone, Debug)]
enum Op {
    Store(usize, i32),
    Load(usize),
    LoadOrStore(usize, i32),
    LoadAndDelete(usize),
    Swap(usize, i32),
    CompareAndSwap(usize, i32, i32),
    CompareAndDelete(usize, i32),
    TryInsert(usize, i32),
    Contains(usize),
    Range,
    Clear,
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<Op>)> {
    proptest::collection::btree_set("[a-z]{1,4}", 1..=8).prop_flat_map(|pool| {
        let pool: Vec<String> = pool.into_iter().collect();
        let idx = 0..pool.len();
        // Small value domain so compare operations hit often.
        let val = 0i32..4;
        let op = prop_oneof![
            4 => (idx.clone(), val.clone()).prop_map(|(i, v)| Op::Store(i, v)),
            4 => idx.clone().prop_map(Op::Load),
            2 => (idx.clone(), val.clone()).prop_map(|(i, v)| Op::LoadOrStore(i, v)),
            3 => idx.clone().prop_map(Op::LoadAndDelete),
            2 => (idx.clone(), val.clone()).prop_map(|(i, v)| Op::Swap(i, v)),
            2 => (idx.clone(), val.clone(), val.clone()).prop_map(|(i, o, n)| Op::CompareAndSwap(i, o, n)),
            2 => (idx.clone(), val.clone()).prop_map(|(i, o)| Op::CompareAndDelete(i, o)),
            1 => (idx.clone(), val.clone()).prop_map(|(i, v)| Op::TryInsert(i, v)),
            2 => idx.clone().prop_map(Op::Contains),
            1 => Just(Op::Range),
            1 => Just(Op::Clear),
        ];
        proptest::collection::vec(op, 1..80).prop_map(move |ops| (pool.clone(), ops))
    })
}

// Structural invariants between the snapshot and the overlay:
// - The overlay exists exactly when the snapshot is amended.
// - While it exists, every non-expunged snapshot entry is shared with the
//   overlay under the same key, and expunged entries are absent from it.
// - The overlay never holds an expunged entry.
// - A non-amended snapshot holds no expunged entry.
fn check_structure<S>(sut: &SyncHashMap<String, i32, S>) -> Result<(), TestCaseError>
where
    S: BuildHasher + Clone,
{
    sut.inspect(|read, overlay| {
        let materialized = overlay.is_materialized();
        prop_assert_eq!(materialized, read.amended);
        for (k, e) in read.map.iter() {
            if !materialized {
                prop_assert!(!e.is_expunged(), "expunged entry {} in settled snapshot", k);
                continue;
            }
            match overlay.get(k.as_str()) {
                Some(o) => {
                    prop_assert!(!e.is_expunged(), "expunged entry {} in overlay", k);
                    prop_assert!(Arc::ptr_eq(o, e), "overlay entry for {} is not shared", k);
                }
                None => prop_assert!(e.is_expunged(), "non-expunged {} missing from overlay", k),
            }
        }
        Ok(())
    })?;
    sut.inspect(|_, overlay| {
        if overlay.is_materialized() {
            prop_assert!(overlay.misses() < overlay.len().max(1));
        } else {
            prop_assert_eq!(overlay.misses(), 0);
        }
        Ok(())
    })
}

// Sequential equivalence against std::collections::HashMap plus the
// structural invariants after every operation.
fn run_scenario<S>(
    sut: SyncHashMap<String, i32, S>,
    pool: &[String],
    ops: Vec<Op>,
) -> Result<(), TestCaseError>
where
    S: BuildHasher + Clone,
{
    let mut model: HashMap<String, i32> = HashMap::new();
    for op in ops {
        match op {
            Op::Store(i, v) => {
                sut.store(pool[i].clone(), v);
                model.insert(pool[i].clone(), v);
            }
            Op::Load(i) => {
                prop_assert_eq!(sut.load(pool[i].as_str()), model.get(&pool[i]).copied());
            }
            Op::LoadOrStore(i, v) => {
                let expected = match model.get(&pool[i]) {
                    Some(&cur) => (cur, true),
                    None => {
                        model.insert(pool[i].clone(), v);
                        (v, false)
                    }
                };
                prop_assert_eq!(sut.load_or_store(pool[i].clone(), v), expected);
            }
            Op::LoadAndDelete(i) => {
                prop_assert_eq!(sut.load_and_delete(pool[i].as_str()), model.remove(&pool[i]));
            }
            Op::Swap(i, v) => {
                prop_assert_eq!(sut.swap(pool[i].clone(), v), model.insert(pool[i].clone(), v));
            }
            Op::CompareAndSwap(i, old, new) => {
                let applies = model.get(&pool[i]) == Some(&old);
                if applies {
                    model.insert(pool[i].clone(), new);
                }
                prop_assert_eq!(sut.compare_and_swap(pool[i].as_str(), &old, new), applies);
            }
            Op::CompareAndDelete(i, old) => {
                let applies = model.get(&pool[i]) == Some(&old);
                if applies {
                    model.remove(&pool[i]);
                }
                prop_assert_eq!(sut.compare_and_delete(pool[i].as_str(), &old), applies);
            }
            Op::TryInsert(i, v) => {
                let present = model.contains_key(&pool[i]);
                match sut.try_insert(pool[i].clone(), v) {
                    Ok(()) => {
                        prop_assert!(!present, "try_insert must fail on a live key");
                        model.insert(pool[i].clone(), v);
                    }
                    Err(InsertError::DuplicateKey) => {
                        prop_assert!(present, "duplicate error only when key is live");
                    }
                }
            }
            Op::Contains(i) => {
                prop_assert_eq!(sut.contains_key(pool[i].as_str()), model.contains_key(&pool[i]));
            }
            Op::Range => {
                let mut seen = BTreeMap::new();
                let mut dup = false;
                sut.range(|k, v| {
                    dup |= seen.insert(k.clone(), *v).is_some();
                    true
                });
                prop_assert!(!dup, "range visited a key twice");
                let expected: BTreeMap<String, i32> =
                    model.iter().map(|(k, v)| (k.clone(), *v)).collect();
                prop_assert_eq!(seen, expected);
            }
            Op::Clear => {
                sut.clear();
                model.clear();
            }
        }
        check_structure(&sut)?;
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_scenario(SyncHashMap::new(), &pool, ops)?;
    }
}

// Collision variant using a constant hasher to stress equality resolution
// in both the snapshot and the overlay.
#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in arb_scenario()) {
        run_scenario(SyncHashMap::with_hasher(ConstBuildHasher), &pool, ops)?;
    }
}

// Property: a bounded read-only phase after writes always ends with every
// live key reachable from the snapshot, without the overlay.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_reads_eventually_promote((pool, ops) in arb_scenario()) {
        let sut: SyncHashMap<String, i32> = SyncHashMap::new();
        let mut model: HashMap<String, i32> = HashMap::new();
        for op in ops {
            if let Op::Store(i, v) = op {
                sut.store(pool[i].clone(), v);
                model.insert(pool[i].clone(), v);
            }
        }
        // Each read that reaches the overlay counts one miss; misses reach
        // the overlay length within that many reads.
        let missing = "not-in-pool-key";
        for _ in 0..=pool.len() {
            prop_assert_eq!(sut.load(missing), None);
        }
        prop_assert!(!sut.is_amended());
        prop_assert_eq!(sut.snapshot_len(), model.len());
        for (k, v) in &model {
            prop_assert_eq!(sut.load(k.as_str()), Some(*v));
        }
    }
}
