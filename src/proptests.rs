//! Model-based tests: random operation sequences run against a `BTreeMap`
//! oracle with the same insert-if-absent semantics, followed by a full
//! iteration sweep and a structural invariant walk.
//!
//! Key generation is collision-biased: most keys are a stem from a small
//! pool plus a short tail over a tiny alphabet, so a sequence keeps
//! revisiting the same paths and drives every shape a write can take —
//! landing exactly on a node, ending inside a compressed edge, forking off
//! one, and hanging a fresh child off a branch.

use std::collections::BTreeMap;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::ByteTrie;

/// Stem pool. Several entries are prefixes of one another so splits and
/// merges happen at predictable depths; zero bytes are ordinary key bytes.
const STEMS: &[&[u8]] = &[
    b"",
    b"ax",
    b"axis",
    b"axiom",
    b"bolt",
    b"bolted",
    b"\x00",
    b"\x00\xff",
];

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    let stem = (0..STEMS.len()).prop_map(|i| STEMS[i]);
    let tail = prop::collection::vec(prop_oneof![Just(b'x'), Just(b'y'), Just(0u8)], 0..6);
    prop_oneof![
        4 => (stem, tail).prop_map(|(s, t)| {
            let mut key = s.to_vec();
            key.extend(t);
            key
        }),
        // A sprinkle of arbitrary keys so coverage is not limited to the pool.
        1 => prop::collection::vec(any::<u8>(), 0..24),
    ]
}

#[derive(Arbitrary, Debug, Clone)]
enum Op {
    #[proptest(weight = 4)]
    Insert(#[proptest(strategy = "key_strategy()")] Vec<u8>, u64),
    #[proptest(weight = 3)]
    Remove(#[proptest(strategy = "key_strategy()")] Vec<u8>),
    #[proptest(weight = 3)]
    Get(#[proptest(strategy = "key_strategy()")] Vec<u8>),
    #[proptest(weight = 2)]
    Prefix(#[proptest(strategy = "key_strategy()")] Vec<u8>),
    Clear,
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn random_ops_match_btreemap_oracle(ops in prop::collection::vec(any::<Op>(), 1..80)) {
        let mut trie: ByteTrie<u64> = ByteTrie::new();
        let mut oracle: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(key, value) => {
                    let fresh = trie.insert(&key, value);
                    prop_assert_eq!(fresh, !oracle.contains_key(&key));
                    if fresh {
                        oracle.insert(key, value);
                    }
                }
                Op::Remove(key) => {
                    prop_assert_eq!(trie.remove(&key), oracle.remove(&key));
                }
                Op::Get(key) => {
                    prop_assert_eq!(trie.get(&key), oracle.get(&key).copied());
                }
                Op::Prefix(p) => {
                    let got = trie.prefix(&p);
                    let want: Vec<(Vec<u8>, u64)> = oracle
                        .iter()
                        .filter(|(k, _)| k.starts_with(&p))
                        .map(|(k, v)| (k.clone(), *v))
                        .collect();
                    prop_assert_eq!(got, want);
                }
                Op::Clear => {
                    trie.clear();
                    oracle.clear();
                }
            }
            prop_assert_eq!(trie.len(), oracle.len());
            prop_assert_eq!(trie.is_empty(), oracle.is_empty());
        }

        let got: Vec<_> = trie.iter().map(|(k, v)| (k, *v)).collect();
        let want: Vec<_> = oracle.iter().map(|(k, v)| (k.clone(), *v)).collect();
        prop_assert_eq!(got, want);
        crate::tests::check_invariants(&mut trie);
    }
}
