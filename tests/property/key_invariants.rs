//! Property tests for structured key equality/hashing (spec §3, §4.1).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_query_cache::key::{Key, KeyPart, RecordBuilder, Scalar};
use proptest::prelude::*;

fn hash_of(key: &Key) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

fn arb_scalar() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        any::<String>().prop_map(Scalar::Str),
        any::<i64>().prop_map(Scalar::Int),
        any::<bool>().prop_map(Scalar::Bool),
    ]
}

fn arb_key_part() -> impl Strategy<Value = KeyPart> {
    arb_scalar().prop_map(KeyPart::Scalar)
}

proptest! {
    /// Equal keys must hash equally, for any mix of string/int/bool parts.
    #[test]
    fn equal_keys_hash_equally(parts in prop::collection::vec(arb_key_part(), 0..6)) {
        let a = Key::new(parts.clone());
        let b = Key::new(parts);
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(hash_of(&a), hash_of(&b));
    }

    /// A key always starts with itself and with any of its own leading
    /// slices, never with a slice longer than itself.
    #[test]
    fn key_starts_with_its_own_prefixes(parts in prop::collection::vec(arb_key_part(), 1..6)) {
        let full = Key::new(parts.clone());
        prop_assert!(full.starts_with(&full));
        for cut in 0..parts.len() {
            let prefix = Key::new(parts[..cut].to_vec());
            prop_assert!(full.starts_with(&prefix));
        }
        let too_long = Key::new({
            let mut longer = parts.clone();
            longer.push(KeyPart::from(0i64));
            longer
        });
        prop_assert!(!too_long.starts_with(&full) || full.len() == too_long.len());
    }

    /// Shuffling a record's fields before building never changes the key
    /// it produces, since `RecordBuilder::build` sorts by field name.
    #[test]
    fn record_field_order_never_changes_the_built_key(
        mut fields in prop::collection::vec(("[a-z]{1,8}", any::<i64>()), 1..6)
    ) {
        fields.sort();
        fields.dedup_by(|a, b| a.0 == b.0);

        let mut forward = RecordBuilder::new();
        for (name, value) in &fields {
            forward = forward.field(name.clone(), *value);
        }
        let forward_key = Key::new(vec![forward.build()]);

        let mut reversed = RecordBuilder::new();
        for (name, value) in fields.iter().rev() {
            reversed = reversed.field(name.clone(), *value);
        }
        let reversed_key = Key::new(vec![reversed.build()]);

        prop_assert_eq!(forward_key.clone(), reversed_key.clone());
        prop_assert_eq!(hash_of(&forward_key), hash_of(&reversed_key));
    }

    /// Appending any extra part to a key can never make it a prefix of a
    /// strictly shorter key.
    #[test]
    fn longer_key_is_never_a_prefix_of_a_shorter_one(
        parts in prop::collection::vec(arb_key_part(), 1..6),
        extra in arb_key_part(),
    ) {
        let short = Key::new(parts.clone());
        let mut longer_parts = parts;
        longer_parts.push(extra);
        let long = Key::new(longer_parts);
        prop_assert!(!short.starts_with(&long));
    }
}
