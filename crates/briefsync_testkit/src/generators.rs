//! Property-based test generators using proptest.
//!
//! Provides strategies for generating histories, navigation targets, codes
//! and schema deltas that respect the engine's invariants.

use briefsync_protocol::{Code, PropertyType, SchemaChange, SchemaDelta};
use proptest::prelude::*;

/// Strategy for history lengths worth walking.
pub fn history_len_strategy() -> impl Strategy<Value = u64> {
    1u64..8
}

/// Strategy for `(history length, reverse target, reinstate target)` with
/// `reverse <= reinstate <= length`.
pub fn navigation_strategy() -> impl Strategy<Value = (u64, u64, u64)> {
    history_len_strategy().prop_flat_map(|len| {
        (Just(len), 0..=len).prop_flat_map(|(len, reverse_to)| {
            (Just(len), Just(reverse_to), reverse_to..=len)
        })
    })
}

/// Strategy for property types.
pub fn property_type_strategy() -> impl Strategy<Value = PropertyType> {
    prop_oneof![
        Just(PropertyType::Integer),
        Just(PropertyType::Double),
        Just(PropertyType::String),
        Just(PropertyType::Boolean),
    ]
}

/// Strategy for codes in a small value space, so collisions happen.
pub fn code_strategy() -> impl Strategy<Value = Code> {
    (0u8..16).prop_map(|n| Code::new("tag", "site", format!("T-{n}")))
}

/// Strategy for purely additive schema deltas.
pub fn additive_delta_strategy() -> impl Strategy<Value = SchemaDelta> {
    (
        1u32..5,
        prop::collection::vec(
            (
                prop::string::string_regex("[A-Z][a-z]{2,6}").expect("Invalid regex"),
                prop::string::string_regex("[a-z]{2,8}").expect("Invalid regex"),
                property_type_strategy(),
            ),
            1..4,
        ),
    )
        .prop_map(|(version, props)| {
            props
                .into_iter()
                .fold(SchemaDelta::new("Plant", version), |delta, (class, property, ty)| {
                    delta.with_change(SchemaChange::AddProperty {
                        class,
                        property,
                        property_type: ty,
                    })
                })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn navigation_targets_are_ordered((len, reverse_to, reinstate_to) in navigation_strategy()) {
            prop_assert!(reverse_to <= reinstate_to);
            prop_assert!(reinstate_to <= len);
        }

        #[test]
        fn additive_deltas_are_additive(delta in additive_delta_strategy()) {
            prop_assert!(delta.is_additive());
            prop_assert!(!delta.changes.is_empty());
        }
    }
}
