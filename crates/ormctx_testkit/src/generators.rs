//! Property-based test generators using proptest.

use ormctx_codec::Value;
use proptest::prelude::*;

/// Strategy for identifiers: small integers or short text.
pub fn id_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        (0i64..64).prop_map(Value::Integer),
        "[a-z]{1,6}".prop_map(Value::Text),
    ]
}

/// Strategy for flat entity states of the given length.
pub fn state_strategy(len: usize) -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            "[a-z ]{0,12}".prop_map(Value::Text),
        ],
        len,
    )
}

/// One step against a persistence context holding `Author` records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextOp {
    /// Add a managed author with this id.
    Add(i64),
    /// Remove the entity and entry of this id.
    Remove(i64),
    /// Register a proxy for this id.
    Proxy(i64),
    /// Flip the read-only state of this id.
    ReadOnly(i64, bool),
    /// Evict a natural id resolution for this id.
    Evict(i64),
    /// Clear the whole context.
    Clear,
}

/// Strategy for operation sequences over a small id space.
pub fn context_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<ContextOp>> {
    let op = prop_oneof![
        6 => (0i64..12).prop_map(ContextOp::Add),
        3 => (0i64..12).prop_map(ContextOp::Remove),
        3 => (0i64..12).prop_map(ContextOp::Proxy),
        2 => ((0i64..12), any::<bool>()).prop_map(|(id, ro)| ContextOp::ReadOnly(id, ro)),
        1 => (0i64..12).prop_map(ContextOp::Evict),
        1 => Just(ContextOp::Clear),
    ];
    prop::collection::vec(op, 0..max_len)
}
