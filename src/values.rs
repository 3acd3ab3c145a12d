// ============================================================================
// Stored Values
// ============================================================================
//
// A within-transaction key/value scratchpad. Parent delegation (a child
// transaction seeing a value `set` on an ancestor) is implemented by the
// owning `Transaction`/`AsyncTransaction`, which holds the parent reference
// captured at prepare time; this type only owns the local map.
//
// ============================================================================

use std::collections::HashMap;

use serde_json::Value;

/// Local half of a transaction's `stored_values` scratchpad.
#[derive(Debug, Default, Clone)]
pub struct StoredValues {
    entries: HashMap<String, Value>,
}

impl StoredValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites (or inserts) the local entry for `name`.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.entries.insert(name.into(), value);
    }

    /// Returns a deep copy of the local entry for `name`, if present.
    ///
    /// `serde_json::Value` has no interior mutability, so `Value::clone()`
    /// already satisfies "mutating the returned copy never affects the
    /// stored value".
    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.entries.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_round_trips() {
        let mut values = StoredValues::new();
        values.set("key", json!("value"));
        assert_eq!(values.get_local("key"), Some(json!("value")));
    }

    #[test]
    fn mutating_returned_copy_does_not_leak_back() {
        let mut values = StoredValues::new();
        values.set("key", json!([1, 2, 3]));
        let mut copy = values.get_local("key").unwrap();
        copy.as_array_mut().unwrap().push(json!(4));
        assert_eq!(values.get_local("key"), Some(json!([1, 2, 3])));
    }

    #[test]
    fn missing_key_is_none() {
        let values = StoredValues::new();
        assert_eq!(values.get_local("nope"), None);
    }
}
