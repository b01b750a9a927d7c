//! Content-derived idempotency keys

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// Deterministic idempotency key for a record.
///
/// Lowercase hex SHA-256 over the interface name, the source adapter
/// instance and the record's fields in sorted field order. Field insertion
/// order never affects the key, so the same record re-read from a source
/// always maps to the same key.
pub fn idempotency_key(
    record: &HashMap<String, String>,
    interface_name: &str,
    source_instance: Option<Uuid>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(interface_name.as_bytes());
    hasher.update([0x1f]);
    if let Some(instance) = source_instance {
        hasher.update(instance.as_bytes());
    }
    hasher.update([0x1f]);

    let mut fields: Vec<(&String, &String)> = record.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in fields {
        // Separator bytes keep adjacent fields from colliding
        hasher.update(name.as_bytes());
        hasher.update([0x1e]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }

    hex::encode(hasher.finalize())
}
