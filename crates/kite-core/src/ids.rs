use sha2::{Digest, Sha256};

/// Returns a new identifier of the form `<prefix>_<32 hex chars>`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

/// Hashes the event dedup triple into a hex SHA-256 digest.
///
/// Components are joined with the ASCII unit separator so that
/// `("a", "bc", ..)` and `("ab", "c", ..)` never collide.
pub fn dedup_key(tenant_id: &str, event_type: &str, natural_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(event_type.as_bytes());
    hasher.update([0x1f]);
    hasher.update(natural_key.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
