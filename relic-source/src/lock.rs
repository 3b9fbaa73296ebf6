//! Session-level advisory locks.
//!
//! Advisory locks belong to the connection that took them, so the caller
//! must hold the same pooled client for the whole lock lifetime.

use deadpool_postgres::Client;

use crate::SourceError;

/// Map a lock key onto the 31-bit advisory lock space. Uses a SHA-256
/// prefix so every process computes the same id for the same key.
pub fn advisory_lock_id(lock_key: &str) -> i32 {
    let digest = openssl::sha::sha256(lock_key.as_bytes());
    let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (raw & 0x7fff_ffff) as i32
}

/// Non-blocking acquire; false means another session holds the lock.
pub async fn try_advisory_lock(client: &Client, lock_id: i32) -> Result<bool, SourceError> {
    let row = client
        .query_one("SELECT pg_try_advisory_lock($1)", &[&(lock_id as i64)])
        .await?;
    Ok(row.get::<_, bool>(0))
}

/// Release; false means the session did not hold the lock (already
/// released or the session was recycled).
pub async fn advisory_unlock(client: &Client, lock_id: i32) -> Result<bool, SourceError> {
    let row = client
        .query_one("SELECT pg_advisory_unlock($1)", &[&(lock_id as i64)])
        .await?;
    Ok(row.get::<_, bool>(0))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_ids_are_stable_and_non_negative() {
        let id = advisory_lock_id("database:app");
        assert_eq!(id, advisory_lock_id("database:app"));
        assert!(id >= 0);
        assert_ne!(id, advisory_lock_id("database:other"));
    }
}
