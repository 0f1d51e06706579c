//! UUID utilities.
//!
//! Records created at runtime (projects, documents, runs, overlays, events)
//! use UUIDv7 so that identifiers sort by creation time. Blocks are the
//! exception: their identifiers are derived with UUIDv5 from the owning
//! representation and the block's order index, so that extraction is
//! reproducible down to the identifier.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use docket_core::uuid_utils::new_v7;
///
/// let a = new_v7();
/// let b = new_v7();
/// assert!(b > a);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Deterministic block identifier for `order_index` within a representation.
pub fn block_id(representation_id: Uuid, order_index: i32) -> Uuid {
    Uuid::new_v5(&representation_id, &order_index.to_be_bytes())
}

/// Extract the timestamp from a UUIDv7.
///
/// Returns `None` if the UUID is not version 7.
pub fn extract_timestamp(uuid: &Uuid) -> Option<DateTime<Utc>> {
    if !is_v7(uuid) {
        return None;
    }
    let bytes = uuid.as_bytes();
    let millis = ((bytes[0] as u64) << 40)
        | ((bytes[1] as u64) << 32)
        | ((bytes[2] as u64) << 24)
        | ((bytes[3] as u64) << 16)
        | ((bytes[4] as u64) << 8)
        | (bytes[5] as u64);

    Utc.timestamp_millis_opt(millis as i64).single()
}

/// Check if a UUID is version 7.
#[inline]
pub fn is_v7(uuid: &Uuid) -> bool {
    uuid.get_version_num() == 7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_v7_is_v7() {
        let id = new_v7();
        assert!(is_v7(&id));
    }

    #[test]
    fn test_extract_timestamp_close_to_now() {
        let before = Utc::now();
        let id = new_v7();
        let ts = extract_timestamp(&id).unwrap();
        assert!((ts - before).num_seconds().abs() < 2);
    }

    #[test]
    fn test_extract_timestamp_rejects_v4() {
        assert!(extract_timestamp(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_block_id_is_deterministic() {
        let rep = new_v7();
        assert_eq!(block_id(rep, 0), block_id(rep, 0));
        assert_ne!(block_id(rep, 0), block_id(rep, 1));
        assert_ne!(block_id(rep, 0), block_id(new_v7(), 0));
        assert_eq!(block_id(rep, 3).get_version_num(), 5);
    }
}
