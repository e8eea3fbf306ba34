use uuid::Uuid;

/// Generate a database row id.
///
/// UUIDv7 keeps ids roughly time-ordered, which keeps the `run` table's
/// `(endpoint_id, started_at DESC)` index friendly to recent-first scans.
pub fn db_id() -> Uuid {
    Uuid::now_v7()
}
