// Shared helpers used across layers.

pub mod id;

pub use id::db_id;
