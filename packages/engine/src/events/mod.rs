// Events - at-least-once event consumption.
//
// External systems (payment webhooks today) deliver events at least once;
// the processed-event ledger makes handling idempotent.

pub mod webhook;

pub use webhook::{InMemoryProcessedEvents, PostgresProcessedEvents, ProcessedEventStore, WebhookEvent};
