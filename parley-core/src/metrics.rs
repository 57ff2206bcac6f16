// ABOUTME: Dispatcher counters and histograms recorded through the `metrics` facade
// ABOUTME: An exporter installed by the binary decides where they go

use crate::entity::EntityKind;
use std::time::Duration;

pub const MESSAGES_DISPATCHED: &str = "parley_messages_dispatched_total";
pub const COMMANDS_EXECUTED: &str = "parley_commands_executed_total";
pub const HANDLER_FAILURES: &str = "parley_handler_failures_total";
pub const CACHE_HITS: &str = "parley_entity_cache_hits_total";
pub const CACHE_MISSES: &str = "parley_entity_cache_misses_total";
pub const ENTITY_FLUSHES: &str = "parley_entity_flushes_total";
pub const DISPATCH_DURATION: &str = "parley_dispatch_duration_seconds";

pub fn record_message_dispatched(platform: &str) {
    metrics::counter!(MESSAGES_DISPATCHED, "platform" => platform.to_string()).increment(1);
}

pub fn record_command_executed(command: &str) {
    metrics::counter!(COMMANDS_EXECUTED, "command" => command.to_string()).increment(1);
}

/// `kind` is "handler" or "isolated_next"
pub fn record_handler_failure(kind: &'static str) {
    metrics::counter!(HANDLER_FAILURES, "kind" => kind).increment(1);
}

pub fn record_cache_hit(kind: EntityKind) {
    metrics::counter!(CACHE_HITS, "table" => kind.table().as_str()).increment(1);
}

pub fn record_cache_miss(kind: EntityKind) {
    metrics::counter!(CACHE_MISSES, "table" => kind.table().as_str()).increment(1);
}

pub fn record_flush(kind: EntityKind) {
    metrics::counter!(ENTITY_FLUSHES, "table" => kind.table().as_str()).increment(1);
}

pub fn record_dispatch_duration(elapsed: Duration) {
    metrics::histogram!(DISPATCH_DURATION).record(elapsed.as_secs_f64());
}
