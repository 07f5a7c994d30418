use crate::protocol::{GameStatePayload, Message, MessagePayload};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Install a `tracing` fmt subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}

/// Initialize debug mode from environment variables
///
/// - `PEERSYNC_DEBUG=1` or `PEERSYNC_DEBUG_JSON=1`: dump every message as pretty JSON
/// - `PEERSYNC_TRACE=1`: byte-level traces of serialization and transport operations
pub fn init_debug_mode() {
    let debug = env::var("PEERSYNC_DEBUG").is_ok() || env::var("PEERSYNC_DEBUG_JSON").is_ok();

    let trace = env::var("PEERSYNC_TRACE").is_ok();

    DEBUG_MODE.store(debug, Ordering::Relaxed);
    TRACE_MODE.store(trace, Ordering::Relaxed);

    if debug {
        tracing::info!("debug mode enabled - all messages will be logged as JSON");
    }

    if trace {
        tracing::info!("trace mode enabled - serialization and transport operations are traced");
    }
}

pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

/// Log a message in JSON format if debug mode is enabled
pub fn log_message(direction: &str, peer_id: &str, message: &Message) {
    if !is_debug_enabled() {
        return;
    }

    match serde_json::to_string_pretty(message) {
        Ok(json) => {
            tracing::debug!(direction, peer = peer_id, "message:\n{}", json);
        }
        Err(e) => {
            tracing::debug!(error = %e, "failed to serialize message to JSON");
        }
    }
}

/// Summarize a broadcast snapshot if trace mode is enabled
pub fn trace_snapshot(snapshot: &GameStatePayload, bytes: usize) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!(
        tick = snapshot.tick_seq,
        full_sync = snapshot.full_sync,
        players = snapshot.players.len(),
        enemies = snapshot.enemies.len(),
        removed = snapshot.removed_ids.len(),
        size = %format_bytes(bytes),
        "snapshot"
    );
}

pub fn trace_serialization(format: &str, size_bytes: usize, duration_micros: u128) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!("serialized {} bytes using {} in {}µs", size_bytes, format, duration_micros);
}

pub fn trace_deserialization(format: &str, size_bytes: usize, duration_micros: u128) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!("deserialized {} bytes using {} in {}µs", size_bytes, format, duration_micros);
}

pub fn trace_transport_send(bytes: usize, destination: &str) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!("→ sent {} bytes to {}", bytes, destination);
}

pub fn trace_transport_receive(bytes: usize, source: &str) {
    if !is_trace_enabled() {
        return;
    }

    tracing::trace!("← received {} bytes from {}", bytes, source);
}

/// Format bytes in human-readable format (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// One-line description of a message for log fields
pub fn message_summary(message: &Message) -> String {
    let seq = message.header.sequence;
    match &message.payload {
        MessagePayload::GameState(state) => format!(
            "gameState #{} (seq: {}, full: {}, players: {}, enemies: {})",
            state.tick_seq,
            seq,
            state.full_sync,
            state.players.len(),
            state.enemies.len()
        ),
        MessagePayload::Input(_) => format!("input (seq: {})", seq),
        MessagePayload::InitialPosition { .. } => format!("initialPosition (seq: {})", seq),
        MessagePayload::EnemyKilled { enemy_id } => format!("enemyKilled {} (seq: {})", enemy_id, seq),
        MessagePayload::StartGame => format!("startGame (seq: {})", seq),
        MessagePayload::HostLeft => format!("hostLeft (seq: {})", seq),
        MessagePayload::Hello { peer_id, .. } => format!("hello from {} (seq: {})", peer_id, seq),
        MessagePayload::Welcome { host_peer_id } => format!("welcome from {} (seq: {})", host_peer_id, seq),
        MessagePayload::Kicked { .. } => format!("kicked (seq: {})", seq),
        MessagePayload::Ping { nonce } => format!("ping {} (seq: {})", nonce, seq),
        MessagePayload::Pong { nonce } => format!("pong {} (seq: {})", nonce, seq),
    }
}
