use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_INBOX_PREFIX: &str = "_INBOX";

/// Unique reply subject under `prefix`, e.g. `_INBOX.4f1c...`.
pub fn new_inbox(prefix: &str) -> String {
    format!("{}.{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Short random token usable as a subject segment.
pub fn unique_token() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // try_init: tests and binaries may both call this
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true),
        )
        .try_init();
}
