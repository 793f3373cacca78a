use chrono::{DateTime, Utc};

/// Wall-clock capability.
pub trait Clock: Send + Sync {
    /// Returns the current UTC time.
    fn now_utc(&self) -> DateTime<Utc>;
}
