use chrono::{DateTime, Utc};
use mqlease_application::Clock;

/// Clock backed by the host's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
