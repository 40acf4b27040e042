pub mod cat;
pub mod evict;
pub mod ls;
pub mod mkdir;
pub mod mv;
pub mod rm;
pub mod stat;
pub mod write;

use std::time::SystemTime;

/// Formats a timestamp for listings, to whole seconds.
pub fn format_time(time: SystemTime) -> String {
    humantime::format_rfc3339_seconds(time).to_string()
}
