//! courier_utils
//!
//! Small pieces shared by the client and the standalone broker: logging
//! bootstrap, reconnect backoff, frame checksums and a poison-tolerant lock.

pub mod backoff;
pub mod checksum;
pub mod logging;
pub mod sync;

pub use backoff::Backoff;
pub use sync::{lock, wait, wait_timeout};

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
        assert_eq!(logging::parse_level(" trace "), tracing::Level::TRACE);
        assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
    }
}
