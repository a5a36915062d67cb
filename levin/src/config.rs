//! Process-wide knobs an embedding application tunes, passed once to a
//! [`crate::table::ConnectionTable`] and shared by every connection it
//! spawns: a plain data struct built by the caller rather than read from
//! a file, since config loading is out of scope here.

use std::time::Duration;

use crate::wire::header::{DEFAULT_MAX_PACKET_SIZE, INITIAL_MAX_PACKET_SIZE};

/// Which application-level command identifier, once answered successfully,
/// promotes a connection from the small pre-handshake packet ceiling to the
/// full one (spec.md §3 "handshake command"). `None` means every connection
/// starts and stays at `max_packet_size` — useful for embedders with no
/// separate handshake step.
#[derive(Copy, Clone, Debug)]
pub struct HandlerConfig {
    pub initial_max_packet_size: u64,
    pub max_packet_size: u64,
    /// Used by [`crate::handler::ProtocolHandler::invoke`] whenever the
    /// caller passes `Duration::ZERO`, meaning "use the default".
    pub invoke_timeout: Duration,
    pub handshake_command: Option<u32>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        HandlerConfig {
            initial_max_packet_size: INITIAL_MAX_PACKET_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            invoke_timeout: Duration::from_secs(30),
            handshake_command: None,
        }
    }
}

impl HandlerConfig {
    /// Resolves a caller-supplied invoke timeout, treating zero as "use the
    /// configured default" (spec.md §5 "timeout ... may be zero meaning
    /// 'use default'").
    pub fn resolve_invoke_timeout(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.invoke_timeout
        } else {
            requested
        }
    }
}
