//! The contract an embedding application implements to receive Levin
//! traffic. Mirrors `levin_commands_handler<T>`: one connection-lifecycle
//! pair (`on_connection_new`/`on_connection_close`) plus the three message
//! shapes a connection can receive (`invoke`, `notify`, `callback`).

use uuid::Uuid;

use crate::error::LevinResult;

/// Per-connection context handed to every dispatcher callback: who's
/// talking, and how to answer without waiting for this call to return.
pub struct ConnectionContext {
    pub connection_id: Uuid,
    pub is_incoming: bool,
    /// The command identifier whose successful completion promotes this
    /// connection to the full `max_packet_size`, if the embedder configured
    /// one (spec.md §3's "handshake command").
    pub handshake_command: Option<u32>,
    /// Whether `handshake_command` has already completed on this connection.
    pub handshake_complete: bool,
}

/// Implemented by the application embedding `levin`. All methods run
/// synchronously on the connection's delivery path; long-running work
/// belongs behind `callback`, requested via
/// [`crate::handler::Transport::request_callback`].
pub trait CommandDispatcher: Send + Sync {
    /// Handle a request that expects a response; the returned bytes become
    /// the response frame's payload.
    ///
    /// An `Err` return is reported to the peer as
    /// [`crate::error::ReturnCode::ConnectionTimedOut`], the same
    /// conservative mapping the reference dispatch map uses for any
    /// exception raised out of a registered handler — the peer cannot
    /// distinguish "you asked for something invalid" from "we're busy",
    /// so it is told to treat it as transient and retry.
    fn invoke(&self, command: u32, payload: Vec<u8>, ctx: &ConnectionContext) -> LevinResult<Vec<u8>>;

    /// Handle a one-way message; no response frame is sent regardless of
    /// outcome.
    fn notify(&self, command: u32, payload: Vec<u8>, ctx: &ConnectionContext) -> LevinResult<()>;

    /// A new connection has completed its transport-level setup and is
    /// about to start exchanging frames.
    fn on_connection_new(&self, ctx: &ConnectionContext) {
        let _ = ctx;
    }

    /// The connection has been torn down; any state keyed on
    /// `ctx.connection_id` should be released.
    fn on_connection_close(&self, ctx: &ConnectionContext) {
        let _ = ctx;
    }

    /// Invoked when deferred work requested via `request_callback`
    /// is ready to run.
    fn callback(&self, ctx: &ConnectionContext) {
        let _ = ctx;
    }
}
