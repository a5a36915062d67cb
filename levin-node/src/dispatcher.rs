use levin::{CommandDispatcher, ConnectionContext, LevinResult};

/// Demo command ids. A real node would dispatch on a much larger,
/// application-defined command set; this binary only shows the wiring.
pub const COMMAND_PING: u32 = 1001;

/// Dispatcher for the showcase binary: answers `COMMAND_PING` invokes by
/// echoing the payload back, and logs everything else.
pub struct EchoDispatcher;

impl CommandDispatcher for EchoDispatcher {
    fn invoke(&self, command: u32, payload: Vec<u8>, ctx: &ConnectionContext) -> LevinResult<Vec<u8>> {
        log::debug!("connection {} invoked command {command} with {} bytes", ctx.connection_id, payload.len());
        Ok(payload)
    }

    fn notify(&self, command: u32, payload: Vec<u8>, ctx: &ConnectionContext) -> LevinResult<()> {
        log::debug!("connection {} notified command {command} with {} bytes", ctx.connection_id, payload.len());
        Ok(())
    }

    fn on_connection_new(&self, ctx: &ConnectionContext) {
        log::info!("connection {} established ({})", ctx.connection_id, if ctx.is_incoming { "incoming" } else { "outgoing" });
    }

    fn on_connection_close(&self, ctx: &ConnectionContext) {
        log::info!("connection {} closed", ctx.connection_id);
    }
}
