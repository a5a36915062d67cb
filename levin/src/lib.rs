//! A binary request/response protocol engine in the style of the epee/Levin
//! P2P wire protocol used by cryptonote-family full nodes: a 33-byte frame
//! header, a stream parser that reassembles fragmented and filters noise
//! frames, per-connection invocation correlation with timeouts, and a
//! process-wide connection table.
//!
//! Blockchain storage, consensus, mining, wallets, JSON-RPC, staking rules
//! and TLS transport specifics are all out of scope — this crate only
//! carries messages between peers and hands them to whatever
//! [`dispatcher::CommandDispatcher`] the embedding application supplies.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod parser;
pub mod registry;
pub mod table;
pub mod transport;
pub mod wire;

pub use config::HandlerConfig;
pub use dispatcher::{CommandDispatcher, ConnectionContext};
pub use error::{LevinError, LevinResult, ReturnCode};
pub use handler::ProtocolHandler;
pub use table::ConnectionTable;
pub use transport::{TcpTransport, Transport};
