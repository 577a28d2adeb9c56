/// Universal variable daemon and its wire protocol
///
/// - `protocol`: Message codec (newline-terminated text commands)
/// - `connection`: Buffered non-blocking framing and outbound queues
/// - `dispatch`: Readiness multiplexing over poll(2)
/// - `server`: Unix socket server, broadcast loop and persistence cadence
/// - `client`: Shell-side connection with the barrier protocol
/// - `config`: Daemon tunables

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod protocol;
pub mod server;

pub use client::{spawn_daemon, BarrierState, DaemonClient, Launcher};
pub use config::DaemonConfig;
pub use connection::{Connection, Frame};
pub use protocol::{decode, escape, unescape, Event, Message, MessageKind, ProtocolError};
pub use server::{Startup, UniversalDaemon};
