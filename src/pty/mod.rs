//! Interactive PTY sessions
//!
//! TTY-attached execs with reconnect and bounded replay. Sessions survive
//! client disconnects for an idle window; only the broker touches the raw
//! streams.

mod broker;
mod buffer;
mod session;
mod urls;

pub use broker::PtyBroker;
pub use buffer::RollingBuffer;
pub use session::{
    compose_initial_command, is_login_command, session_key, PtySession, PtyStatus, ShellProvider,
    BUFFER_CAP,
};
pub use urls::{scan_chunk, UrlScan};
