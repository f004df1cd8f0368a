//! Stock IRC line transport used by the daemon.

pub mod line;
pub mod transport;

pub use line::{format_line, IrcCodec, IrcLine};
pub use transport::LineTransport;
