//! Ingestion listener.
//!
//! Third parties submit metrics over TCP or a unix socket, one line each:
//!
//! ```text
//! 2014-10-13T22:00:16Z app.requests 1024 c Requests,reqs
//! 1413237616 app.temperature 21.5
//! ```
//!
//! Nothing is ever written back to the client. A line that fails to parse
//! closes its connection.

mod address;
mod collector;
mod parser;

pub use address::{AddressError, ListenAddress, Transport};
pub use collector::{LISTEN_NAME, ListenCollector, ListenStats};
pub use parser::{ParseError, parse_line};
