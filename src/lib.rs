//! Server-side engine for the Web Application Socket (WAS) protocol.
//!
//! A web server hands requests to a long-lived worker process over three
//! inherited descriptors: a bidirectional control channel carrying framed
//! command packets, plus one pipe per direction for raw body bytes. The
//! [`Session`] type owns such a descriptor triple and serves requests
//! serially behind a synchronous API: `accept` a request, inspect it, read
//! its body, emit status/headers, stream the response body, `end`.
//!
//! Internally the body pipes are non-blocking and every blocking call is a
//! poll over the descriptor it needs plus the control channel, so peer
//! commands such as cancellation or metric requests are serviced while the
//! application waits.

pub mod logging;
pub mod packet;
pub mod support;

mod buffer;
mod channel;
mod fdio;
mod poll;
mod request;
mod session;

pub use crate::packet::{Command, Method};
pub use crate::request::EntryIter;
pub use crate::session::{Session, CONTROL_FILENO, INPUT_FILENO, OUTPUT_FILENO};
pub use crate::support::{
    ErrorUtils, MisuseError, PollStatus, ProtocolError, WasError, WasResult,
};
