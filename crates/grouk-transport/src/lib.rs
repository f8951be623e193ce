//! Grouk transport: encrypted, authenticated, ordered streams over raw UDP.
//!
//! ```text
//!  Listener / connect()        one UDP socket, demux by session id
//!        |
//!     Session                  handshake keys, liveness, keepalive
//!        |
//!     Stream (x N)             window, retransmit, reorder, ordered delivery
//!        |
//!      Link                    seal + send_to, one datagram per call
//! ```
//!
//! A server binds a [`Listener`] and loops on [`Listener::accept`], then
//! [`Session::accept_stream`]. A client calls [`connect`] and
//! [`Session::open_stream`]. Both ends move bytes with [`Stream::read`] and
//! [`Stream::write`].

#![forbid(unsafe_code)]

mod client;
mod config;
mod error;
mod handshake;
mod link;
mod listener;
mod pipe;
mod session;
mod state;
mod stream;

pub use client::connect;
pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use listener::Listener;
pub use pipe::{pipe_tcp, Relayed};
pub use session::Session;
pub use state::{LifecycleEvent, LifecycleTransition, SessionState};
pub use stream::Stream;
