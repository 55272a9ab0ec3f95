//! The APCI (Application Protocol Control Information) layer of
//! IEC 60870-5-104: TCP framing, sequence-numbered sliding-window flow
//! control, and the keep-alive/lifecycle state machine that carries opaque
//! ASDU payloads between a telecontrol client and server. This layer never
//! interprets the ASDU bytes it carries.
//!
//! Two entry points produce a [`Connection`]: [`connect`] dials out and
//! performs the `STARTDT` handshake, and [`Listener`] binds a socket and
//! produces one connection per accepted peer. Both hand back the same
//! small public contract: [`Connection::send`], [`Connection::drain`],
//! [`Connection::receive`], and [`Connection::close`].
//!
//! # Examples
//!
//! ```no_run
//! # async fn run() -> Result<(), iec104_apci::ConnectionError> {
//! let mut conn = iec104_apci::connect("192.0.2.1:2404", Default::default()).await?;
//! conn.send(&b"asdu bytes"[..])?;
//! conn.drain().await?;
//! let asdu = conn.receive().await?;
//! println!("received {} bytes", asdu.len());
//! # Ok(())
//! # }
//! ```

pub mod apdu;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod listener;


pub use apdu::{Apdu, CodecError, UFunction};
pub use config::ConnectionConfig;
pub use connection::{CloseHandle, Connection};
pub use connector::connect;
pub use error::{ConfigError, ConnectionError};
pub use listener::Listener;
