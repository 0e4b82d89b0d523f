//! Castlink Transport
//!
//! TLS transport for the Cast v2 protocol. Devices present self-signed
//! certificates, so the connector trusts any server certificate; the
//! stream carries length-prefixed frames in both directions.

pub mod error;
pub mod tls;
pub mod traits;

pub use error::{Result, TransportError};
pub use tls::{TlsConfig, TlsReceiver, TlsSender, TlsTransport};
pub use traits::{TransportEvent, TransportReceiver, TransportSender};
