//! Updraft - Link-Local Sharing Transport
//!
//! Transport layer for an AirDrop-style peer-to-peer file-sharing
//! protocol: posts property-list requests and raw archive payloads to a
//! peer over mutually authenticated TLS on a link-local IPv6 network,
//! and decodes property-list responses.
//!
//! # Main Components
//!
//! - `client`: request submission and outcome classification.
//! - `codec`: ordered-document property-list codec (binary and XML).
//! - `dispatch`: serialized delivery of completion callbacks.
//! - `errors`: the failure taxonomy surfaced to callers.
//! - `transport`: link-local socket dialing and the chain-trust TLS
//!   policy.
//! - `utils`: async and logging helpers.

pub mod client;
pub mod codec;
pub mod dispatch;
pub mod errors;
pub mod transport;
pub mod utils;

pub use client::{ClientOptions, Outcome, PendingCall, ShareClient};
pub use dispatch::{DeliveryQueue, Dispatcher};
pub use errors::TransportError;
pub use transport::connect::{InterfaceBinding, LinkLocalConnector};
pub use transport::security::TrustMaterial;
