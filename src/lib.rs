//! # pcom-link
//!
//! Host side of the PCOM serial link to embedded devices.
//!
//! The crate turns named, dispatcher-level messages into checksummed,
//! byte-stuffed packets on a raw byte stream and back, and makes sure
//! response-required packets arrive.
//!
//! ## Layers
//!
//! - **Codec** ([`codec`]): format-string driven packing of typed values
//! - **Translation** ([`translate`], [`ids`], [`registry`]): names ↔ wire
//!   ids, logical messages ↔ [`WireMessage`](protocol::WireMessage)
//! - **Framing** ([`protocol`]): START/STOP/ESC stuffing, 4-bit sequence
//!   header, checksum, ACK/NAK signals
//! - **Delivery** ([`delivery`]): one outstanding packet, ACK timeout and
//!   retries
//! - **Link** ([`link`]): the actor tying it all to an `AsyncRead` +
//!   `AsyncWrite` transport
//!
//! ## Example
//!
//! ```ignore
//! use pcom_link::{LinkBuilder, LogicalMessage, ServiceRegistry};
//!
//! #[tokio::main]
//! async fn main() -> pcom_link::Result<()> {
//!     let registry = ServiceRegistry::from_json(&std::fs::read_to_string("services.json")?)?;
//!     let (read_half, write_half) = tokio::io::split(open_serial_port()?);
//!
//!     let (link, mut inbound) = LinkBuilder::new()
//!         .registry(registry)
//!         .start(read_half, write_half);
//!
//!     let order = LogicalMessage::command(0x0100u16, "ui", "move").with_param("steps", 200);
//!     link.send(order).await?;
//!
//!     while let Some(msg) = inbound.recv().await {
//!         println!("{:?} {:?}", msg.kind, msg.contents);
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod delivery;
pub mod error;
pub mod ids;
pub mod link;
pub mod protocol;
pub mod registry;
pub mod translate;
pub mod writer;

pub use codec::Value;
pub use delivery::{DeliveryConfig, DeliveryEngine, DeliveryState, Receipt};
pub use error::{PcomError, Result};
pub use ids::{IdTable, ServiceRef};
pub use link::{Inbound, Link, LinkBuilder, LinkConfig};
pub use registry::ServiceRegistry;
pub use translate::{LogicalMessage, MessageKind, Status, Translator};
