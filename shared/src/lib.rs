//! GTunnel Shared Library
//!
//! Envelope framing, header-block model and tunnel options used by both
//! the relay and the client.

pub mod error;
pub mod frame;
pub mod options;
pub mod protocol;

pub use error::{Error, Result};
pub use frame::{decode_header_block, encode_header_block, Envelope};
pub use options::TunnelOptions;
pub use protocol::{HeaderList, RequestHead, ResponseHead};
