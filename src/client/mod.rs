//! The `client` module defines the device-side session state shared by the
//! protocol bridges.
//!
//! A `Session` carries the credentials a device presented on connect, the
//! identity it was authenticated as, and the channel used to push broker
//! messages back to it.

pub mod session;
pub use session::{OutboundPublish, Session};
