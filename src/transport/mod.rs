//! The `transport` module holds the device-facing protocol bridges.
//!
//! - `mqtt`: session hooks for an MQTT proxy. They authenticate devices,
//!   authorize publish/subscribe per channel, rewrite topics and forward
//!   messages between the session and the broker.
//! - `coap`: maps CoAP observations onto broker subscriptions.

pub mod coap;
pub mod mqtt;

#[cfg(test)]
mod tests;
