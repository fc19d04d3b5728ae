#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

//! Session event protocol and relay routing.
//!
//! [`models`] defines the wire payloads exchanged with clients. [`route`]
//! decides, for one inbound event, which room it targets, who receives it,
//! and what goes out on the wire. Routing is pure so the relay semantics can
//! be tested without a transport.

pub mod models;

mod relay;

pub use relay::*;
