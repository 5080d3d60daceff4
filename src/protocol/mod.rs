//! # Protocol Logic
//!
//! Transport-independent pieces of the connection protocol.
//!
//! ## Components
//! - **Handshake**: version/identity/feature negotiation run once per connection
//! - **Prio**: 8-bucket weighted round-robin queues
//! - **Reliable**: ack/resend bookkeeping for `GUARANTEED_DELIVERY` streams
//! - **Bandwidth**: token bucket for guaranteed-bandwidth streams

pub mod bandwidth;
pub mod handshake;
pub mod prio;
pub mod reliable;
