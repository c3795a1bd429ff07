//! Wire-level types shared by the broker and relay subsystems
//!
//! Topic naming, discovery documents and relay envelopes. Everything in this
//! module is pure; I/O lives in `transport` and `relay`.

pub mod discovery;
pub mod envelope;
pub mod topics;

pub use discovery::{Component, DiscoveryAnnouncement, DiscoveryDescriptor, DiscoveryDocument};
pub use envelope::{
    decode_envelope, encode_server_request, ClientRequest, ClientResponse, Envelope,
    EnvelopeError, ServerRequestType,
};
pub use topics::*;
