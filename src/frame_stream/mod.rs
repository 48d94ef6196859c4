//! The dnstap wire format: length-prefixed data frames interleaved with
//! control frames, as produced by Farsight's `fstrm` library.
//!
//! Inputs that read from a socket use the bidirectional handshake
//! (READY/ACCEPT/START ... STOP/FINISH); inputs that read a file, and
//! outputs of both kinds, use the simpler one-way START ... STOP framing.

pub mod control;
mod decoder;
mod encoder;

pub use decoder::{BidirectionalDecoder, UnidirectionalDecoder};
pub use encoder::{BidirectionalEncoder, UnidirectionalEncoder};

/// The content type every dnstap peer advertises in its handshake frames.
pub const CONTENT_TYPE: &str = "protobuf:dnstap.Dnstap";
