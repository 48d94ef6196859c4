//! Inputs decode FrameStream payloads and push each data frame onto the
//! shared ingress buffer. Every input kind runs under the same cancel
//! token: on cancellation it stops accepting new connections/files and
//! lets in-flight reads wind down on their own EOF/STOP rather than being
//! torn down mid-frame.

pub mod file;
pub mod socket;
pub mod tail;
