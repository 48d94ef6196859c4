//! Generated dnstap protobuf types, compiled by `build.rs` from
//! `proto/dnstap.proto` (the standard public dnstap schema).

pub mod dnstap {
    include!(concat!(env!("OUT_DIR"), "/dnstap.rs"));
}
