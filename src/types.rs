//! The normalized record shape produced by the flatten transform, plus the
//! small value types it builds on.

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;

/// An `{address, prefix length}` pair, as carried by an EDNS Client Subnet
/// option. Serializes as `"<ip>/<prefix>"`, mirroring the original
/// `Net.MarshalJSON`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Net {
    pub ip: IpAddr,
    pub prefix_length: u8,
}

impl fmt::Display for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_length)
    }
}

impl Serialize for Net {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The parsed, normalized view of one dnstap frame.
///
/// Field names and optionality follow the flattened record this pipeline
/// produces: `tld`/`sld`/`thirdld`/`fourthld` are the safe domain-label
/// names (not the buggy `2ld`/`3ld`/`4ld` tags of the system this replaces).
#[derive(Debug, Clone, Serialize)]
pub struct DnstapRecord {
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_address: Option<IpAddr>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub query_address_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_address: Option<IpAddr>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response_address_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecs_net: Option<Net>,

    pub identity: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub socket_family: String,
    pub socket_protocol: String,
    pub version: String,
    pub extra: String,

    pub tld: String,
    pub sld: String,
    pub thirdld: String,
    pub fourthld: String,

    pub qname: String,
    pub qclass: String,
    pub qtype: String,

    pub message_size: usize,
    pub txid: u16,
    pub rcode: String,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub ad: bool,
    pub cd: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_displays_as_cidr() {
        let net = Net { ip: "203.0.113.0".parse().unwrap(), prefix_length: 24 };
        assert_eq!(net.to_string(), "203.0.113.0/24");
    }

    #[test]
    fn net_serializes_as_json_string() {
        let net = Net { ip: "203.0.113.0".parse().unwrap(), prefix_length: 24 };
        let json = serde_json::to_string(&net).unwrap();
        assert_eq!(json, "\"203.0.113.0/24\"");
    }
}
