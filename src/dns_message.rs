//! Minimal DNS message parsing: just enough of RFC 1035 (header flags,
//! the question section, rcode) plus the EDNS0 Client Subnet option to
//! feed the flatten transform. Record data beyond that is out of scope.
//!
//! The byte-walk here is the same manual offset-tracking style used
//! elsewhere in this codebase for qname/qtype extraction, just
//! consolidated into one place instead of being re-derived per call site.

use anyhow::{bail, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const OPT_RR_TYPE: u16 = 41;
const EDNS0_SUBNET_OPTION_CODE: u16 = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderFlags {
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub ad: bool,
    pub cd: bool,
    pub rcode: u8,
}

#[derive(Debug, Clone)]
pub struct Question {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// An EDNS Client Subnet option as found on the wire: family, the raw
/// (unmasked) address bytes, and the source prefix length the client
/// asked the resolver to honor.
#[derive(Debug, Clone)]
pub struct ClientSubnet {
    pub address: IpAddr,
    pub source_prefix_len: u8,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub txid: u16,
    pub flags: HeaderFlags,
    pub question: Option<Question>,
    pub client_subnet: Option<ClientSubnet>,
}

/// Parses the header, the first question (if any), and an EDNS0 Client
/// Subnet option from the additional section (if any). Anything else in
/// the message — answers, authority, other EDNS0 options — is ignored.
pub fn parse(msg: &[u8]) -> Result<ParsedMessage> {
    if msg.len() < 12 {
        bail!("DNS message shorter than a header ({} bytes)", msg.len());
    }

    let txid = u16::from_be_bytes([msg[0], msg[1]]);
    let flags2 = msg[2];
    let flags3 = msg[3];
    let flags = HeaderFlags {
        aa: flags2 & 0x04 != 0,
        tc: flags2 & 0x02 != 0,
        rd: flags2 & 0x01 != 0,
        ra: flags3 & 0x80 != 0,
        ad: flags3 & 0x20 != 0,
        cd: flags3 & 0x10 != 0,
        rcode: flags3 & 0x0F,
    };
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]) as usize;
    let arcount = u16::from_be_bytes([msg[10], msg[11]]) as usize;

    let mut offset = 12;
    let mut question = None;
    if qdcount > 0 {
        let (name, consumed) = read_name(msg, offset)?;
        offset += consumed;
        if offset + 4 > msg.len() {
            bail!("truncated question section");
        }
        let qtype = u16::from_be_bytes([msg[offset], msg[offset + 1]]);
        let qclass = u16::from_be_bytes([msg[offset + 2], msg[offset + 3]]);
        offset += 4;
        question = Some(Question { qname: name, qtype, qclass });
    }

    // Skip the rest of the question section (if qdcount > 1, which never
    // happens in practice but we shouldn't misparse the additional section
    // because of it), answers, and authority records to reach additional.
    // We don't need their contents, only their total length.
    for _ in 1..qdcount {
        let (_, consumed) = read_name(msg, offset)?;
        offset += consumed + 4;
    }
    offset = skip_rr_section(msg, offset, answer_count(msg))?;
    offset = skip_rr_section(msg, offset, authority_count(msg))?;

    let client_subnet = find_client_subnet(msg, offset, arcount)?;

    Ok(ParsedMessage { txid, flags, question, client_subnet })
}

fn answer_count(msg: &[u8]) -> usize {
    u16::from_be_bytes([msg[6], msg[7]]) as usize
}

fn authority_count(msg: &[u8]) -> usize {
    u16::from_be_bytes([msg[8], msg[9]]) as usize
}

/// Advances past `count` resource records starting at `offset`, returning
/// the offset just past the last one. Used only to reach the additional
/// section; record contents are not interpreted here.
fn skip_rr_section(msg: &[u8], mut offset: usize, count: usize) -> Result<usize> {
    for _ in 0..count {
        let (_, name_len) = read_name(msg, offset)?;
        offset += name_len;
        if offset + 10 > msg.len() {
            bail!("truncated resource record");
        }
        let rdlength = u16::from_be_bytes([msg[offset + 8], msg[offset + 9]]) as usize;
        offset += 10 + rdlength;
        if offset > msg.len() {
            bail!("resource record rdata overruns message");
        }
    }
    Ok(offset)
}

fn find_client_subnet(msg: &[u8], mut offset: usize, arcount: usize) -> Result<Option<ClientSubnet>> {
    for _ in 0..arcount {
        let (_, name_len) = read_name(msg, offset)?;
        offset += name_len;
        if offset + 10 > msg.len() {
            bail!("truncated resource record in additional section");
        }
        let rr_type = u16::from_be_bytes([msg[offset], msg[offset + 1]]);
        let rdlength = u16::from_be_bytes([msg[offset + 8], msg[offset + 9]]) as usize;
        let rdata_start = offset + 10;
        let rdata_end = rdata_start + rdlength;
        if rdata_end > msg.len() {
            bail!("EDNS0 option rdata overruns message");
        }
        if rr_type == OPT_RR_TYPE {
            if let Some(subnet) = parse_opt_rdata(&msg[rdata_start..rdata_end]) {
                return Ok(Some(subnet));
            }
        }
        offset = rdata_end;
    }
    Ok(None)
}

/// Walks the `{option-code, option-length, option-data}` tuples of an OPT
/// RR's rdata looking for an EDNS0 Client Subnet (code 8) option.
fn parse_opt_rdata(rdata: &[u8]) -> Option<ClientSubnet> {
    let mut offset = 0;
    while offset + 4 <= rdata.len() {
        let code = u16::from_be_bytes([rdata[offset], rdata[offset + 1]]);
        let len = u16::from_be_bytes([rdata[offset + 2], rdata[offset + 3]]) as usize;
        offset += 4;
        if offset + len > rdata.len() {
            break;
        }
        if code == EDNS0_SUBNET_OPTION_CODE {
            if let Some(subnet) = parse_ecs_option(&rdata[offset..offset + len]) {
                return Some(subnet);
            }
        }
        offset += len;
    }
    None
}

fn parse_ecs_option(option: &[u8]) -> Option<ClientSubnet> {
    if option.len() < 4 {
        return None;
    }
    let family = u16::from_be_bytes([option[0], option[1]]);
    let source_prefix_len = option[2];
    let addr_bytes = &option[4..];
    let address = match family {
        1 => {
            let mut octets = [0u8; 4];
            let n = addr_bytes.len().min(4);
            octets[..n].copy_from_slice(&addr_bytes[..n]);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        2 => {
            let mut octets = [0u8; 16];
            let n = addr_bytes.len().min(16);
            octets[..n].copy_from_slice(&addr_bytes[..n]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(ClientSubnet { address, source_prefix_len })
}

/// Reads a (possibly compressed) domain name starting at `offset`,
/// returning the dotted name and the number of bytes consumed from the
/// *original* offset (compression pointers are followed but don't count
/// towards the consumed length beyond the 2-byte pointer itself).
fn read_name(msg: &[u8], start: usize) -> Result<(String, usize)> {
    let mut labels = Vec::new();
    let mut offset = start;
    let mut consumed = None;
    let mut hops = 0;

    loop {
        if offset >= msg.len() {
            bail!("name extends past end of message");
        }
        let len = msg[offset] as usize;
        if len == 0 {
            offset += 1;
            if consumed.is_none() {
                consumed = Some(offset - start);
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            if offset + 1 >= msg.len() {
                bail!("truncated compression pointer");
            }
            if consumed.is_none() {
                consumed = Some(offset + 2 - start);
            }
            hops += 1;
            if hops > 128 {
                bail!("compression pointer loop");
            }
            let pointer = (((len & 0x3F) as usize) << 8) | msg[offset + 1] as usize;
            offset = pointer;
            continue;
        }
        offset += 1;
        if offset + len > msg.len() {
            bail!("label extends past end of message");
        }
        labels.push(String::from_utf8_lossy(&msg[offset..offset + len]).into_owned());
        offset += len;
    }

    Ok((labels.join("."), consumed.unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_query(qname_labels: &[&str], qtype: u16, ecs: Option<(IpAddr, u8)>) -> Vec<u8> {
        let mut msg = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        for label in qname_labels {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0);
        msg.extend_from_slice(&qtype.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes()); // IN

        if let Some((addr, prefix)) = ecs {
            msg[11] = 1; // arcount
            let (family, addr_bytes): (u16, Vec<u8>) = match addr {
                IpAddr::V4(v4) => (1, v4.octets().to_vec()),
                IpAddr::V6(v6) => (2, v6.octets().to_vec()),
            };
            let mut option_data = Vec::new();
            option_data.extend_from_slice(&family.to_be_bytes());
            option_data.push(prefix);
            option_data.push(0); // scope prefix-length
            option_data.extend_from_slice(&addr_bytes);

            let mut rdata = Vec::new();
            rdata.extend_from_slice(&EDNS0_SUBNET_OPTION_CODE.to_be_bytes());
            rdata.extend_from_slice(&(option_data.len() as u16).to_be_bytes());
            rdata.extend_from_slice(&option_data);

            msg.push(0); // root name
            msg.extend_from_slice(&OPT_RR_TYPE.to_be_bytes());
            msg.extend_from_slice(&4096u16.to_be_bytes()); // udp payload size (class slot)
            msg.extend_from_slice(&[0, 0, 0, 0]); // extended rcode/version/flags
            msg.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            msg.extend_from_slice(&rdata);
        }
        msg
    }

    #[test]
    fn parses_question_and_flags() {
        let msg = build_query(&["example", "com"], 1, None);
        let parsed = parse(&msg).unwrap();
        assert_eq!(parsed.txid, 0x1234);
        assert!(parsed.flags.rd);
        let q = parsed.question.unwrap();
        assert_eq!(q.qname, "example.com");
        assert_eq!(q.qtype, 1);
        assert_eq!(q.qclass, 1);
        assert!(parsed.client_subnet.is_none());
    }

    #[test]
    fn parses_ecs_option() {
        let ip: IpAddr = "203.0.113.77".parse().unwrap();
        let msg = build_query(&["example", "com"], 1, Some((ip, 24)));
        let parsed = parse(&msg).unwrap();
        let ecs = parsed.client_subnet.unwrap();
        assert_eq!(ecs.address, ip);
        assert_eq!(ecs.source_prefix_len, 24);
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(parse(&[0u8; 4]).is_err());
    }
}
