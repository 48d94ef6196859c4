//! Stdout sink: prints each flattened frame as one JSON line, or
//! substituted into a `{field}`-placeholder template.
//!
//! Grounded in `dnstap_stdout_output.go`'s `json`/`gotpl` modes. The
//! `gotpl` mode pulled in Go's text/template package; no templating crate
//! is pulled in here for what is just per-field placeholder substitution,
//! so `template` mode does that directly against the same field table
//! `prometheus.rs` uses.

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::flatten::{flatten, FlattenOptions};
use crate::output::Sink;
use crate::types::DnstapRecord;

pub struct StdoutSink {
    template: Option<String>,
    flat: FlattenOptions,
}

impl StdoutSink {
    pub fn new_json(flat: FlattenOptions) -> Self {
        Self { template: None, flat }
    }

    pub fn new_template(template: String, flat: FlattenOptions) -> Self {
        Self { template: Some(template), flat }
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        let record = match flatten(frame, &self.flat) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(%err, "dropping frame: failed to flatten for stdout sink");
                return Ok(());
            }
        };
        match &self.template {
            None => println!("{}", serde_json::to_string(&record).context("encoding record as json")?),
            Some(template) => println!("{}", render_template(template, &record)),
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Replaces every `{field}` placeholder with that field's string value,
/// using the same field table `prometheus::field_value` reads.
fn render_template(template: &str, record: &DnstapRecord) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        rest = &rest[start + 1..];
        match rest.find('}') {
            Some(end) => {
                let field = &rest[..end];
                out.push_str(&super::prometheus::field_value(record, field));
                rest = &rest[end + 1..];
            }
            None => {
                out.push('{');
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> DnstapRecord {
        DnstapRecord {
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            query_time: None,
            query_address: None,
            query_address_hash: String::new(),
            query_port: None,
            response_time: None,
            response_address: None,
            response_address_hash: String::new(),
            response_port: None,
            response_zone: None,
            ecs_net: None,
            identity: "resolver-1".to_string(),
            message_type: "CLIENT_QUERY".to_string(),
            socket_family: "INET".to_string(),
            socket_protocol: "UDP".to_string(),
            version: String::new(),
            extra: String::new(),
            tld: "com".to_string(),
            sld: "example.com".to_string(),
            thirdld: "example.com".to_string(),
            fourthld: "example.com".to_string(),
            qname: "example.com".to_string(),
            qclass: "IN".to_string(),
            qtype: "A".to_string(),
            message_size: 32,
            txid: 4242,
            rcode: "NOERROR".to_string(),
            aa: false,
            tc: false,
            rd: true,
            ra: true,
            ad: false,
            cd: false,
        }
    }

    #[test]
    fn substitutes_known_placeholders() {
        let record = sample_record();
        let rendered = render_template("{qname} {qtype} {rcode}", &record);
        assert_eq!(rendered, "example.com A NOERROR");
    }

    #[test]
    fn leaves_unknown_placeholders_blank_and_tolerates_unmatched_brace() {
        let record = sample_record();
        assert_eq!(render_template("{nope}", &record), "");
        assert_eq!(render_template("abc{", &record), "abc{");
    }
}
