//! Prometheus sink: increments one `CounterVec` per configured counter,
//! labeled with whichever flattened record fields that counter asks for.
//!
//! `dnstap_prometheus_output.go` builds its label set and label values by
//! walking `DnstapFlatT` with `reflect`. REDESIGN FLAG applied: reflection
//! has no Rust analogue worth faking, so `field_value` below is an
//! explicit match over the same field set instead.

use anyhow::{Context, Result};
use async_trait::async_trait;
use prometheus::{CounterVec, Opts, Registry};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::PrometheusCounterConfig;
use crate::flatten::{flatten, FlattenOptions};
use crate::output::Sink;
use crate::types::DnstapRecord;

struct TrackedCounter {
    vec: CounterVec,
    labels: Vec<String>,
    /// Last-seen time per label-value tuple, used for expiry.
    seen: HashMap<Vec<String>, Instant>,
}

pub struct PrometheusSink {
    registry: Registry,
    counters: Vec<TrackedCounter>,
    flat: FlattenOptions,
    expire: Option<Duration>,
}

impl PrometheusSink {
    pub fn new(
        registry: Registry,
        configs: &[PrometheusCounterConfig],
        flat: FlattenOptions,
        expire_seconds: Option<u64>,
    ) -> Result<Self> {
        let mut counters = Vec::with_capacity(configs.len());
        for cfg in configs {
            let vec = CounterVec::new(Opts::new(&cfg.name, &cfg.help), &label_refs(&cfg.labels))
                .with_context(|| format!("building counter vec for {}", cfg.name))?;
            registry.register(Box::new(vec.clone())).with_context(|| format!("registering counter {}", cfg.name))?;
            counters.push(TrackedCounter { vec, labels: cfg.labels.clone(), seen: HashMap::new() });
        }
        Ok(Self { registry, counters, flat, expire: expire_seconds.map(Duration::from_secs) })
    }
}

#[async_trait]
impl Sink for PrometheusSink {
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        let record = match flatten(frame, &self.flat) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(%err, "dropping frame: failed to flatten for prometheus sink");
                return Ok(());
            }
        };
        let now = Instant::now();
        for counter in &mut self.counters {
            let values: Vec<String> = counter.labels.iter().map(|l| field_value(&record, l)).collect();
            let refs: Vec<&str> = values.iter().map(String::as_str).collect();
            counter.vec.with_label_values(&refs).inc();
            counter.seen.insert(values, now);
        }
        Ok(())
    }

    async fn close(&mut self) {}

    async fn tick(&mut self) -> Result<()> {
        let Some(expire) = self.expire else { return Ok(()) };
        let now = Instant::now();
        for counter in &mut self.counters {
            let stale: Vec<Vec<String>> =
                counter.seen.iter().filter(|(_, last)| now.duration_since(**last) > expire).map(|(k, _)| k.clone()).collect();
            for key in stale {
                let refs: Vec<&str> = key.iter().map(String::as_str).collect();
                let _ = counter.vec.remove_label_values(&refs);
                counter.seen.remove(&key);
            }
        }
        Ok(())
    }
}

fn label_refs(labels: &[String]) -> Vec<&str> {
    labels.iter().map(String::as_str).collect()
}

/// Explicit replacement for the field walk `NewDtapCounterVec`/
/// `reflect.ValueOf` performed over `DnstapFlatT`'s `json` tags.
pub(crate) fn field_value(record: &DnstapRecord, field: &str) -> String {
    match field {
        "timestamp" => record.timestamp.clone(),
        "query_time" => record.query_time.clone().unwrap_or_default(),
        "query_address" => record.query_address.map(|a| a.to_string()).unwrap_or_default(),
        "query_address_hash" => record.query_address_hash.clone(),
        "query_port" => record.query_port.map(|p| p.to_string()).unwrap_or_default(),
        "response_time" => record.response_time.clone().unwrap_or_default(),
        "response_address" => record.response_address.map(|a| a.to_string()).unwrap_or_default(),
        "response_address_hash" => record.response_address_hash.clone(),
        "response_port" => record.response_port.map(|p| p.to_string()).unwrap_or_default(),
        "response_zone" => record.response_zone.clone().unwrap_or_default(),
        "ecs_net" => record.ecs_net.as_ref().map(|n| n.to_string()).unwrap_or_default(),
        "identity" => record.identity.clone(),
        "type" => record.message_type.clone(),
        "socket_family" => record.socket_family.clone(),
        "socket_protocol" => record.socket_protocol.clone(),
        "version" => record.version.clone(),
        "extra" => record.extra.clone(),
        "tld" => record.tld.clone(),
        "sld" => record.sld.clone(),
        "thirdld" => record.thirdld.clone(),
        "fourthld" => record.fourthld.clone(),
        "qname" => record.qname.clone(),
        "qclass" => record.qclass.clone(),
        "qtype" => record.qtype.clone(),
        "message_size" => record.message_size.to_string(),
        "txid" => record.txid.to_string(),
        "rcode" => record.rcode.clone(),
        "aa" => record.aa.to_string(),
        "tc" => record.tc.to_string(),
        "rd" => record.rd.to_string(),
        "ra" => record.ra.to_string(),
        "ad" => record.ad.to_string(),
        "cd" => record.cd.to_string(),
        _ => String::new(),
    }
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
    fn field_value_reads_known_fields() {
        let record = sample_record();
        assert_eq!(field_value(&record, "qtype"), "A");
        assert_eq!(field_value(&record, "rcode"), "NOERROR");
        assert_eq!(field_value(&record, "message_size"), "32");
    }

    #[test]
    fn field_value_defaults_unknown_fields_to_empty() {
        let record = sample_record();
        assert_eq!(field_value(&record, "not_a_field"), "");
    }

    #[test]
    fn counter_increments_with_configured_labels() {
        let registry = Registry::new();
        let configs = vec![PrometheusCounterConfig {
            name: "dnstap_queries_total".to_string(),
            help: "count".to_string(),
            labels: vec!["qtype".to_string(), "rcode".to_string()],
        }];
        let sink = PrometheusSink::new(registry.clone(), &configs, FlattenOptions::with_defaults("h".to_string()), None).unwrap();
        let families = registry.gather();
        assert_eq!(families.len(), 1);
        assert_eq!(sink.counters[0].labels, vec!["qtype", "rcode"]);
    }
}
