//! TOML configuration for the relay: input/output entry lists plus the
//! shared buffer/flatten option structs each output embeds.
//!
//! Structurally mirrors the system this replaces (a `Config` holding a
//! `Vec` per input/output kind, with `OutputBufferConfig`/
//! `OutputCommonConfig` reused across output kinds) translated from
//! embedded Go structs into `#[serde(flatten)]`.

use serde::Deserialize;
use std::path::PathBuf;

fn default_input_msg_buffer() -> u32 {
    10_000
}

fn default_buffer_size() -> u32 {
    10_000
}

fn default_ipv4_mask() -> u8 {
    24
}

fn default_ipv6_mask() -> u8 {
    48
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(default = "default_input_msg_buffer")]
    pub input_msg_buffer: u32,

    pub input_unix: Vec<InputUnixConfig>,
    pub input_file: Vec<InputFileConfig>,
    pub input_tail: Vec<InputTailConfig>,
    pub input_tcp: Vec<InputTcpConfig>,

    pub output_unix: Vec<OutputUnixConfig>,
    pub output_file: Vec<OutputFileConfig>,
    pub output_tcp: Vec<OutputTcpConfig>,
    pub output_fluent: Vec<OutputFluentConfig>,
    pub output_kafka: Vec<OutputKafkaConfig>,
    pub output_nats: Vec<OutputNatsConfig>,
    pub output_prometheus: Vec<OutputPrometheusConfig>,
    pub output_stdout: Vec<OutputStdoutConfig>,

    pub metrics_addr: Option<String>,
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file '{}': {e}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse config file '{}': {e}", path.display()))?;
        config.validate().map_err(|errs| anyhow::anyhow!("invalid configuration:\n{}", errs.join("\n")))?;
        Ok(config)
    }

    /// Collects every validation failure instead of stopping at the
    /// first, matching the multi-error report style of the config this
    /// replaces.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errs = Vec::new();

        if self.input_msg_buffer < 128 {
            errs.push("input_msg_buffer must not be smaller than 128".to_string());
        }
        for (n, i) in self.input_unix.iter().enumerate() {
            if i.path.as_os_str().is_empty() {
                errs.push(format!("input_unix[{n}]: path must not be empty"));
            }
        }
        for (n, i) in self.input_file.iter().enumerate() {
            if i.path.as_os_str().is_empty() {
                errs.push(format!("input_file[{n}]: path must not be empty"));
            }
        }
        for (n, i) in self.input_tail.iter().enumerate() {
            if i.path.is_empty() {
                errs.push(format!("input_tail[{n}]: path must not be empty"));
            }
        }
        for (n, i) in self.input_tcp.iter().enumerate() {
            if i.address.is_empty() {
                errs.push(format!("input_tcp[{n}]: address must not be empty"));
            }
        }
        for (n, o) in self.output_unix.iter().enumerate() {
            if o.path.as_os_str().is_empty() {
                errs.push(format!("output_unix[{n}]: path must not be empty"));
            }
            errs.extend(o.flat.validate().into_iter().map(|e| format!("output_unix[{n}]: {e}")));
        }
        for (n, o) in self.output_file.iter().enumerate() {
            if o.path.is_empty() {
                errs.push(format!("output_file[{n}]: path must not be empty"));
            }
            errs.extend(o.flat.validate().into_iter().map(|e| format!("output_file[{n}]: {e}")));
        }
        for (n, o) in self.output_tcp.iter().enumerate() {
            if o.host.is_empty() {
                errs.push(format!("output_tcp[{n}]: host must not be empty"));
            }
            errs.extend(o.flat.validate().into_iter().map(|e| format!("output_tcp[{n}]: {e}")));
        }
        for (n, o) in self.output_fluent.iter().enumerate() {
            if o.host.is_empty() {
                errs.push(format!("output_fluent[{n}]: host must not be empty"));
            }
            if let Err(e) = validate_tag(&o.tag) {
                errs.push(format!("output_fluent[{n}]: {e}"));
            }
            errs.extend(o.common.validate().into_iter().map(|e| format!("output_fluent[{n}]: {e}")));
        }
        for (n, o) in self.output_kafka.iter().enumerate() {
            if o.topic.is_empty() {
                errs.push(format!("output_kafka[{n}]: topic must not be empty"));
            }
            if o.hosts.is_empty() {
                errs.push(format!("output_kafka[{n}]: hosts must not be empty"));
            }
            if o.mode == KafkaMode::Avro && o.schema_registry_url.is_none() {
                errs.push(format!("output_kafka[{n}]: schema_registry_url is required in avro mode"));
            }
            errs.extend(o.common.validate().into_iter().map(|e| format!("output_kafka[{n}]: {e}")));
        }
        for (n, o) in self.output_nats.iter().enumerate() {
            errs.extend(o.common.validate().into_iter().map(|e| format!("output_nats[{n}]: {e}")));
        }
        for (n, o) in self.output_prometheus.iter().enumerate() {
            if o.counters.is_empty() {
                errs.push(format!("output_prometheus[{n}]: at least one counter must be configured"));
            }
        }
        for (n, o) in self.output_stdout.iter().enumerate() {
            errs.extend(o.flat.validate().into_iter().map(|e| format!("output_stdout[{n}]: {e}")));
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(errs)
        }
    }
}

fn validate_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() {
        return Err("tag must not be empty".to_string());
    }
    if tag.starts_with('.') || tag.ends_with('.') {
        return Err("tag must not start or end with a dot".to_string());
    }
    let valid_label = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !tag.split('.').all(valid_label) {
        return Err("tag labels must only contain lower-case letters, digits and underscore".to_string());
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct InputUnixConfig {
    pub path: PathBuf,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct InputFileConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct InputTailConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputTcpConfig {
    pub address: String,
    pub port: u16,
}

impl Default for InputTcpConfig {
    fn default() -> Self {
        Self { address: "0.0.0.0".to_string(), port: 10053 }
    }
}

impl InputTcpConfig {
    pub fn socket_addr(&self) -> String {
        let address = if self.address.is_empty() { "0.0.0.0" } else { &self.address };
        let port = if self.port == 0 { 10053 } else { self.port };
        format!("{address}:{port}")
    }
}

/// `IPv4Mask`/`IPv6Mask`/ECS/hash-IP toggles and salt path, shared by
/// every sink kind (`Flat` in the config this replaces).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlatOptions {
    #[serde(default = "default_ipv4_mask")]
    pub ipv4_mask: u8,
    #[serde(default = "default_ipv6_mask")]
    pub ipv6_mask: u8,
    pub enable_ecs: bool,
    pub enable_hash_ip: bool,
    pub ip_hash_salt_path: Option<PathBuf>,
}

impl Default for FlatOptions {
    fn default() -> Self {
        Self {
            ipv4_mask: default_ipv4_mask(),
            ipv6_mask: default_ipv6_mask(),
            enable_ecs: false,
            enable_hash_ip: false,
            ip_hash_salt_path: None,
        }
    }
}

impl FlatOptions {
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();
        if !(1..=32).contains(&self.ipv4_mask) {
            errs.push("ipv4_mask must be in range 1..=32".to_string());
        }
        if !(1..=128).contains(&self.ipv6_mask) {
            errs.push("ipv6_mask must be in range 1..=128".to_string());
        }
        errs
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OutputBufferOptions {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u32,
}

impl OutputBufferOptions {
    pub fn size(&self) -> usize {
        if self.buffer_size == 0 { default_buffer_size() as usize } else { self.buffer_size as usize }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OutputUnixConfig {
    pub path: PathBuf,
    #[serde(flatten)]
    pub buffer: OutputBufferOptions,
    #[serde(flatten)]
    pub flat: FlatOptions,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OutputFileConfig {
    pub path: String,
    pub user: Option<String>,
    #[serde(flatten)]
    pub buffer: OutputBufferOptions,
    #[serde(flatten)]
    pub flat: FlatOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputTcpConfig {
    pub host: String,
    pub port: u16,
    #[serde(flatten)]
    pub buffer: OutputBufferOptions,
    #[serde(flatten)]
    pub flat: FlatOptions,
}

impl Default for OutputTcpConfig {
    fn default() -> Self {
        Self { host: String::new(), port: 10053, buffer: Default::default(), flat: Default::default() }
    }
}

impl OutputTcpConfig {
    pub fn socket_addr(&self) -> String {
        let host = if self.host.is_empty() { "localhost" } else { &self.host };
        let port = if self.port == 0 { 10053 } else { self.port };
        format!("{host}:{port}")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OutputCommonOptions {
    #[serde(flatten)]
    pub flat: FlatOptions,
    #[serde(flatten)]
    pub buffer: OutputBufferOptions,
}

impl OutputCommonOptions {
    pub fn validate(&self) -> Vec<String> {
        self.flat.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputFluentConfig {
    pub host: String,
    pub port: u16,
    pub tag: String,
    #[serde(flatten)]
    pub common: OutputCommonOptions,
}

impl Default for OutputFluentConfig {
    fn default() -> Self {
        Self { host: String::new(), port: 24224, tag: String::new(), common: Default::default() }
    }
}

impl OutputFluentConfig {
    pub fn socket_addr(&self) -> String {
        let port = if self.port == 0 { 24224 } else { self.port };
        format!("{}:{port}", self.host)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KafkaMode {
    #[default]
    Protobuf,
    Json,
    Avro,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OutputKafkaConfig {
    pub hosts: Vec<String>,
    pub topic: String,
    pub retry: u32,
    pub mode: KafkaMode,
    /// Producer record key when `mode = "protobuf"`.
    pub key: Option<String>,
    pub schema_registry_url: Option<String>,
    #[serde(flatten)]
    pub common: OutputCommonOptions,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OutputNatsConfig {
    pub host: String,
    pub subject: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    #[serde(flatten)]
    pub common: OutputCommonOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusCounterConfig {
    pub name: String,
    pub help: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OutputPrometheusConfig {
    pub counters: Vec<PrometheusCounterConfig>,
    /// Seconds a label tuple may go unobserved before it is dropped; `None`
    /// disables expiry.
    pub expire_seconds: Option<u64>,
    pub interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StdoutFormat {
    #[default]
    Json,
    Template,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OutputStdoutConfig {
    pub format: StdoutFormat,
    /// Used when `format = "template"`; `{field}` placeholders are
    /// substituted from the flattened record.
    pub template: Option<String>,
    #[serde(flatten)]
    pub flat: FlatOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_small_input_msg_buffer() {
        let config = Config { input_msg_buffer: 1, ..Default::default() };
        let errs = config.validate().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("input_msg_buffer")));
    }

    #[test]
    fn collects_every_error_not_just_the_first() {
        let config = Config {
            input_msg_buffer: 1,
            input_file: vec![InputFileConfig { path: PathBuf::new() }],
            ..Default::default()
        };
        let errs = config.validate().unwrap_err();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn fluent_tag_validation_rejects_leading_dot() {
        assert!(validate_tag(".foo").is_err());
        assert!(validate_tag("foo.").is_err());
        assert!(validate_tag("foo.bar_baz").is_ok());
        assert!(validate_tag("Foo").is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            input_msg_buffer = 10000

            [[input_file]]
            path = "/var/log/dnstap.fstrm"

            [[output_stdout]]
            format = "json"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.input_file.len(), 1);
        assert_eq!(config.output_stdout.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tcp_defaults_match_dnstap_convention() {
        let input: InputTcpConfig = toml::from_str("").unwrap();
        assert_eq!(input.socket_addr(), "0.0.0.0:10053");

        let output: OutputTcpConfig = toml::from_str("host = \"example.org\"").unwrap();
        assert_eq!(output.socket_addr(), "example.org:10053");

        let fluent: OutputFluentConfig = toml::from_str("host = \"example.org\"\ntag = \"dns.query\"").unwrap();
        assert_eq!(fluent.socket_addr(), "example.org:24224");
    }
}
