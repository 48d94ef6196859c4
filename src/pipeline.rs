//! Wires inputs, the shared ingress buffer, the broadcaster, and every
//! output's supervised buffer together, and carries out the ordered
//! shutdown the hierarchical cancellation model requires.
//!
//! Grounded in `dns_server.rs`'s per-bind-address task fan-out, but the
//! shutdown order itself has no analogue there (the server this replaces
//! has no drain phase) — it follows the ring-buffer/broadcaster/output
//! staging this relay's own component design calls for.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::RingBuffer;
use crate::config::Config;
use crate::flatten::FlattenOptions;
use crate::input;
use crate::metrics::SharedCounters;
use crate::output::{self, Sink};
use crate::privacy::SaltManager;

struct OutputHandle {
    name: String,
    buffer: Arc<RingBuffer>,
    task: JoinHandle<()>,
}

pub struct Pipeline {
    input_cancel: CancellationToken,
    output_cancel: CancellationToken,
    input_tasks: Vec<JoinHandle<()>>,
    ingress: Arc<RingBuffer>,
    broadcaster: JoinHandle<()>,
    outputs: Vec<OutputHandle>,
    // kept alive for the process lifetime; dropping stops the watcher task
    _salt_watchers: Vec<tokio::task::JoinHandle<()>>,
    fatal_rx: tokio::sync::mpsc::UnboundedReceiver<anyhow::Error>,
    // holds the channel open so `fatal_rx.recv()` blocks rather than
    // returning `None` when there are no tcp/unix inputs to ever send on it
    _fatal_tx: input::socket::FatalSender,
}

impl Pipeline {
    /// Builds every configured input, output, and the broadcaster between
    /// them, and starts them all running.
    pub async fn spawn(config: &Config, counters: SharedCounters, hostname: String) -> Result<Self> {
        let input_cancel = CancellationToken::new();
        let output_cancel = CancellationToken::new();

        let ingress = Arc::new(RingBuffer::new(
            config.input_msg_buffer as usize,
            counters.input_recv_total.clone(),
            counters.input_lost_total.clone(),
        ));

        let mut input_tasks = Vec::new();
        let mut salt_watchers = Vec::new();
        let (fatal_tx, fatal_rx) = tokio::sync::mpsc::unbounded_channel();

        for entry in &config.input_file {
            let path = entry.path.to_string_lossy().into_owned();
            let buffer = ingress.clone();
            input_tasks.push(tokio::spawn(async move { input::file::run(path, buffer).await }));
        }
        for entry in &config.input_tail {
            let pattern = entry.path.clone();
            let buffer = ingress.clone();
            let cancel = input_cancel.child_token();
            input_tasks.push(tokio::spawn(async move { input::tail::run(pattern, buffer, cancel).await }));
        }
        for entry in &config.input_unix {
            let path = entry.path.clone();
            let user = entry.user.clone();
            let buffer = ingress.clone();
            let cancel = input_cancel.child_token();
            let fatal = fatal_tx.clone();
            input_tasks.push(tokio::spawn(async move { input::socket::run_unix(path, user, buffer, cancel, fatal).await }));
        }
        for entry in &config.input_tcp {
            let addr = entry.socket_addr();
            let buffer = ingress.clone();
            let cancel = input_cancel.child_token();
            let fatal = fatal_tx.clone();
            input_tasks.push(tokio::spawn(async move { input::socket::run_tcp(addr, buffer, cancel, fatal).await }));
        }

        let mut outputs = Vec::new();

        for entry in &config.output_file {
            // the file sink relays raw frames untouched; `flat` on this
            // config exists only so the shared `OutputFileConfig` shape
            // matches the other output kinds.
            let sink: Box<dyn Sink> = Box::new(output::file::FileSink::new(entry.path.clone(), entry.user.clone()));
            outputs.push(spawn_output("file", entry.buffer.size(), counters.clone(), sink, output_cancel.child_token()));
        }
        for entry in &config.output_unix {
            let sink: Box<dyn Sink> = Box::new(output::socket::UnixSink::new(entry.path.clone()));
            outputs.push(spawn_output("unix", entry.buffer.size(), counters.clone(), sink, output_cancel.child_token()));
        }
        for entry in &config.output_tcp {
            let sink: Box<dyn Sink> = Box::new(output::socket::TcpSink::new(entry.socket_addr()));
            outputs.push(spawn_output("tcp", entry.buffer.size(), counters.clone(), sink, output_cancel.child_token()));
        }
        for entry in &config.output_fluent {
            let salt = start_salt(&entry.common.flat, &mut salt_watchers)?;
            let flat = flatten_options(&entry.common.flat, &hostname, salt);
            let sink: Box<dyn Sink> = Box::new(output::fluent::FluentSink::new(entry.socket_addr(), entry.tag.clone(), flat));
            outputs.push(spawn_output("fluent", entry.common.buffer.size(), counters.clone(), sink, output_cancel.child_token()));
        }
        for entry in &config.output_kafka {
            let salt = start_salt(&entry.common.flat, &mut salt_watchers)?;
            let flat = flatten_options(&entry.common.flat, &hostname, salt);
            let sink: Box<dyn Sink> = Box::new(output::kafka::KafkaSink::new(
                entry.hosts.clone(),
                entry.topic.clone(),
                entry.retry,
                entry.mode,
                entry.key.clone(),
                entry.schema_registry_url.clone(),
                flat,
            ));
            outputs.push(spawn_output("kafka", entry.common.buffer.size(), counters.clone(), sink, output_cancel.child_token()));
        }
        for entry in &config.output_nats {
            let salt = start_salt(&entry.common.flat, &mut salt_watchers)?;
            let flat = flatten_options(&entry.common.flat, &hostname, salt);
            let sink: Box<dyn Sink> = Box::new(output::nats::NatsSink::new(
                entry.host.clone(),
                entry.subject.clone(),
                entry.user.clone(),
                entry.password.clone(),
                entry.token.clone(),
                flat,
            ));
            outputs.push(spawn_output("nats", entry.common.buffer.size(), counters.clone(), sink, output_cancel.child_token()));
        }
        for entry in &config.output_prometheus {
            let flat = FlattenOptions::with_defaults(hostname.clone());
            let sink: Box<dyn Sink> =
                Box::new(output::prometheus::PrometheusSink::new(crate::metrics::REGISTRY.clone(), &entry.counters, flat, entry.expire_seconds)?);
            let buffer_size = crate::config::OutputBufferOptions::default().size();
            outputs.push(spawn_output("prometheus", buffer_size, counters.clone(), sink, output_cancel.child_token()));
        }
        for entry in &config.output_stdout {
            let salt = start_salt(&entry.flat, &mut salt_watchers)?;
            let flat = flatten_options(&entry.flat, &hostname, salt);
            let sink: Box<dyn Sink> = Box::new(match (&entry.format, &entry.template) {
                (crate::config::StdoutFormat::Template, Some(template)) => output::stdout::StdoutSink::new_template(template.clone(), flat),
                _ => output::stdout::StdoutSink::new_json(flat),
            });
            let buffer_size = crate::config::OutputBufferOptions::default().size();
            outputs.push(spawn_output("stdout", buffer_size, counters.clone(), sink, output_cancel.child_token()));
        }

        let broadcaster = spawn_broadcaster(ingress.clone(), outputs.iter().map(|o| o.buffer.clone()).collect());

        Ok(Self {
            input_cancel,
            output_cancel,
            input_tasks,
            ingress,
            broadcaster,
            outputs,
            _salt_watchers: salt_watchers,
            fatal_rx,
            _fatal_tx: fatal_tx,
        })
    }

    /// Resolves when a tcp/unix input hits a bind failure or a fatal
    /// accept error. Pending forever if nothing ever goes wrong, since the
    /// pipeline keeps its own sender alive to hold the channel open.
    pub async fn wait_fatal(&mut self) -> anyhow::Error {
        match self.fatal_rx.recv().await {
            Some(err) => err,
            None => unreachable!("pipeline holds its own fatal sender alive"),
        }
    }

    /// Carries out the shutdown order the concurrency model specifies:
    /// inputs first, then the ingress buffer, then the broadcaster, then
    /// outputs.
    pub async fn shutdown(self) {
        self.input_cancel.cancel();
        for task in self.input_tasks {
            let _ = task.await;
        }

        self.ingress.close();
        let _ = self.broadcaster.await;

        self.output_cancel.cancel();
        for output in self.outputs {
            let _ = output.task.await;
            tracing::debug!(sink = %output.name, "output shut down");
        }
    }
}

fn spawn_output(kind: &str, buffer_size: usize, counters: SharedCounters, sink: Box<dyn Sink>, cancel: CancellationToken) -> OutputHandle {
    let name = kind.to_string();
    let buffer = Arc::new(RingBuffer::new(buffer_size, counters.output_recv_total.clone(), counters.output_lost_total.clone()));
    let task_buffer = buffer.clone();
    let task_name = name.clone();
    let task = tokio::spawn(async move { output::run_supervisor(task_name, task_buffer, sink, cancel).await });
    OutputHandle { name, buffer, task }
}

fn spawn_broadcaster(ingress: Arc<RingBuffer>, outputs: Vec<Arc<RingBuffer>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = ingress.read().await {
            for output in &outputs {
                output.write(frame.clone());
            }
        }
        for output in &outputs {
            output.close();
        }
    })
}

fn start_salt(flat: &crate::config::FlatOptions, watchers: &mut Vec<tokio::task::JoinHandle<()>>) -> Result<Option<SaltManager>> {
    if !flat.enable_hash_ip {
        return Ok(None);
    }
    let (manager, watcher) = SaltManager::start(flat.ip_hash_salt_path.clone()).context("starting privacy salt manager")?;
    if let Some(watcher) = watcher {
        watchers.push(watcher);
    }
    Ok(Some(manager))
}

fn flatten_options(flat: &crate::config::FlatOptions, hostname: &str, salt: Option<SaltManager>) -> FlattenOptions {
    FlattenOptions {
        ipv4_mask: flat.ipv4_mask,
        ipv6_mask: flat.ipv6_mask,
        enable_ecs: flat.enable_ecs,
        enable_hash_ip: flat.enable_hash_ip,
        salt,
        hostname: hostname.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_stream::{UnidirectionalDecoder, UnidirectionalEncoder};
    use crate::output::file::FileSink;
    use async_trait::async_trait;
    use bytes::Bytes;
    use prometheus::{IntCounter, Opts};
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{BufReader, BufWriter};
    use tokio::sync::Notify;

    fn counter(name: &str) -> IntCounter {
        IntCounter::with_opts(Opts::new(name, name)).unwrap()
    }

    /// Spec scenario 2: a FrameStream file carried through a file input and
    /// a file output comes out with the same frame payloads it went in
    /// with.
    #[tokio::test]
    async fn file_to_file_round_trip_preserves_frame_bytes() {
        let dir = std::env::temp_dir().join(format!("dnstap-relay-pipeline-roundtrip-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let input_path = dir.join("in.fstrm");
        let output_path = dir.join("out.fstrm");

        let file = tokio::fs::File::create(&input_path).await.unwrap();
        let mut encoder = UnidirectionalEncoder::handshake(BufWriter::new(file)).await.unwrap();
        let mut expected = Sha256::new();
        for i in 0..100u32 {
            let frame = format!("synthetic-dnstap-message-{i}").into_bytes();
            expected.update(&frame);
            encoder.write_frame(&frame).await.unwrap();
        }
        encoder.close().await.unwrap();
        let expected = expected.finalize();

        let ingress = Arc::new(RingBuffer::new(1000, counter("rt_input_recv"), counter("rt_input_lost")));
        input::file::run(input_path.to_string_lossy().into_owned(), ingress.clone()).await;
        ingress.close();

        let output_buffer = Arc::new(RingBuffer::new(1000, counter("rt_output_recv"), counter("rt_output_lost")));
        while let Some(frame) = ingress.read().await {
            output_buffer.write(frame);
        }
        output_buffer.close();

        let sink: Box<dyn Sink> = Box::new(FileSink::new(output_path.to_string_lossy().into_owned(), None));
        output::run_supervisor("roundtrip".to_string(), output_buffer, sink, CancellationToken::new()).await;

        let file = tokio::fs::File::open(&output_path).await.unwrap();
        let mut decoder = UnidirectionalDecoder::handshake(BufReader::new(file)).await.unwrap();
        let mut actual = Sha256::new();
        let mut frame_count = 0;
        while let Some(frame) = decoder.next_frame().await.unwrap() {
            actual.update(&frame);
            frame_count += 1;
        }
        let actual = actual.finalize();

        assert_eq!(frame_count, 100);
        assert_eq!(actual.as_slice(), expected.as_slice());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    /// Drains as fast as the producer writes: acks every frame via `ack` so
    /// the test can pace production to exactly keep this sink's buffer
    /// from ever holding more than one frame.
    struct FastSink {
        ack: Arc<Notify>,
    }

    #[async_trait]
    impl Sink for FastSink {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }
        async fn write(&mut self, _frame: &[u8]) -> Result<()> {
            self.ack.notify_one();
            Ok(())
        }
        async fn close(&mut self) {}
    }

    /// Makes no progress at all until `released` flips, simulating a sink
    /// that cannot keep up with the burst; its buffer overflows on the
    /// writer side exactly the way any stalled consumer's would.
    struct SlowSink {
        released: Arc<AtomicBool>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl Sink for SlowSink {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }
        async fn write(&mut self, _frame: &[u8]) -> Result<()> {
            if !self.released.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            Ok(())
        }
        async fn close(&mut self) {}
    }

    /// Spec scenario 5: fanning the same burst out to a fast sink and a
    /// stalled sink bounds loss to the stalled one; the fast sink loses
    /// nothing.
    #[tokio::test]
    async fn fan_out_bounds_loss_to_the_slow_sink_while_the_fast_sink_stays_lossless() {
        let capacity = 8usize;
        let burst = 500u32;

        let fast_recv = counter("fanout_fast_recv");
        let fast_lost = counter("fanout_fast_lost");
        let slow_recv = counter("fanout_slow_recv");
        let slow_lost = counter("fanout_slow_lost");

        let fast_buf = Arc::new(RingBuffer::new(capacity, fast_recv.clone(), fast_lost.clone()));
        let slow_buf = Arc::new(RingBuffer::new(capacity, slow_recv.clone(), slow_lost.clone()));

        let fast_ack = Arc::new(Notify::new());
        let fast_sink: Box<dyn Sink> = Box::new(FastSink { ack: fast_ack.clone() });
        let fast_task = tokio::spawn(output::run_supervisor("fast".to_string(), fast_buf.clone(), fast_sink, CancellationToken::new()));

        let slow_released = Arc::new(AtomicBool::new(false));
        let slow_gate = Arc::new(Notify::new());
        let slow_sink: Box<dyn Sink> = Box::new(SlowSink { released: slow_released.clone(), gate: slow_gate.clone() });
        let slow_task = tokio::spawn(output::run_supervisor("slow".to_string(), slow_buf.clone(), slow_sink, CancellationToken::new()));

        // let both supervisors reach their first `buffer.read()` before the
        // burst starts, so the slow one is already parked on its gate.
        tokio::task::yield_now().await;

        for i in 0..burst {
            let frame = Bytes::from(i.to_be_bytes().to_vec());
            fast_buf.write(frame.clone());
            fast_ack.notified().await; // pace production to the fast sink's actual drain rate
            slow_buf.write(frame);
        }

        slow_released.store(true, Ordering::SeqCst);
        slow_gate.notify_waiters();

        fast_buf.close();
        slow_buf.close();
        fast_task.await.unwrap();
        slow_task.await.unwrap();

        assert_eq!(fast_recv.get(), burst as u64);
        assert_eq!(fast_lost.get(), 0, "a sink draining as fast as production should lose nothing");
        assert_eq!(slow_lost.get(), burst as u64 - capacity as u64, "a stalled sink should lose everything past its capacity");
    }
}
