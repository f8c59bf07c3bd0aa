//! Producer side: send events to the listener, or print marker lines when
//! no listener can be reached.
//!
//! The emitter is synchronous so it can live inside any test harness
//! without an async runtime.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::wire::{CompilePhase, TestEvent};

pub const DEFAULT_PORT: u16 = 43567;
pub const HOST_ENV: &str = "DUET_HOST";
pub const PORT_ENV: &str = "DUET_PORT";

const DEFAULT_HOSTS: [&str; 3] = ["127.0.0.1", "localhost", "0.0.0.0"];

#[derive(Debug, Clone, PartialEq)]
pub struct EmitterConfig {
    /// Tried in order.
    pub hosts: Vec<String>,
    pub port: u16,
    pub connect_timeout: Duration,
    pub attempts_per_host: u32,
    /// Sleep `backoff * attempt` between attempts on one host.
    pub backoff: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            hosts: DEFAULT_HOSTS.iter().map(|h| (*h).to_owned()).collect(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(1),
            attempts_per_host: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

impl EmitterConfig {
    /// Defaults overridden by `DUET_HOST` / `DUET_PORT`, as exported by the
    /// runner to its child.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::var(HOST_ENV).ok(), std::env::var(PORT_ENV).ok())
    }

    fn from_vars(host: Option<String>, port: Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(host) = host.map(|h| h.trim().to_owned()).filter(|h| !h.is_empty()) {
            config.hosts.retain(|h| *h != host);
            config.hosts.insert(0, host);
        }
        match port.as_deref().map(str::trim).map(str::parse::<u16>) {
            Some(Ok(port)) => config.port = port,
            Some(Err(err)) => warn!(%err, "ignoring invalid {PORT_ENV}"),
            None => {}
        }
        config
    }
}

/// Sends [`TestEvent`]s over the socket, falling back to marker lines on
/// `W` for the rest of its life once the socket is lost.
pub struct Emitter<W: Write> {
    config: EmitterConfig,
    stream: Option<TcpStream>,
    fallback: W,
    current_item: Option<String>,
}

impl<W: Write> Emitter<W> {
    /// Try every candidate host; stay in fallback mode if none answers.
    pub fn connect(config: EmitterConfig, fallback: W) -> Self {
        let stream = open(&config);
        if stream.is_none() {
            info!(port = config.port, "no listener reachable, printing markers");
        }
        Self {
            config,
            stream,
            fallback,
            current_item: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn into_fallback(self) -> W {
        self.fallback
    }

    /// Deliver one event. A failed send reconnects once and retries; after
    /// that the event and everything following go to the fallback writer.
    pub fn emit(&mut self, event: &TestEvent) -> io::Result<()> {
        if self.stream.is_some() {
            let line = event.to_wire(now_secs()).encode_line();
            if self.send(&line).is_ok() {
                return Ok(());
            }
            warn!(kind = event.kind(), "send failed, reconnecting");
            self.stream = open(&self.config);
            if self.send(&line).is_ok() {
                return Ok(());
            }
            warn!("listener lost, switching to marker output");
            self.stream = None;
        }
        for line in marker_lines(event, &mut self.current_item) {
            writeln!(self.fallback, "{line}")?;
        }
        self.fallback.flush()
    }

    fn send(&mut self, line: &str) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        stream.write_all(line.as_bytes())?;
        stream.flush()
    }
}

/// Port 0 means the runner has no listener; skip straight to markers.
fn open(config: &EmitterConfig) -> Option<TcpStream> {
    if config.port == 0 {
        return None;
    }
    for host in &config.hosts {
        for attempt in 1..=config.attempts_per_host {
            match connect_host(host, config.port, config.connect_timeout) {
                Ok(stream) => {
                    debug!(%host, port = config.port, attempt, "connected to listener");
                    return Some(stream);
                }
                Err(err) => {
                    debug!(%host, attempt, %err, "connect failed");
                    if attempt < config.attempts_per_host {
                        std::thread::sleep(config.backoff * attempt);
                    }
                }
            }
        }
    }
    None
}

fn connect_host(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let mut last = io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no address");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last = err,
        }
    }
    Err(last)
}

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Marker rendering
// ---------------------------------------------------------------------------

/// Marker lines for one event. `current_item` tracks which item is open so
/// consecutive events for one id share a single `TEST_ITEM_ID` line.
pub fn marker_lines(event: &TestEvent, current_item: &mut Option<String>) -> Vec<String> {
    let mut out = Vec::new();
    match event {
        TestEvent::SessionStart { test_count } => out.push(format!("TESTS {test_count}")),
        TestEvent::TestStart { id, description } => {
            open_item(&mut out, current_item, id);
            describe(&mut out, description);
        }
        TestEvent::TestInputs { id, inputs } => {
            open_item(&mut out, current_item, id);
            input_block(&mut out, inputs);
        }
        TestEvent::TestOutputs {
            id,
            reference,
            candidate,
        } => {
            open_item(&mut out, current_item, id);
            output_blocks(&mut out, reference, candidate);
        }
        TestEvent::TestResult(u) => {
            open_item(&mut out, current_item, &u.id);
            describe(&mut out, &u.description);
            input_block(&mut out, &u.inputs);
            output_blocks(&mut out, &u.reference, &u.candidate);
            if let Some(duration) = u.duration {
                out.push(format!("DURATION: {duration}"));
            }
            if let Some(verdict) = u.verdict {
                out.push(format!("OVERALL_STATUS: {}", verdict.as_wire()));
            }
            out.extend(u.reason.lines().map(|l| format!("FAIL_REASON: {l}")));
            out.extend(u.diff.lines().map(|l| format!("DIFF: {l}")));
            for diff in &u.detailed_diffs {
                let json = serde_json::to_string(diff).unwrap_or_else(|_| diff.summary_line());
                out.push(format!("DETAILED_DIFF: {json}"));
            }
            out.push("END_OF_TEST_ITEM".to_owned());
            *current_item = None;
        }
        TestEvent::SessionEnd(summary) => {
            *current_item = None;
            out.push("RUN_SCRIPT_SUMMARY_BEGIN".to_owned());
            out.push(format!("Tests completed: {}", summary.total));
            out.push(format!("Tests passed: {}", summary.passed));
            out.push(format!("Tests failed: {}", summary.failed));
            out.push(format!("Execution time: {}s", summary.duration));
            out.push("RUN_SCRIPT_SUMMARY_END".to_owned());
        }
        TestEvent::Compilation { phase, info } => {
            let key = match phase {
                CompilePhase::ReferenceStart => "CPP_COMPILE_START",
                CompilePhase::ReferenceEnd => "CPP_COMPILE_END",
                CompilePhase::CandidateStart => "MOJO_COMPILE_START",
                CompilePhase::CandidateEnd => "MOJO_COMPILE_END",
            };
            out.push(format!("{key}: {}", one_line(info)));
        }
    }
    out
}

fn open_item(out: &mut Vec<String>, current: &mut Option<String>, id: &str) {
    if current.as_deref() != Some(id) {
        out.push(format!("TEST_ITEM_ID: {id}"));
        *current = Some(id.to_owned());
    }
}

fn describe(out: &mut Vec<String>, description: &str) {
    if !description.trim().is_empty() {
        out.push(format!("DESCRIPTION: {}", one_line(description)));
    }
}

fn input_block(out: &mut Vec<String>, inputs: &[String]) {
    if inputs.is_empty() {
        return;
    }
    out.push("SHARED_INPUT_BEGIN".to_owned());
    out.extend(inputs.iter().cloned());
    out.push("SHARED_INPUT_END".to_owned());
}

fn output_blocks(out: &mut Vec<String>, reference: &[String], candidate: &[String]) {
    for (lines, begin, end) in [
        (reference, "CPP_STDOUT_BEGIN", "CPP_STDOUT_END"),
        (candidate, "MOJO_STDOUT_BEGIN", "MOJO_STDOUT_END"),
    ] {
        if lines.is_empty() {
            continue;
        }
        out.push(begin.to_owned());
        out.extend(lines.iter().map(|l| format!("OUTPUT: {l}")));
        out.push(end.to_owned());
    }
}

/// Marker values are single lines; everything else is kept as written.
fn one_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}
