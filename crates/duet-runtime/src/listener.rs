//! SocketServer: TCP listener for producer events.
//!
//! The accept loop runs on a dedicated thread with its own current-thread
//! runtime so nothing the render loop does can stall it. The thread only
//! decodes envelopes and posts [`ListenerEvent`]s; it never touches the
//! session.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use duet_core::WireMessage;
use duet_core::emitter::{HOST_ENV, PORT_ENV};

use crate::config::{BusyPolicy, ListenerConfig};

/// Accept wakes up at least this often even without connections.
const ACCEPT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to build listener runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to spawn listener thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("listener thread exited before it was ready")]
    Lost,
}

/// What the listener thread reports to the render loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Connected { peer: SocketAddr },
    Message { peer: SocketAddr, message: WireMessage },
    Rejected { peer: SocketAddr },
    Disconnected { peer: SocketAddr },
}

pub struct SocketServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    kick: Arc<Notify>,
    done_rx: std_mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl SocketServer {
    /// Bind and start accepting. Returns once the socket is listening.
    pub fn start(config: &ListenerConfig, events: mpsc::UnboundedSender<ListenerEvent>) -> Result<Self, ListenerError> {
        let addr = config.addr();
        let backlog = config.backlog.max(1);
        let policy = config.busy_policy;
        let cancel = CancellationToken::new();
        let kick = Arc::new(Notify::new());
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<SocketAddr, ListenerError>>();
        let (done_tx, done_rx) = std_mpsc::channel();

        let thread_cancel = cancel.clone();
        let thread_kick = Arc::clone(&kick);
        let thread = std::thread::Builder::new()
            .name("duet-listener".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ListenerError::Runtime(e)));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match bind(addr, backlog) {
                        Ok(listener) => listener,
                        Err(source) => {
                            let _ = ready_tx.send(Err(ListenerError::Bind { addr, source }));
                            return;
                        }
                    };
                    let local = listener.local_addr().unwrap_or(addr);
                    if ready_tx.send(Ok(local)).is_err() {
                        return;
                    }
                    info!(addr = %local, ?policy, "result listener started");
                    serve(listener, policy, events, thread_cancel, thread_kick).await;
                });
                let _ = done_tx.send(());
            })
            .map_err(ListenerError::Thread)?;

        let addr = match ready_rx.recv() {
            Ok(Ok(addr)) => addr,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(ListenerError::Lost);
            }
        };

        Ok(Self {
            addr,
            cancel,
            kick,
            done_rx,
            thread: Some(thread),
            stop_timeout: config.stop_timeout(),
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Close the active producer connection, if any. Used when a new run
    /// starts so a producer left over from the previous one cannot hold the
    /// slot.
    pub fn drop_connection(&self) {
        self.kick.notify_one();
    }

    /// Stop accepting, close everything and join the thread. Overrunning
    /// the stop timeout is logged, not returned.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.cancel.cancel();
        match self.done_rx.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    warn!("listener thread panicked");
                }
                info!(addr = %self.addr, "result listener stopped");
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    addr = %self.addr,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "listener thread did not stop in time, detaching"
                );
            }
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

struct Active {
    peer: SocketAddr,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Active {
    async fn close(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn serve(
    listener: TcpListener,
    policy: BusyPolicy,
    events: mpsc::UnboundedSender<ListenerEvent>,
    cancel: CancellationToken,
    kick: Arc<Notify>,
) {
    let mut active: Option<Active> = None;

    loop {
        if active.as_ref().is_some_and(|a| a.handle.is_finished()) {
            active = None;
        }

        // Queue: leave newcomers in the backlog until the slot frees up.
        if policy == BusyPolicy::Queue {
            if let Some(mut current) = active.take() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        active = Some(current);
                        break;
                    }
                    _ = kick.notified() => {
                        debug!(peer = %current.peer, "closing connection for new run");
                        current.close().await;
                    }
                    _ = &mut current.handle => {}
                }
                continue;
            }
        }

        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = kick.notified() => {
                if let Some(current) = active.take() {
                    debug!(peer = %current.peer, "closing connection for new run");
                    current.close().await;
                }
                continue;
            }
            accepted = tokio::time::timeout(ACCEPT_POLL, listener.accept()) => accepted,
        };
        let (stream, peer) = match accepted {
            Err(_elapsed) => continue,
            Ok(Err(e)) => {
                warn!(error = %e, "accept failed");
                continue;
            }
            Ok(Ok(pair)) => pair,
        };

        if let Some(current) = active.take() {
            match policy {
                BusyPolicy::Replace => {
                    info!(old = %current.peer, new = %peer, "replacing producer connection");
                    current.close().await;
                }
                BusyPolicy::Reject | BusyPolicy::Queue => {
                    warn!(%peer, active = %current.peer, "producer already connected, rejecting");
                    active = Some(current);
                    let _ = events.send(ListenerEvent::Rejected { peer });
                    drop(stream);
                    continue;
                }
            }
        }

        debug!(%peer, "producer connected");
        let conn_cancel = cancel.child_token();
        let handle = tokio::spawn(read_connection(stream, peer, events.clone(), conn_cancel.clone()));
        active = Some(Active {
            peer,
            cancel: conn_cancel,
            handle,
        });
    }

    if let Some(current) = active.take() {
        current.close().await;
    }
    debug!("accept loop finished");
}

/// Read newline-delimited envelopes until EOF, error or cancellation.
/// A trailing line without its newline is incomplete and dropped.
async fn read_connection(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<ListenerEvent>,
    cancel: CancellationToken,
) {
    let _ = events.send(ListenerEvent::Connected { peer });
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) if buf.last() != Some(&b'\n') => {
                debug!(%peer, bytes = buf.len(), "dropping incomplete line at end of stream");
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if line.trim().is_empty() {
                    continue;
                }
                match WireMessage::decode_line(&line) {
                    Ok(message) => {
                        if events.send(ListenerEvent::Message { peer, message }).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%peer, error = %e, "dropping malformed message"),
                }
            }
            Err(e) => {
                debug!(%peer, error = %e, "connection read failed");
                break;
            }
        }
    }

    debug!(%peer, "producer disconnected");
    let _ = events.send(ListenerEvent::Disconnected { peer });
}

// ---------------------------------------------------------------------------
// Child environment
// ---------------------------------------------------------------------------

/// `DUET_HOST` / `DUET_PORT` for a child process so an embedded emitter
/// finds the listener. Without one, port 0 sends the emitter straight to
/// marker output.
pub fn producer_env(addr: Option<SocketAddr>) -> Vec<(String, String)> {
    let (host, port) = match addr {
        Some(addr) if addr.ip().is_unspecified() => {
            let ip: IpAddr = if addr.is_ipv4() {
                Ipv4Addr::LOCALHOST.into()
            } else {
                Ipv6Addr::LOCALHOST.into()
            };
            (ip.to_string(), addr.port())
        }
        Some(addr) => (addr.ip().to_string(), addr.port()),
        None => (Ipv4Addr::LOCALHOST.to_string(), 0),
    };
    vec![(HOST_ENV.to_owned(), host), (PORT_ENV.to_owned(), port.to_string())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream as StdStream;
    use std::time::Instant;

    fn test_config(policy: BusyPolicy) -> ListenerConfig {
        ListenerConfig {
            port: 0,
            busy_policy: policy,
            ..ListenerConfig::default()
        }
    }

    fn start(policy: BusyPolicy) -> (SocketServer, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = SocketServer::start(&test_config(policy), tx).unwrap();
        (server, rx)
    }

    /// Block until the next event or panic after two seconds.
    fn next_event(rx: &mut mpsc::UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match rx.try_recv() {
                Ok(event) => return event,
                Err(mpsc::error::TryRecvError::Empty) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("no listener event: {e:?}"),
            }
        }
    }

    #[test]
    fn decodes_lines_and_drops_malformed() {
        let (server, mut rx) = start(BusyPolicy::Reject);
        let mut conn = StdStream::connect(server.local_addr()).unwrap();
        conn.write_all(b"{\"type\":\"session_start\",\"timestamp\":1.0,\"data\":{\"test_count\":2}}\n")
            .unwrap();
        conn.write_all(b"not json\n\n").unwrap();
        conn.write_all(b"{\"type\":\"test_start\",\"data\":{\"id\":\"t1\"}}\n").unwrap();
        drop(conn);

        assert!(matches!(next_event(&mut rx), ListenerEvent::Connected { .. }));
        let ListenerEvent::Message { message, .. } = next_event(&mut rx) else {
            panic!("expected message");
        };
        assert_eq!(message.kind, "session_start");
        let ListenerEvent::Message { message, .. } = next_event(&mut rx) else {
            panic!("expected message");
        };
        assert_eq!(message.kind, "test_start");
        assert!(matches!(next_event(&mut rx), ListenerEvent::Disconnected { .. }));
    }

    #[test]
    fn partial_line_is_dropped_and_server_keeps_accepting() {
        let (server, mut rx) = start(BusyPolicy::Reject);
        let mut conn = StdStream::connect(server.local_addr()).unwrap();
        conn.write_all(b"{\"type\":\"test_result\",\"data\":{\"id\":\"t1\",\"sta").unwrap();
        drop(conn);
        assert!(matches!(next_event(&mut rx), ListenerEvent::Connected { .. }));
        assert!(matches!(next_event(&mut rx), ListenerEvent::Disconnected { .. }));

        let mut conn = StdStream::connect(server.local_addr()).unwrap();
        conn.write_all(b"{\"type\":\"test_start\",\"data\":{\"id\":\"t2\"}}\n").unwrap();
        assert!(matches!(next_event(&mut rx), ListenerEvent::Connected { .. }));
        assert!(matches!(next_event(&mut rx), ListenerEvent::Message { .. }));
    }

    #[test]
    fn second_producer_is_rejected() {
        let (server, mut rx) = start(BusyPolicy::Reject);
        let _first = StdStream::connect(server.local_addr()).unwrap();
        assert!(matches!(next_event(&mut rx), ListenerEvent::Connected { .. }));

        let second = StdStream::connect(server.local_addr()).unwrap();
        let second_port = second.local_addr().unwrap().port();
        match next_event(&mut rx) {
            ListenerEvent::Rejected { peer } => assert_eq!(peer.port(), second_port),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn replace_policy_serves_newcomer() {
        let (server, mut rx) = start(BusyPolicy::Replace);
        let _first = StdStream::connect(server.local_addr()).unwrap();
        assert!(matches!(next_event(&mut rx), ListenerEvent::Connected { .. }));

        let mut second = StdStream::connect(server.local_addr()).unwrap();
        assert!(matches!(next_event(&mut rx), ListenerEvent::Disconnected { .. }));
        assert!(matches!(next_event(&mut rx), ListenerEvent::Connected { .. }));
        second.write_all(b"{\"type\":\"test_start\",\"data\":{\"id\":\"t1\"}}\n").unwrap();
        assert!(matches!(next_event(&mut rx), ListenerEvent::Message { .. }));
    }

    #[test]
    fn queue_policy_serves_after_first_leaves() {
        let (server, mut rx) = start(BusyPolicy::Queue);
        let first = StdStream::connect(server.local_addr()).unwrap();
        assert!(matches!(next_event(&mut rx), ListenerEvent::Connected { .. }));

        let mut second = StdStream::connect(server.local_addr()).unwrap();
        second.write_all(b"{\"type\":\"test_start\",\"data\":{\"id\":\"t1\"}}\n").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());

        drop(first);
        assert!(matches!(next_event(&mut rx), ListenerEvent::Disconnected { .. }));
        assert!(matches!(next_event(&mut rx), ListenerEvent::Connected { .. }));
        assert!(matches!(next_event(&mut rx), ListenerEvent::Message { .. }));
    }

    #[test]
    fn drop_connection_frees_the_slot() {
        let (server, mut rx) = start(BusyPolicy::Reject);
        let _stale = StdStream::connect(server.local_addr()).unwrap();
        assert!(matches!(next_event(&mut rx), ListenerEvent::Connected { .. }));

        server.drop_connection();
        assert!(matches!(next_event(&mut rx), ListenerEvent::Disconnected { .. }));

        let _fresh = StdStream::connect(server.local_addr()).unwrap();
        assert!(matches!(next_event(&mut rx), ListenerEvent::Connected { .. }));
    }

    #[test]
    fn stop_is_bounded_and_port_is_reusable() {
        let (mut server, mut rx) = start(BusyPolicy::Reject);
        let addr = server.local_addr();
        let _open = StdStream::connect(addr).unwrap();
        assert!(matches!(next_event(&mut rx), ListenerEvent::Connected { .. }));

        let begun = Instant::now();
        server.stop();
        assert!(begun.elapsed() < Duration::from_millis(2500));
        server.stop();

        let config = ListenerConfig {
            port: addr.port(),
            ..ListenerConfig::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let again = SocketServer::start(&config, tx).unwrap();
        assert_eq!(again.local_addr(), addr);
    }

    #[test]
    fn bind_conflict_is_reported() {
        let (server, _rx) = start(BusyPolicy::Reject);
        let config = ListenerConfig {
            port: server.local_addr().port(),
            ..ListenerConfig::default()
        };
        let (tx, _rx2) = mpsc::unbounded_channel();
        assert!(matches!(SocketServer::start(&config, tx), Err(ListenerError::Bind { .. })));
    }

    #[test]
    fn producer_env_points_at_listener() {
        let env = producer_env(Some("0.0.0.0:5000".parse().unwrap()));
        assert_eq!(
            env,
            vec![
                ("DUET_HOST".to_owned(), "127.0.0.1".to_owned()),
                ("DUET_PORT".to_owned(), "5000".to_owned())
            ]
        );
        let env = producer_env(Some("[::]:5001".parse().unwrap()));
        assert_eq!(env[0].1, "::1");
        let env = producer_env(Some("192.168.1.4:5002".parse().unwrap()));
        assert_eq!(env[0].1, "192.168.1.4");
        assert_eq!(producer_env(None)[1].1, "0");
    }
}
