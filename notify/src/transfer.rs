//! Fire-and-forget HTTP transfer multiplexer.
//!
//! Uses raw `TcpStream` so the only thing a submission costs the caller is
//! building the request bytes. Every pending transfer is a small state
//! machine (Connect → Send → Receive → Done/Failed) advanced by
//! [`TransferQueue::perform`], which never blocks and is meant to be called
//! once per frame tick. Responses are drained and discarded; the status is
//! logged at debug level.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::FromRawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, warn};

/// Wall-clock budget for a whole transfer, connect included.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Responses are discarded; keep only enough to log the status line.
const RESPONSE_KEEP: usize = 16 * 1024;

/// Split a URL into (host, port, path).
///
/// Only the `http` and `https` schemes are accepted. TLS is not terminated
/// in-process, so `https` targets are only reachable through a fronting
/// proxy set with [`TransferQueue::with_proxy`].
pub fn parse_url(url: &str) -> Result<(String, u16, String)> {
    let (rest, default_port) = if let Some(rest) = url.strip_prefix("http://") {
        (rest, 80)
    } else if let Some(rest) = url.strip_prefix("https://") {
        (rest, 443)
    } else {
        bail!("unsupported URL scheme in {url:?}");
    };

    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    if host_port.is_empty() {
        bail!("missing host in {url:?}");
    }

    let (host, port) = match host_port.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().context("bad port")?),
        None => (host_port.to_string(), default_port),
    };
    Ok((host, port, path))
}

/// Render a `POST` request with `Connection: close` so end-of-body is
/// end-of-stream.
fn render_request(host: &str, path: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut req = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        path,
        host,
        content_type,
        body.len()
    )
    .into_bytes();
    req.extend_from_slice(body);
    req
}

/// Open a socket and start a non-blocking connect.
///
/// Returns with the connect still in progress (`EINPROGRESS`); completion is
/// observed later through `peer_addr`/`take_error` on the wrapped stream.
fn start_connect(addr: &SocketAddr) -> std::io::Result<TcpStream> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    unsafe {
        let fd = libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let rc = match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from(*a.ip()).to_be(),
                    },
                    sin_zero: [0; 8],
                };
                libc::connect(
                    fd,
                    &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::connect(
                    fd,
                    &sin6 as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                libc::close(fd);
                return Err(err);
            }
        }
        Ok(TcpStream::from_raw_fd(fd))
    }
}

enum State {
    Connect { stream: Option<TcpStream> },
    Send { stream: TcpStream, sent: usize },
    Receive { stream: TcpStream, buf: Vec<u8> },
    Done,
    Failed,
}

/// One in-flight request.
pub struct Transfer {
    label: String,
    request: Vec<u8>,
    addrs: VecDeque<SocketAddr>,
    state: State,
    deadline: Instant,
}

impl Transfer {
    fn finished(&self) -> bool {
        matches!(self.state, State::Done | State::Failed)
    }

    /// Advance as far as the sockets allow without blocking.
    fn step(&mut self) {
        loop {
            if !self.finished() && Instant::now() >= self.deadline {
                debug!("{}: timed out", self.label);
                self.state = State::Failed;
            }
            let state = std::mem::replace(&mut self.state, State::Failed);
            let (next, progressed) = self.advance(state);
            self.state = next;
            if !progressed {
                return;
            }
        }
    }

    fn advance(&mut self, state: State) -> (State, bool) {
        match state {
            State::Connect { stream: None } => match self.addrs.pop_front() {
                Some(addr) => match start_connect(&addr) {
                    Ok(stream) => (State::Connect { stream: Some(stream) }, true),
                    Err(e) => {
                        debug!("{}: connect to {} failed: {}", self.label, addr, e);
                        (State::Connect { stream: None }, !self.addrs.is_empty())
                    }
                },
                None => {
                    debug!("{}: no reachable address", self.label);
                    (State::Failed, false)
                }
            },
            State::Connect { stream: Some(stream) } => {
                // getpeername succeeds once the handshake is done; until
                // then SO_ERROR tells an in-progress connect from a dead
                // one.
                match stream.peer_addr() {
                    Ok(_) => (State::Send { stream, sent: 0 }, true),
                    Err(ref e)
                        if e.kind() == ErrorKind::NotConnected
                            || e.kind() == ErrorKind::WouldBlock =>
                    {
                        match stream.take_error() {
                            Ok(Some(e)) => {
                                debug!("{}: connect failed: {}", self.label, e);
                                (State::Connect { stream: None }, !self.addrs.is_empty())
                            }
                            _ => (State::Connect { stream: Some(stream) }, false),
                        }
                    }
                    Err(e) => {
                        debug!("{}: connect failed: {}", self.label, e);
                        (State::Connect { stream: None }, !self.addrs.is_empty())
                    }
                }
            }
            State::Send { mut stream, mut sent } => loop {
                match stream.write(&self.request[sent..]) {
                    Ok(n) => {
                        sent += n;
                        if sent == self.request.len() {
                            break (
                                State::Receive {
                                    stream,
                                    buf: Vec::new(),
                                },
                                true,
                            );
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        break (State::Send { stream, sent }, false)
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("{}: send failed: {}", self.label, e);
                        break (State::Failed, false);
                    }
                }
            },
            State::Receive { mut stream, mut buf } => loop {
                let mut chunk = [0u8; 2048];
                match stream.read(&mut chunk) {
                    Ok(0) => {
                        debug!("{}: {}", self.label, status_line(&buf));
                        break (State::Done, false);
                    }
                    Ok(n) => {
                        if buf.len() < RESPONSE_KEEP {
                            buf.extend_from_slice(&chunk[..n]);
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        break (State::Receive { stream, buf }, false)
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("{}: receive failed: {}", self.label, e);
                        break (State::Failed, false);
                    }
                }
            },
            done @ (State::Done | State::Failed) => (done, false),
        }
    }
}

fn status_line(response: &[u8]) -> &str {
    let end = response
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(response.len());
    std::str::from_utf8(&response[..end]).unwrap_or("<non-utf8 response>")
}

/// Pending-transfer pool pumped from the frame tick.
///
/// Submissions may come from any thread; `perform` is expected on one
/// thread but nothing breaks if it is not.
pub struct TransferQueue {
    proxy: Option<String>,
    pending: Mutex<Vec<Transfer>>,
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferQueue {
    pub fn new() -> Self {
        Self {
            proxy: None,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Route every transfer to `addr` (a `host:port` pair) instead of the
    /// URL's own host. The `Host` header still names the URL's host.
    pub fn with_proxy(addr: impl Into<String>) -> Self {
        Self {
            proxy: Some(addr.into()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue a `POST` of `body` to `url`. Resolution happens here; the
    /// connect and everything after is driven by [`perform`](Self::perform).
    pub fn submit(&self, url: &str, content_type: &str, body: Vec<u8>) -> Result<()> {
        let (host, port, path) = parse_url(url)?;
        let target = match &self.proxy {
            Some(p) => p.clone(),
            None => format!("{host}:{port}"),
        };
        let addrs: VecDeque<SocketAddr> = target
            .to_socket_addrs()
            .with_context(|| format!("resolving {target}"))?
            .collect();
        if addrs.is_empty() {
            bail!("{target} resolved to no addresses");
        }

        let label = format!("POST {host}{path}");
        debug!("queued {label} ({} byte body)", body.len());
        let transfer = Transfer {
            label,
            request: render_request(&host, &path, content_type, &body),
            addrs,
            state: State::Connect { stream: None },
            deadline: Instant::now() + TRANSFER_TIMEOUT,
        };
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(transfer);
        Ok(())
    }

    /// Advance every pending transfer without blocking and retire the
    /// finished ones.
    pub fn perform(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for transfer in pending.iter_mut() {
            transfer.step();
        }
        pending.retain(|t| !t.finished());
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if !pending.is_empty() {
            warn!("dropping transfer queue with {} pending transfers", pending.len());
        }
    }
}
