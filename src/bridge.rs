//! UDP radio-bridge transport.
//!
//! The radio dongle itself sits behind an external gateway process. Every
//! outbound frame becomes one datagram `[channel, agent_id, frame...]`; the
//! gateway sends telemetry back as
//! `[channel, agent_id, TELEMETRY_TAG, x, y, z, heading]` with f32 LE values.
//!
//! The socket stays in blocking mode: sends come from synchronous
//! `Transport::send` calls and must not fail just because nobody polled the
//! socket yet. Telemetry is read on a dedicated thread.

use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;

use crate::error::TransportError;
use crate::session::{Mirror, Telemetry};
use crate::transport::{LinkUri, Transport, TransportProvider};

pub const TELEMETRY_TAG: u8 = 0x01;
const TELEMETRY_LEN: usize = 3 + 4 * 4;
const MAX_DATAGRAM: usize = 512;
/// How long the reader blocks before re-checking for shutdown.
const READ_POLL: Duration = Duration::from_millis(100);

type MirrorMap = Arc<Mutex<HashMap<u8, Arc<Mirror>>>>;

pub struct BridgeProvider {
    socket: Arc<UdpSocket>,
    gateway: SocketAddr,
    mirrors: MirrorMap,
    running: Arc<AtomicBool>,
}

impl BridgeProvider {
    /// Bind an ephemeral local socket and start reading telemetry from
    /// `gateway`.
    pub fn bind(gateway: SocketAddr) -> std::io::Result<Self> {
        let local_ip = match gateway.ip() {
            IpAddr::V4(ip) if ip.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(ip) if ip.is_loopback() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))?;
        socket.set_read_timeout(Some(READ_POLL))?;
        let socket = Arc::new(socket);
        let mirrors: MirrorMap = Arc::default();
        let running = Arc::new(AtomicBool::new(true));

        let reader_socket = socket.clone();
        let reader_mirrors = mirrors.clone();
        let reader_running = running.clone();
        thread::Builder::new()
            .name("bridge-telemetry".into())
            .spawn(move || read_telemetry(&reader_socket, &reader_mirrors, &reader_running))?;
        tracing::info!(
            target = "northstar::bridge",
            gateway = %gateway,
            local = %socket.local_addr()?,
            "radio bridge ready"
        );

        Ok(Self {
            socket,
            gateway,
            mirrors,
            running,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Drop for BridgeProvider {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn read_telemetry(socket: &UdpSocket, mirrors: &MirrorMap, running: &AtomicBool) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, _from)) => apply_datagram(mirrors, &buf[..len]),
            Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(error) => {
                tracing::warn!(target = "northstar::bridge", error = %error, "bridge receive failed");
                thread::sleep(READ_POLL);
            }
        }
    }
    tracing::debug!(target = "northstar::bridge", "telemetry reader stopped");
}

fn apply_datagram(mirrors: &MirrorMap, datagram: &[u8]) {
    let Some(telemetry) = parse_telemetry(datagram) else {
        tracing::debug!(target = "northstar::bridge", len = datagram.len(), "ignoring datagram");
        return;
    };
    let agent = datagram[1];
    let mirror = mirrors.lock().get(&agent).cloned();
    match mirror {
        Some(mirror) => mirror.report(telemetry),
        None => tracing::debug!(target = "northstar::bridge", agent_id = agent, "telemetry for unlinked agent"),
    }
}

/// Decode a telemetry datagram. The agent reported it, so it is connected.
pub fn parse_telemetry(datagram: &[u8]) -> Option<Telemetry> {
    if datagram.len() < TELEMETRY_LEN || datagram[2] != TELEMETRY_TAG {
        return None;
    }
    let f = |i: usize| {
        let at = 3 + 4 * i;
        f32::from_le_bytes([datagram[at], datagram[at + 1], datagram[at + 2], datagram[at + 3]]) as f64
    };
    Some(Telemetry {
        position: [f(0), f(1), f(2)],
        heading: f(3),
        connected: true,
    })
}

impl TransportProvider for BridgeProvider {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn open(&self, uri: &LinkUri, mirror: Arc<Mirror>) -> Result<Arc<dyn Transport>, TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::LinkDown);
        }
        let agent = u8::try_from(uri.rf_channel).map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("agent id {} does not fit a bridge datagram", uri.rf_channel),
            ))
        })?;
        let channel = u8::try_from(uri.radio).map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("channel index {} does not fit a bridge datagram", uri.radio),
            ))
        })?;

        self.mirrors.lock().insert(agent, mirror.clone());
        tracing::debug!(target = "northstar::bridge", uri = %uri, "bridge link opened");
        Ok(Arc::new(BridgeLink {
            socket: self.socket.clone(),
            gateway: self.gateway,
            header: [channel, agent],
            mirror,
            mirrors: self.mirrors.clone(),
            running: self.running.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.mirrors.lock().clear();
    }
}

struct BridgeLink {
    socket: Arc<UdpSocket>,
    gateway: SocketAddr,
    header: [u8; 2],
    mirror: Arc<Mirror>,
    mirrors: MirrorMap,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl Transport for BridgeLink {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::LinkDown);
        }
        let mut datagram = Vec::with_capacity(2 + frame.len());
        datagram.extend_from_slice(&self.header);
        datagram.extend_from_slice(frame);
        self.socket.send_to(&datagram, self.gateway)?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.running.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut mirrors = self.mirrors.lock();
        if mirrors
            .get(&self.header[1])
            .is_some_and(|m| Arc::ptr_eq(m, &self.mirror))
        {
            mirrors.remove(&self.header[1]);
        }
        self.mirror.update(|t| t.connected = false);
    }
}
