use std::any::Any;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use shared::error::{Error, Result};

use crate::config::{MediaConfig, MediaType};
use crate::event::SessionCallback;
use crate::node::{DataEntry, DataQueue, Node, NodeId, NodeState, SubType};
use crate::utils::now_ms;

/// Which flow a socket node belongs to; RTCP conventionally rides one port
/// above RTP at the peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolKind {
    Rtp,
    Rtcp,
}

pub const DEFAULT_MTU: usize = 1500;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

fn dup_socket(fd: RawFd) -> Result<UdpSocket> {
    // the session owns the descriptor; work on a duplicate so closing is
    // its call alone
    let owned = unsafe { BorrowedFd::borrow_raw(fd) }
        .try_clone_to_owned()
        .map_err(|e| {
            log::error!("cannot duplicate socket fd [{fd}]: {e}");
            Error::ErrPortUnavailable
        })?;
    Ok(UdpSocket::from(owned))
}

fn peer_address(config: &MediaConfig, protocol: ProtocolKind) -> Result<SocketAddr> {
    let rtp = config.rtp();
    let port = match protocol {
        ProtocolKind::Rtp => rtp.remote_port,
        ProtocolKind::Rtcp => rtp.remote_port + 1,
    };
    format!("{}:{}", rtp.remote_address, port)
        .parse()
        .map_err(|_| Error::ErrInvalidParam)
}

/// Receives datagrams on a supplied descriptor from its own thread and
/// feeds them into the graph through the input queue.
pub struct SocketReaderNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,
    media: MediaType,
    protocol: ProtocolKind,

    local_fd: RawFd,
    mtu: usize,
    stop_flag: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SocketReaderNode {
    pub fn new(
        media: MediaType,
        protocol: ProtocolKind,
        local_fd: RawFd,
        callback: SessionCallback,
    ) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            media,
            protocol,
            local_fd,
            mtu: DEFAULT_MTU,
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Node for SocketReaderNode {
    fn id(&self) -> NodeId {
        NodeId::SocketReader
    }

    fn media(&self) -> MediaType {
        self.media
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        let socket = dup_socket(self.local_fd)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        self.stop_flag.store(false, Ordering::Release);
        let stop = self.stop_flag.clone();
        let queue = self.queue.clone();
        let mtu = self.mtu;
        let worker = thread::spawn(move || {
            let mut buffer = vec![0u8; mtu];
            while !stop.load(Ordering::Acquire) {
                match socket.recv_from(&mut buffer) {
                    Ok((len, _peer)) if len > 0 => {
                        queue.push(DataEntry {
                            subtype: SubType::Undefined,
                            data: Bytes::copy_from_slice(&buffer[..len]),
                            arrival_time: now_ms(),
                            ..Default::default()
                        });
                    }
                    Ok(_) => {}
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        log::warn!("socket read error: {e}");
                        thread::sleep(READ_TIMEOUT);
                    }
                }
            }
        });
        self.worker = Some(worker);
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.queue.clear();
        self.state = NodeState::Stopped;
    }

    fn is_source(&self) -> bool {
        true
    }

    fn set_config(&mut self, config: &MediaConfig) {
        self.config = Some(config.clone());
        self.mtu = config.rtp().mtu.max(576) as usize;
    }

    fn is_same_config(&self, config: &MediaConfig) -> bool {
        match (&self.config, config) {
            (Some(mine), theirs) => {
                mine.rtp().remote_address == theirs.rtp().remote_address
                    && mine.rtp().remote_port == theirs.rtp().remote_port
                    && mine.rtp().mtu == theirs.rtp().mtu
            }
            (None, _) => false,
        }
    }

    fn queue(&self) -> &DataQueue {
        &self.queue
    }

    /// Drains everything the reader thread queued since the last tick.
    fn process(&mut self) -> Vec<DataEntry> {
        let mut out = vec![];
        while let Some(entry) = self.queue.pop() {
            out.push(entry);
        }
        out
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

/// Sends datagrams to the configured peer. Runs inline on whichever thread
/// routed the entry; owns the DSCP marking of its descriptor.
pub struct SocketWriterNode {
    state: NodeState,
    queue: DataQueue,
    callback: SessionCallback,
    config: Option<MediaConfig>,
    media: MediaType,
    protocol: ProtocolKind,

    local_fd: RawFd,
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    dscp: u8,
    /// When set, only an RTCP BYE may still leave.
    disabled: bool,
}

impl SocketWriterNode {
    pub fn new(
        media: MediaType,
        protocol: ProtocolKind,
        local_fd: RawFd,
        callback: SessionCallback,
    ) -> Self {
        Self {
            state: NodeState::Stopped,
            queue: DataQueue::new(),
            callback,
            config: None,
            media,
            protocol,
            local_fd,
            socket: None,
            peer: None,
            dscp: 0,
            disabled: false,
        }
    }

    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }
}

impl Node for SocketWriterNode {
    fn id(&self) -> NodeId {
        NodeId::SocketWriter
    }

    fn media(&self) -> MediaType {
        self.media
    }

    fn state(&self) -> NodeState {
        self.state
    }

    fn start(&mut self) -> Result<()> {
        let config = self.config.as_ref().ok_or(Error::ErrNotReady)?;
        let peer = peer_address(config, self.protocol)?;

        let socket = dup_socket(self.local_fd)?;
        let sock2 = socket2::Socket::from(socket);
        if self.dscp != 0 {
            if let Err(e) = sock2.set_tos(u32::from(self.dscp) << 2) {
                log::warn!("cannot set IP_TOS for dscp [{}]: {e}", self.dscp);
            }
        }
        self.socket = Some(sock2.into());
        self.peer = Some(peer);
        self.state = NodeState::Running;
        Ok(())
    }

    fn stop(&mut self) {
        self.socket = None;
        self.peer = None;
        self.state = NodeState::Stopped;
    }

    fn is_runtime(&self) -> bool {
        true
    }

    fn is_source(&self) -> bool {
        true
    }

    fn set_config(&mut self, config: &MediaConfig) {
        self.config = Some(config.clone());
        self.dscp = config.rtp().dscp;
    }

    fn is_same_config(&self, config: &MediaConfig) -> bool {
        match (&self.config, config) {
            (Some(mine), theirs) => {
                mine.rtp().remote_address == theirs.rtp().remote_address
                    && mine.rtp().remote_port == theirs.rtp().remote_port
                    && mine.rtp().dscp == theirs.rtp().dscp
            }
            (None, _) => false,
        }
    }

    fn queue(&self) -> &DataQueue {
        &self.queue
    }

    fn consume(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        if self.state != NodeState::Running {
            return vec![];
        }
        if self.disabled && entry.subtype != SubType::RtcpPacketBye {
            log::warn!(
                "socket disabled, dropping [{:?}] of [{}] bytes",
                entry.subtype,
                entry.data.len()
            );
            return vec![];
        }

        if let (Some(socket), Some(peer)) = (&self.socket, self.peer) {
            if let Err(e) = socket.send_to(&entry.data, peer) {
                log::warn!("socket send failed: {e}");
            }
        }
        vec![]
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static) {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioConfig;
    use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};

    fn config_to(port: u16) -> MediaConfig {
        let mut c = AudioConfig::default();
        c.rtp.remote_address = "127.0.0.1".to_string();
        c.rtp.remote_port = port;
        MediaConfig::Audio(c)
    }

    #[test]
    fn test_writer_sends_to_peer() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let peer_port = receiver.local_addr().unwrap().port();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sender.into_raw_fd();

        let (cb, _rx) = SessionCallback::new();
        let mut writer = SocketWriterNode::new(MediaType::Audio, ProtocolKind::Rtp, fd, cb);
        writer.set_config(&config_to(peer_port));
        writer.start().unwrap();

        writer.consume(DataEntry::new(
            SubType::RtpPacket,
            Bytes::from_static(b"hello"),
        ));

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");

        writer.stop();
        // we duplicated the fd, the original must be reclaimed
        let _ = UdpSocket::from(unsafe { OwnedFd::from_raw_fd(fd) });
    }

    #[test]
    fn test_disabled_writer_passes_only_bye() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let peer_port = receiver.local_addr().unwrap().port();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sender.into_raw_fd();

        let (cb, _rx) = SessionCallback::new();
        let mut writer = SocketWriterNode::new(MediaType::Audio, ProtocolKind::Rtcp, fd, cb);
        writer.set_config(&config_to(peer_port - 1));
        writer.start().unwrap();
        writer.set_disabled(true);

        writer.consume(DataEntry::new(
            SubType::RtcpPacket,
            Bytes::from_static(b"report"),
        ));
        writer.consume(DataEntry::new(
            SubType::RtcpPacketBye,
            Bytes::from_static(b"bye"),
        ));

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"bye");

        writer.stop();
        let _ = UdpSocket::from(unsafe { OwnedFd::from_raw_fd(fd) });
    }

    #[test]
    fn test_reader_queues_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let fd = receiver.into_raw_fd();

        let (cb, _rx) = SessionCallback::new();
        let mut reader = SocketReaderNode::new(MediaType::Audio, ProtocolKind::Rtp, fd, cb);
        reader.set_config(&config_to(9));
        reader.start().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"packet-1", ("127.0.0.1", port)).unwrap();
        sender.send_to(b"packet-2", ("127.0.0.1", port)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while reader.data_count() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(reader.data_count(), 2);

        let out = reader.process();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data, Bytes::from_static(b"packet-1"));

        reader.stop();
        let _ = UdpSocket::from(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}
