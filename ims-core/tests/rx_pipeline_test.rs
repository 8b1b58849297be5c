//! Receive-path behavior at the graph level: reordering through the
//! jitter buffer and SSRC refresh handling.

use std::net::UdpSocket;
use std::os::fd::IntoRawFd;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use ims_core::config::{AudioCodec, AudioConfig, MediaConfig, MediaQualityThreshold, MediaType};
use ims_core::device::{AudioOutput, MediaEndpoints};
use ims_core::event::SessionCallback;
use ims_core::graph::{GraphContext, StreamDirection, StreamGraph};
use ims_core::node::NodeId;
use ims_core::node::audio_device::AudioPlayerNode;
use ims_core::quality::MediaQualityAnalyzer;
use ims_core::stats::RtpSessionStats;
use rtp::header::Header;
use rtp::packet::Packet;
use shared::marshal::Marshal;

struct CollectingOutput {
    tx: mpsc::Sender<Vec<u8>>,
}

impl AudioOutput for CollectingOutput {
    fn write_frame(&mut self, frame: &[u8]) {
        let _ = self.tx.send(frame.to_vec());
    }
}

fn rx_config(remote_port: u16) -> MediaConfig {
    let mut config = AudioConfig {
        codec: AudioCodec::Pcmu,
        sampling_rate_khz: 8,
        tx_payload_type: 0,
        rx_payload_type: 0,
        dtmf_payload_type: 100,
        ..Default::default()
    };
    config.rtp.remote_address = "127.0.0.1".to_string();
    config.rtp.remote_port = remote_port;
    MediaConfig::Audio(config)
}

fn rtp_datagram(ssrc: u32, seq: u16, timestamp: u32, byte: u8) -> Vec<u8> {
    let packet = Packet {
        header: Header {
            version: 2,
            payload_type: 0,
            sequence_number: seq,
            timestamp,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from(vec![byte; 16]),
        padding_size: 0,
    };
    packet.marshal().unwrap().to_vec()
}

struct RxHarness {
    graph: StreamGraph,
    sender: UdpSocket,
    engine_port: u16,
    played: mpsc::Receiver<Vec<u8>>,
    analyzer: Arc<Mutex<MediaQualityAnalyzer>>,
}

fn rx_harness() -> RxHarness {
    let engine_rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
    let engine_port = engine_rtp.local_addr().unwrap().port();
    let rtp_fd = engine_rtp.into_raw_fd();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let sender_port = sender.local_addr().unwrap().port();

    let (callback, _events) = SessionCallback::new();
    let stats = Arc::new(RtpSessionStats::new(8000));
    let analyzer = Arc::new(Mutex::new(MediaQualityAnalyzer::new(callback.clone())));
    let (tx, played) = mpsc::channel();

    let mut endpoints = MediaEndpoints {
        audio_output: Some(Box::new(CollectingOutput { tx })),
        ..Default::default()
    };

    let mut graph = StreamGraph::new(StreamDirection::RtpRx, MediaType::Audio, callback);
    let mut ctx = GraphContext {
        rtp_fd,
        rtcp_fd: rtp_fd,
        stats,
        analyzer: Some(analyzer.clone()),
        endpoints: &mut endpoints,
        threshold: MediaQualityThreshold::default(),
    };
    graph.create(&rx_config(sender_port), &mut ctx).unwrap();
    graph.start().unwrap();

    RxHarness {
        graph,
        sender,
        engine_port,
        played,
        analyzer,
    }
}

fn drain(played: &mpsc::Receiver<Vec<u8>>, window: Duration) -> Vec<Vec<u8>> {
    let deadline = Instant::now() + window;
    let mut out = vec![];
    while Instant::now() < deadline {
        if let Ok(frame) = played.recv_timeout(Duration::from_millis(50)) {
            out.push(frame);
        }
    }
    out
}

#[test]
fn test_reordered_arrival_plays_in_sequence() {
    let mut harness = rx_harness();
    let target = ("127.0.0.1", harness.engine_port);

    // arrival order 100, 101, 103, 102, 104 with equal 160-tick spacing
    for (seq, i) in [(100u16, 0u32), (101, 1), (103, 3), (102, 2), (104, 4)] {
        let dgram = rtp_datagram(0xbeef, seq, 1600 + i * 160, seq as u8);
        harness.sender.send_to(&dgram, target).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }

    let frames = drain(&harness.played, Duration::from_secs(2));
    let order: Vec<u8> = frames.iter().map(|f| f[0]).collect();
    assert_eq!(
        order,
        vec![100, 101, 102, 103, 104],
        "jitter buffer restores sequence order"
    );

    // the reorder was observed, nothing was declared lost
    {
        let core = harness.graph.core();
        let mut core = core.lock().unwrap();
        let (reordered, lost, duplicate) = core
            .with_node::<AudioPlayerNode, _>(NodeId::AudioPlayer, |player| {
                let jb = player.jitter_buffer();
                (jb.stats.reordered, jb.stats.lost, jb.stats.duplicate)
            })
            .unwrap();
        assert_eq!(reordered, 1);
        assert_eq!(lost, 0);
        assert_eq!(duplicate, 0);
    }

    harness.graph.stop();
}

#[test]
fn test_duplicate_never_plays_twice() {
    let mut harness = rx_harness();
    let target = ("127.0.0.1", harness.engine_port);

    for seq in 200u16..205 {
        let i = u32::from(seq - 200);
        let dgram = rtp_datagram(0xbeef, seq, 1600 + i * 160, seq as u8);
        harness.sender.send_to(&dgram, target).unwrap();
        if seq == 202 {
            // duplicate of 202 right behind the original
            harness.sender.send_to(&dgram, target).unwrap();
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let frames = drain(&harness.played, Duration::from_secs(2));
    let order: Vec<u8> = frames.iter().map(|f| f[0]).collect();
    assert_eq!(order, vec![200, 201, 202, 203, 204]);

    harness.graph.stop();
}

#[test]
fn test_ssrc_change_resets_playout() {
    let mut harness = rx_harness();
    let target = ("127.0.0.1", harness.engine_port);

    for seq in 10u16..16 {
        let i = u32::from(seq - 10);
        let dgram = rtp_datagram(0xaaaa, seq, i * 160, seq as u8);
        harness.sender.send_to(&dgram, target).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    let _ = drain(&harness.played, Duration::from_millis(500));

    // new SSRC restarting at a lower sequence must still play
    for seq in 1u16..7 {
        let i = u32::from(seq - 1);
        let dgram = rtp_datagram(0xbbbb, seq, 8000 + i * 160, 100 + seq as u8);
        harness.sender.send_to(&dgram, target).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    let frames = drain(&harness.played, Duration::from_secs(2));
    assert!(
        frames.iter().any(|f| f[0] >= 101),
        "frames of the refreshed stream played"
    );
    assert_eq!(
        harness.analyzer.lock().unwrap().remote_ssrc(),
        Some(0xbbbb)
    );

    harness.graph.stop();
}
