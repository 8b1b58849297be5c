//! RTCP receive path: inbound compound parsing feeding the analyzer and
//! the XR round-trip-delay computation.

use std::net::UdpSocket;
use std::os::fd::IntoRawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use ims_core::config::{AudioConfig, MediaConfig, MediaQualityThreshold, MediaType, RtcpConfig, xr_block};
use ims_core::device::MediaEndpoints;
use ims_core::event::SessionCallback;
use ims_core::graph::{GraphContext, StreamDirection, StreamGraph};
use ims_core::quality::MediaQualityAnalyzer;
use ims_core::stats::RtpSessionStats;
use rtcp::extended_report::ReportBlock;
use rtcp::packet::Packet as RtcpPacketTrait;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::SourceDescription;

fn rtcp_config(remote_rtp_port: u16) -> MediaConfig {
    let mut config = AudioConfig::default();
    config.rtp.remote_address = "127.0.0.1".to_string();
    config.rtp.remote_port = remote_rtp_port;
    config.rtp.rtcp = RtcpConfig {
        canonical_name: "rx@test".to_string(),
        interval_sec: 1,
        xr_blocks: xr_block::VOIP_METRICS,
        ..Default::default()
    };
    MediaConfig::Audio(config)
}

#[test]
fn test_inbound_sr_feeds_round_trip_delay() {
    // the engine's RTCP socket; the test peer talks to it directly
    let engine_rtcp = UdpSocket::bind("127.0.0.1:0").unwrap();
    let engine_port = engine_rtcp.local_addr().unwrap().port();
    let rtcp_fd = engine_rtcp.into_raw_fd();

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer_port = peer.local_addr().unwrap().port();
    peer.set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();

    let (callback, _events) = SessionCallback::new();
    let stats = Arc::new(RtpSessionStats::new(16000));
    let analyzer = Arc::new(Mutex::new(MediaQualityAnalyzer::new(callback.clone())));
    let mut endpoints = MediaEndpoints::default();

    let mut graph = StreamGraph::new(StreamDirection::Rtcp, MediaType::Audio, callback);
    let mut ctx = GraphContext {
        rtp_fd: rtcp_fd,
        rtcp_fd,
        stats: stats.clone(),
        analyzer: Some(analyzer.clone()),
        endpoints: &mut endpoints,
        // the peer port the writer computes is remote_rtp_port + 1
        threshold: MediaQualityThreshold::default(),
    };
    graph
        .create(&rtcp_config(peer_port.wrapping_sub(1)), &mut ctx)
        .unwrap();
    graph.start().unwrap();

    // make our stream known so the SR has somewhere to land
    stats.on_rx_packet(Instant::now(), 0x5050, 1, 0);

    // craft an SR whose report block points at our own SSRC with a
    // plausible LSR/DLSR so RTT = now_mid32 - LSR - DLSR is positive
    let now_mid = stats.clock.ntp_mid32(Instant::now());
    let lsr = now_mid.wrapping_sub(65536 / 4); // "we sent an SR 250 ms ago"
    let dlsr = 65536 / 8; // peer held it 125 ms
    let sr = SenderReport {
        ssrc: 0x5050,
        ntp_time: 0xda8bd1fc_dddda05a,
        rtp_time: 1000,
        packet_count: 1000,
        octet_count: 160000,
        reports: vec![ReceptionReport {
            ssrc: stats.local_ssrc(),
            last_sender_report: lsr,
            delay: dlsr,
            ..Default::default()
        }],
        profile_extensions: Bytes::new(),
    };
    let packets: Vec<Box<dyn RtcpPacketTrait + Send + Sync>> = vec![
        Box::new(sr),
        Box::new(SourceDescription::with_cname(0x5050, "a")),
    ];
    let compound = rtcp::packet::marshal(&packets).unwrap();
    peer.send_to(&compound, ("127.0.0.1", engine_port)).unwrap();

    // the reader thread and scheduler hand it to the decoder shortly
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut rtt = 0u32;
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
        let blocks = analyzer
            .lock()
            .unwrap()
            .get_rtcp_xr_report_blocks(xr_block::VOIP_METRICS);
        if let Some(blocks) = blocks {
            if let ReportBlock::VoipMetrics(metrics) = &blocks[0] {
                if metrics.round_trip_delay > 0 {
                    rtt = u32::from(metrics.round_trip_delay);
                    break;
                }
            }
        }
    }

    // ~125 ms of the 250 ms span remains after subtracting peer hold time
    assert!(
        (60..=400).contains(&rtt),
        "round trip delay {rtt} ms out of range"
    );
    assert_eq!(analyzer.lock().unwrap().remote_ssrc(), Some(0x5050));

    // and our own receiver reports flow back to the peer
    let mut buf = [0u8; 1500];
    let mut saw_report = false;
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if let Ok((len, _)) = peer.recv_from(&mut buf) {
            let mut b = Bytes::copy_from_slice(&buf[..len]);
            let compound = rtcp::packet::unmarshal(&mut b).unwrap();
            assert!(matches!(
                compound[0].header().packet_type,
                rtcp::header::PacketType::SenderReport
                    | rtcp::header::PacketType::ReceiverReport
            ));
            saw_report = true;
            break;
        }
    }
    assert!(saw_report, "periodic receiver report expected");

    graph.stop();
}
