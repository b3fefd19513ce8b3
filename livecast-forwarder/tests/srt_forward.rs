//! End-to-end SRT forwarding against an in-process listener.

use bytes::Bytes;
use futures::StreamExt;
use livecast_core::desc::{Format, Media, MediaType, Session};
use livecast_core::rtppack::H264RtpPacketizer;
use livecast_core::stream::{Stream, StreamParams};
use livecast_core::unit::Unit;
use livecast_forwarder::SrtForwarder;
use livecast_core::conf::SrtForwardTarget;
use srt_tokio::SrtSocket;
use std::time::{Duration, Instant, SystemTime};

fn video_desc() -> Session {
    Session {
        medias: vec![Media {
            media_type: MediaType::Video,
            formats: vec![Format::H264 {
                payload_type: 96,
                sps: vec![0x67, 0x42, 0xc0, 0x28],
                pps: vec![0x68, 0x06],
                packetization_mode: 1,
            }],
        }],
    }
}

#[tokio::test]
async fn test_srt_forward_end_to_end() {
    let port = 18890u16;
    let listener = tokio::spawn(async move {
        let mut socket = SrtSocket::builder()
            .listen_on(format!("127.0.0.1:{port}").as_str())
            .await
            .expect("listen failed");
        let mut received = Vec::new();
        while let Some(Ok((_, data))) = socket.next().await {
            received.push(data);
            if received.len() >= 3 {
                break;
            }
        }
        received
    });

    // give the listener a moment to bind
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stream = Stream::new(StreamParams {
        desc: video_desc(),
        write_queue_size: 64,
    });
    let forwarder = SrtForwarder::new(
        format!("srt://127.0.0.1:{port}?streamid=publish:live/s"),
        SrtForwardTarget {
            url: format!("srt://127.0.0.1:{port}"),
            ..Default::default()
        },
        Duration::from_secs(2),
        1472,
        64,
    );
    forwarder.start(stream.clone()).unwrap();

    // wait for the connection, then publish access units
    let deadline = Instant::now() + Duration::from_secs(5);
    while !forwarder.stats().connected && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(forwarder.stats().connected, "forwarder never connected");

    let mut packetizer = H264RtpPacketizer::new(96, 0x1234, 1200);
    let mut written = 0u64;
    for i in 0..10u32 {
        let au = Bytes::from(vec![0, 0, 0, 1, 0x65, i as u8, 1, 2, 3]);
        let packets = packetizer.packetize(&au, i * 3600).unwrap();
        written += packets.len() as u64;
        stream.write_unit(0, 0, Unit::new(packets, SystemTime::now(), i64::from(i) * 3600));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while forwarder.stats().packets_sent < written && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let stats = forwarder.stats();
    assert_eq!(stats.packets_sent, written);
    assert_eq!(stats.packets_lost, 0);
    assert!(stats.connected);
    assert!(stats.bytes_sent > 0);

    // Stop must return promptly and leave the reader set unchanged
    let stop_start = Instant::now();
    forwarder.stop().await;
    assert!(stop_start.elapsed() < Duration::from_millis(500));
    assert_eq!(stream.reader_count(), 0);
    assert!(!forwarder.is_running());

    let received = listener.await.unwrap();
    assert!(!received.is_empty(), "listener saw no data");
    for chunk in &received {
        assert_eq!(chunk[0], 0x47, "chunks must start on a TS packet boundary");
        assert_eq!(chunk.len() % 188, 0);
    }
}

#[tokio::test]
async fn test_start_stop_cycle_leaves_no_reader() {
    let stream = Stream::new(StreamParams {
        desc: video_desc(),
        write_queue_size: 8,
    });
    // nothing listens on this port; dial fails, reconnect disabled
    let forwarder = SrtForwarder::new(
        "srt://127.0.0.1:1?streamid=x".into(),
        SrtForwardTarget::default(),
        Duration::from_millis(200),
        1472,
        8,
    );

    for _ in 0..2 {
        forwarder.start(stream.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        forwarder.stop().await;
        assert_eq!(stream.reader_count(), 0);
    }
}
