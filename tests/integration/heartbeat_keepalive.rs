//! S4: heartbeat keepalive observed at the relay boundary.
//!
//! One side runs a heartbeat-framed duplex with a shortened interval and
//! stays idle; the raw records must be visible on the relay, and the stream
//! must remain usable afterward.

use std::time::Duration;

use futures_util::StreamExt;
use pt_relay::{RelayClient, Url};
use pt_stream::{HeartbeatDuplex, PipingDuplex};
use pt_test_utils::MockRelay;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const HEARTBEAT_TAG: u8 = 0x02;
const DATA_TAG: u8 = 0x01;

#[tokio::test]
async fn idle_stream_emits_heartbeats_and_stays_usable() {
    let relay = MockRelay::start().await.expect("relay");
    let client = RelayClient::builder().build().expect("relay client");

    let cs_url = Url::parse(&relay.url("hb/cs")).expect("url");
    let sc_url = Url::parse(&relay.url("hb/sc")).expect("url");
    let duplex = PipingDuplex::connect(&client, &[], cs_url, sc_url);
    let mut framed = HeartbeatDuplex::with_interval(duplex, Duration::from_millis(100));

    // Observe the raw uplink while the framed side stays idle.
    let http = reqwest::Client::new();
    let observed = http
        .get(relay.url("hb/cs"))
        .send()
        .await
        .expect("get uplink");
    let mut body = observed.bytes_stream();

    let mut wire = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while wire.len() < 4 {
        let chunk = tokio::time::timeout_at(deadline, body.next())
            .await
            .expect("heartbeats within deadline")
            .expect("uplink open")
            .expect("chunk");
        wire.extend_from_slice(&chunk);
    }
    // At least two 0x02 ∥ pad records, nothing else, while idle.
    assert_eq!(wire[0], HEARTBEAT_TAG);
    assert_eq!(wire[2], HEARTBEAT_TAG);

    // The downlink keeps flowing too: feed a hand-crafted DATA frame and a
    // stray heartbeat; only the payload must surface.
    tokio::spawn({
        let http = http.clone();
        let url = relay.url("hb/sc");
        async move {
            let mut frame = vec![HEARTBEAT_TAG, 0x77];
            frame.extend_from_slice(&[DATA_TAG, 0, 0, 0, 5]);
            frame.extend_from_slice(b"hello");
            let _ = http.post(url).body(frame).send().await;
        }
    });
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(5), framed.read_exact(&mut buf))
        .await
        .expect("read within timeout")
        .expect("read");
    assert_eq!(&buf, b"hello");

    // And the uplink still carries data frames after the idle period.
    framed.write_all(b"after idle").await.expect("write");
    let mut rest = Vec::new();
    while !frame_with_payload(&rest, b"after idle") {
        let chunk = timeout(Duration::from_secs(5), body.next())
            .await
            .expect("data frame within timeout")
            .expect("uplink open")
            .expect("chunk");
        rest.extend_from_slice(&chunk);
    }
}

/// Scan a record stream (heartbeats interleaved with DATA frames) for a
/// frame carrying `payload`.
fn frame_with_payload(mut wire: &[u8], payload: &[u8]) -> bool {
    loop {
        match wire {
            [] => return false,
            [HEARTBEAT_TAG, _, rest @ ..] => wire = rest,
            [DATA_TAG, a, b, c, d, rest @ ..] => {
                let len = u32::from_be_bytes([*a, *b, *c, *d]) as usize;
                if rest.len() < len {
                    return false;
                }
                if &rest[..len] == payload {
                    return true;
                }
                wire = &rest[len..];
            }
            _ => return false,
        }
    }
}
