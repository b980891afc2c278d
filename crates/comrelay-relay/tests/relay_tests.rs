//! Relay Core Tests (comrelay-relay)
//!
//! End-to-end through real sockets and the in-memory MIDI driver:
//! 1. OSC and MIDI input becomes text commands on every stream target
//! 2. Unrecognized input produces nothing
//! 3. UDP payloads are forwarded and the reply goes back to the sender

use comrelay_bridge::{MidiMessage, ScriptedMidiDriver};
use comrelay_relay::{
    DatagramEntry, MidiEntry, OscEntry, Relay, RelayConfig, StreamEntry, StreamSettings,
};
use comrelay_test_utils::{find_available_udp_port, recv_text, wait_for, TcpPeer};
use rosc::{encoder, OscMessage, OscPacket, OscType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

const WAIT: Duration = Duration::from_secs(3);

fn stream(id: &str, peer: &TcpPeer) -> StreamEntry {
    StreamEntry {
        id: id.to_string(),
        host: "127.0.0.1".to_string(),
        port: peer.port(),
    }
}

/// Streams only; no datagram, OSC or MIDI clients
fn base_config(streams: Vec<StreamEntry>) -> RelayConfig {
    RelayConfig {
        stream: StreamSettings {
            reconnect_interval_ms: 100,
            startup_grace_ms: 1000,
            greeting: String::new(),
            keepalive_secs: 0,
        },
        streams,
        datagram: vec![],
        osc: vec![],
        midi: vec![],
        ..RelayConfig::default()
    }
}

fn scripted_relay(config: RelayConfig, driver: &ScriptedMidiDriver) -> Relay {
    Relay::with_midi_driver(config, Arc::new(driver.clone()))
}

async fn send_osc(socket: &UdpSocket, to: SocketAddr, addr: &str, args: Vec<OscType>) {
    let packet = encoder::encode(&OscPacket::Message(OscMessage {
        addr: addr.to_string(),
        args,
    }))
    .unwrap();
    socket.send_to(&packet, to).await.unwrap();
}

async fn broadcasts_reach(relay: &Relay, n: u64) -> bool {
    wait_for(
        || async { relay.stats().broadcasts == n },
        Duration::from_millis(10),
        WAIT,
    )
    .await
}

fn floats(values: &[f32]) -> Vec<OscType> {
    values.iter().map(|v| OscType::Float(*v)).collect()
}

/// Counts every event at any level
struct EventCounter(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> Layer<S> for EventCounter {
    fn on_event(&self, _event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Run `f` with a thread-local subscriber and return how many events it logged
fn count_events(f: impl FnOnce()) -> usize {
    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(EventCounter(count.clone()));
    tracing::subscriber::with_default(subscriber, f);
    count.load(Ordering::SeqCst)
}

// ============================================================================
// OSC Translation
// ============================================================================

#[tokio::test]
async fn test_osc_pose_reaches_every_stream() {
    let first = TcpPeer::start().await;
    let second = TcpPeer::start().await;

    let mut config = base_config(vec![stream("Filemona", &first), stream("Mortadela", &second)]);
    config.osc = vec![OscEntry {
        id: "OSC_GH".to_string(),
        host: "127.0.0.1".to_string(),
        port: find_available_udp_port(),
        listen_port: Some(0),
    }];

    let relay = scripted_relay(config, &ScriptedMidiDriver::default());
    relay.start().await.unwrap();

    let listen = relay.osc().get("OSC_GH").unwrap().listen_addr().unwrap();
    let target: SocketAddr = ([127, 0, 0, 1], listen.port()).into();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    send_osc(
        &sender,
        target,
        "/pose",
        floats(&[1.0, 2.0, 3.0, 0.1, 0.2, 0.3, 0.9]),
    )
    .await;

    let expected = "pose/[[1,2,3],[0.9,0.1,0.2,0.3]];";
    assert!(first.wait_for_text(expected, WAIT).await, "got {:?}", first.received());
    assert!(second.wait_for_text(expected, WAIT).await, "got {:?}", second.received());
    assert!(broadcasts_reach(&relay, 1).await);

    relay.shutdown();
}

#[tokio::test]
async fn test_osc_joints_and_fixed_commands() {
    let peer = TcpPeer::start().await;
    let relay = scripted_relay(
        base_config(vec![stream("Filemona", &peer)]),
        &ScriptedMidiDriver::default(),
    );
    relay.start().await.unwrap();

    let joints: Vec<OscType> = (1..=7).map(|v| OscType::Int(v * 10)).collect();
    let report = relay.on_osc_message("/joints", &joints).unwrap();
    assert_eq!(report.delivered(), vec!["Filemona"]);
    assert!(
        peer.wait_for_text("joints/[10,20,30,40,50,60,[0,0,0,0,0,0]];", WAIT)
            .await
    );

    relay.on_osc_message("/home", &[]).unwrap();
    assert!(peer.wait_for_text("GoHome/;", WAIT).await);

    relay.on_osc_message("/PosA", &[]).unwrap();
    assert!(peer.wait_for_text("do_draw_circle/;", WAIT).await);

    relay.shutdown();
}

#[tokio::test]
async fn test_osc_unrecognized_produces_nothing() {
    let peer = TcpPeer::start().await;
    let relay = scripted_relay(
        base_config(vec![stream("Filemona", &peer)]),
        &ScriptedMidiDriver::default(),
    );
    relay.start().await.unwrap();

    assert!(relay.on_osc_message("/unknown", &[OscType::Int(1)]).is_none());
    // Too few pose arguments
    assert!(relay.on_osc_message("/pose", &floats(&[1.0, 2.0])).is_none());

    let stats = relay.stats();
    assert_eq!(stats.unrecognized, 2);
    assert_eq!(stats.broadcasts, 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(peer.received().is_empty());
    relay.shutdown();
}

#[tokio::test]
async fn test_broadcast_continues_past_disconnected_stream() {
    let live = TcpPeer::start().await;
    let dead_port = comrelay_test_utils::find_available_port().await;
    let dead = StreamEntry {
        id: "Offline".to_string(),
        host: "127.0.0.1".to_string(),
        port: dead_port,
    };

    let mut config = base_config(vec![dead, stream("Filemona", &live)]);
    config.stream.startup_grace_ms = 200;
    let relay = scripted_relay(config, &ScriptedMidiDriver::default());
    relay.start().await.unwrap();
    assert!(live.wait_for_accepts(1, WAIT).await);

    let report = relay.on_osc_message("/home", &[]).unwrap();
    assert_eq!(report.delivered(), vec!["Filemona"]);
    assert_eq!(report.failed(), vec!["Offline"]);
    assert!(live.wait_for_text("GoHome/;", WAIT).await);

    relay.shutdown();
}

// ============================================================================
// MIDI Translation
// ============================================================================

#[tokio::test]
async fn test_midi_faders_deduplicated() {
    let peer = TcpPeer::start().await;
    let driver = ScriptedMidiDriver::with_devices(&["nanoKONTROL2"]);

    let mut config = base_config(vec![stream("Filemona", &peer)]);
    config.midi = vec![MidiEntry {
        id: "RelayMIDI".to_string(),
        device: None,
    }];
    let relay = scripted_relay(config, &driver);
    relay.start().await.unwrap();
    assert!(driver.is_open(0));

    for value in [64, 64, 65] {
        driver.inject_cc(0, 1, 0, value);
    }
    driver.inject_cc(0, 1, 2, 127);

    assert!(peer.wait_for_text("slider3/127;", WAIT).await, "got {:?}", peer.received());
    let text = peer.received_text();
    assert_eq!(text.matches("slider1/64;").count(), 1);
    assert_eq!(text.matches("slider1/65;").count(), 1);
    assert!(broadcasts_reach(&relay, 3).await);

    relay.shutdown();
    assert!(!driver.is_open(0));
}

#[tokio::test]
async fn test_midi_unmapped_controller_ignored() {
    let peer = TcpPeer::start().await;
    let relay = scripted_relay(
        base_config(vec![stream("Filemona", &peer)]),
        &ScriptedMidiDriver::default(),
    );
    relay.start().await.unwrap();

    let unmapped = MidiMessage::ControlChange {
        channel: 1,
        controller: 42,
        value: 10,
    };
    assert!(relay.on_midi_event(&unmapped).is_none());
    assert_eq!(relay.stats().unrecognized, 1);
    relay.shutdown();
}

#[test]
fn test_unrecognized_input_logs_once() {
    let relay = scripted_relay(base_config(vec![]), &ScriptedMidiDriver::default());

    let osc = count_events(|| {
        assert!(relay.on_osc_message("/unknown", &[OscType::Int(1)]).is_none());
    });
    assert_eq!(osc, 1);

    let midi = count_events(|| {
        let unmapped = MidiMessage::ControlChange {
            channel: 1,
            controller: 42,
            value: 10,
        };
        assert!(relay.on_midi_event(&unmapped).is_none());
    });
    assert_eq!(midi, 1);
    assert_eq!(relay.stats().unrecognized, 2);
}

#[tokio::test]
async fn test_missing_midi_device_is_not_fatal() {
    let peer = TcpPeer::start().await;
    let mut config = base_config(vec![stream("Filemona", &peer)]);
    config.midi = vec![MidiEntry {
        id: "RelayMIDI".to_string(),
        device: None,
    }];

    let relay = scripted_relay(config, &ScriptedMidiDriver::with_devices(&[]));
    relay.start().await.unwrap();

    assert!(relay.midi().is_empty());
    assert_eq!(relay.streams().len(), 1);
    relay.shutdown();
}

// ============================================================================
// Datagram Forwarding
// ============================================================================

fn datagram_entry() -> DatagramEntry {
    DatagramEntry {
        id: "RelayUDP".to_string(),
        host: "127.0.0.1".to_string(),
        port: find_available_udp_port(),
        listen_port: 0,
    }
}

#[tokio::test]
async fn test_datagram_forwarded_and_reply_returned() {
    let peer = TcpPeer::echo().await;
    let mut config = base_config(vec![stream("RelayTCP", &peer)]);
    config.datagram = vec![datagram_entry()];

    let relay = scripted_relay(config, &ScriptedMidiDriver::default());
    relay.start().await.unwrap();

    let local = relay.datagrams().get("RelayUDP").unwrap().local_addr().unwrap();
    let listen: SocketAddr = ([127, 0, 0, 1], local.port()).into();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(b"get_pose", listen).await.unwrap();

    assert!(peer.wait_for_text("get_pose", WAIT).await);
    let (reply, from) = recv_text(&sender, WAIT)
        .await
        .expect("reply should come back to the sender");
    assert_eq!(reply, "get_pose");
    assert_eq!(from.port(), local.port());

    assert!(
        wait_for(
            || async { relay.stats().replies == 1 },
            Duration::from_millis(10),
            WAIT
        )
        .await
    );
    assert_eq!(relay.stats().forwarded, 1);
    relay.shutdown();
}

#[tokio::test]
async fn test_datagram_without_target_gets_no_reply() {
    let peer = TcpPeer::echo().await;
    let mut config = base_config(vec![stream("Filemona", &peer)]);
    config.datagram = vec![datagram_entry()];

    let relay = scripted_relay(config, &ScriptedMidiDriver::default());
    relay.start().await.unwrap();

    let local = relay.datagrams().get("RelayUDP").unwrap().local_addr().unwrap();
    let listen: SocketAddr = ([127, 0, 0, 1], local.port()).into();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(b"get_pose", listen).await.unwrap();

    assert!(recv_text(&sender, Duration::from_millis(300)).await.is_none());
    assert_eq!(relay.stats().forwarded, 0);
    assert!(peer.received().is_empty());
    relay.shutdown();
}

#[tokio::test]
async fn test_datagram_silent_target_times_out() {
    let peer = TcpPeer::start().await;
    let mut config = base_config(vec![stream("RelayTCP", &peer)]);
    config.datagram = vec![datagram_entry()];
    config.reply_timeout_ms = 100;

    let relay = scripted_relay(config, &ScriptedMidiDriver::default());
    relay.start().await.unwrap();

    let local = relay.datagrams().get("RelayUDP").unwrap().local_addr().unwrap();
    let listen: SocketAddr = ([127, 0, 0, 1], local.port()).into();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(b"ping", listen).await.unwrap();

    assert!(peer.wait_for_text("ping", WAIT).await);
    assert!(recv_text(&sender, Duration::from_millis(400)).await.is_none());
    assert_eq!(relay.stats().replies, 0);
    relay.shutdown();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_shutdown_empties_every_manager() {
    let peer = TcpPeer::start().await;
    let driver = ScriptedMidiDriver::with_devices(&["pad"]);

    let mut config = base_config(vec![stream("Filemona", &peer)]);
    config.datagram = vec![datagram_entry()];
    config.osc = vec![OscEntry {
        id: "OSC_GH".to_string(),
        host: "127.0.0.1".to_string(),
        port: find_available_udp_port(),
        listen_port: None,
    }];
    config.midi = vec![MidiEntry {
        id: "RelayMIDI".to_string(),
        device: Some(0),
    }];

    let relay = scripted_relay(config, &driver);
    relay.start().await.unwrap();
    assert_eq!(relay.streams().len(), 1);
    assert_eq!(relay.datagrams().len(), 1);
    assert_eq!(relay.osc().len(), 1);
    assert_eq!(relay.midi().len(), 1);

    relay.shutdown();
    assert!(relay.streams().is_empty());
    assert!(relay.datagrams().is_empty());
    assert!(relay.osc().is_empty());
    assert!(relay.midi().is_empty());
    assert!(!driver.is_open(0));
}

#[tokio::test]
async fn test_failed_start_stops_added_clients() {
    let peer = TcpPeer::start().await;
    // Holds the OSC listen port so the relay cannot bind it
    let occupied = UdpSocket::bind("0.0.0.0:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let mut config = base_config(vec![stream("Filemona", &peer)]);
    config.datagram = vec![datagram_entry()];
    config.osc = vec![OscEntry {
        id: "OSC_GH".to_string(),
        host: "127.0.0.1".to_string(),
        port: find_available_udp_port(),
        listen_port: Some(port),
    }];

    let relay = scripted_relay(config, &ScriptedMidiDriver::default());
    assert!(relay.start().await.is_err());

    assert!(relay.streams().is_empty());
    assert!(relay.datagrams().is_empty());
    assert!(relay.osc().is_empty());

    // Nothing reconnects to the stream peer after it drops its connections
    tokio::time::sleep(Duration::from_millis(100)).await;
    let before = peer.accepts();
    peer.disconnect_all();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(peer.accepts(), before);
}
