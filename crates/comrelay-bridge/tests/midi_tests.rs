//! MIDI Client Tests (comrelay-bridge)
//!
//! These tests drive the MIDI client through the in-memory driver and verify:
//! 1. Unchanged controller values are suppressed
//! 2. Events reach the callback in arrival order
//! 3. Stopping resets the cache and releases the device
//! 4. Start failures leave nothing registered

use comrelay_bridge::midi::{pack, MidiDevice, MidiDriver, MidiInputHandle, MidiSink};
use comrelay_bridge::{
    BridgeError, MidiCallback, MidiClient, MidiClientManager, MidiEvent, MidiMessage,
    ScriptedMidiDriver,
};
use comrelay_test_utils::wait_for_count;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn recorder() -> (MidiCallback, Arc<Mutex<Vec<MidiMessage>>>, Arc<AtomicU32>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let count = Arc::new(AtomicU32::new(0));
    let callback: MidiCallback = {
        let seen = seen.clone();
        let count = count.clone();
        Arc::new(move |_: &MidiClient, _: &MidiEvent, message: &MidiMessage| {
            seen.lock().push(*message);
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    (callback, seen, count)
}

fn cc_values(seen: &Mutex<Vec<MidiMessage>>) -> Vec<u8> {
    seen.lock()
        .iter()
        .filter_map(|m| match m {
            MidiMessage::ControlChange { value, .. } => Some(*value),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_midi_dedupe_repeated_values() {
    let driver = ScriptedMidiDriver::with_devices(&["nanoKONTROL2"]);
    let (callback, seen, count) = recorder();
    let client = MidiClient::new("midi", 0, Arc::new(driver.clone()), Some(callback));
    client.start().unwrap();

    for value in [10, 10, 20, 20, 10] {
        assert!(driver.inject_cc(0, 1, 0, value));
    }
    // A marker on another controller proves the earlier events were processed
    assert!(driver.inject_cc(0, 1, 7, 1));

    assert!(wait_for_count(&count, 4, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 4);
    assert_eq!(cc_values(&seen), vec![10, 20, 10, 1]);
    assert_eq!(client.suppressed(), 2);
    client.stop();
}

#[tokio::test]
async fn test_midi_distinct_controllers_not_suppressed() {
    let driver = ScriptedMidiDriver::with_devices(&["pad"]);
    let (callback, seen, count) = recorder();
    let client = MidiClient::new("midi", 0, Arc::new(driver.clone()), Some(callback));
    client.start().unwrap();

    driver.inject_cc(0, 1, 0, 64);
    driver.inject_cc(0, 1, 1, 64);
    driver.inject_cc(0, 2, 0, 64);

    assert!(wait_for_count(&count, 3, WAIT).await);
    assert_eq!(seen.lock().len(), 3);
    client.stop();
}

#[tokio::test]
async fn test_midi_stop_resets_cache() {
    let driver = ScriptedMidiDriver::with_devices(&["pad"]);
    let (callback, _seen, count) = recorder();
    let client = MidiClient::new("midi", 0, Arc::new(driver.clone()), Some(callback));

    client.start().unwrap();
    driver.inject_cc(0, 1, 0, 42);
    assert!(wait_for_count(&count, 1, WAIT).await);

    client.stop();
    client.stop();
    assert!(!driver.is_open(0));
    assert!(!client.is_running());

    client.start().unwrap();
    driver.inject_cc(0, 1, 0, 42);
    assert!(
        wait_for_count(&count, 2, WAIT).await,
        "value cached before stop must be delivered again"
    );
    client.stop();
}

/// Blocks in `open` until released, like a host driver waiting on its port
struct SlowOpenDriver {
    devices: ScriptedMidiDriver,
    entered: Mutex<std_mpsc::Sender<()>>,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl MidiDriver for SlowOpenDriver {
    fn list_devices(&self) -> comrelay_bridge::Result<Vec<MidiDevice>> {
        self.devices.list_devices()
    }

    fn open(
        &self,
        index: usize,
        sink: MidiSink,
    ) -> comrelay_bridge::Result<Box<dyn MidiInputHandle>> {
        let _ = self.entered.lock().send(());
        let _ = self.release.lock().recv_timeout(WAIT);
        self.devices.open(index, sink)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_midi_state_readable_while_device_opens() {
    let (entered_tx, entered_rx) = std_mpsc::channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let driver = SlowOpenDriver {
        devices: ScriptedMidiDriver::with_devices(&["pad"]),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    };
    let client = MidiClient::new("midi", 0, Arc::new(driver), None);

    let opening = {
        let client = client.clone();
        tokio::task::spawn_blocking(move || client.start())
    };
    entered_rx.recv_timeout(WAIT).expect("driver open was not called");

    // Query from a plain thread so a held lock shows up as a timeout
    let (state_tx, state_rx) = std_mpsc::channel();
    let observer = client.clone();
    std::thread::spawn(move || {
        let running = observer.is_running();
        let second = observer.start();
        let _ = state_tx.send((running, second));
    });
    let (running, second) = state_rx
        .recv_timeout(WAIT)
        .expect("client state blocked behind the device open");
    assert!(!running);
    assert!(matches!(second, Err(BridgeError::AlreadyStarted)));

    release_tx.send(()).unwrap();
    opening.await.unwrap().unwrap();
    assert!(client.is_running());
    client.stop();
    assert!(!client.is_running());
}

#[tokio::test]
async fn test_midi_callback_panic_isolated() {
    let driver = ScriptedMidiDriver::with_devices(&["pad"]);
    let count = Arc::new(AtomicU32::new(0));
    let callback: MidiCallback = {
        let count = count.clone();
        Arc::new(move |_: &MidiClient, event: &MidiEvent, _: &MidiMessage| {
            count.fetch_add(1, Ordering::SeqCst);
            if event.data2() == 0 {
                panic!("bad value");
            }
        })
    };
    let client = MidiClient::new("midi", 0, Arc::new(driver.clone()), Some(callback));
    client.start().unwrap();

    driver.inject_cc(0, 1, 0, 0);
    driver.inject_cc(0, 1, 0, 5);

    assert!(wait_for_count(&count, 2, WAIT).await);
    client.stop();
}

#[tokio::test]
async fn test_midi_raw_events_in_order() {
    let driver = ScriptedMidiDriver::with_devices(&["keys"]);
    let (callback, seen, count) = recorder();
    let client = MidiClient::new("midi", 0, Arc::new(driver.clone()), Some(callback));
    client.start().unwrap();

    driver.inject(0, MidiEvent::new(pack(0x90, 60, 100), 1));
    driver.inject(0, MidiEvent::new(pack(0x80, 60, 0), 2));
    driver.inject(0, MidiEvent::new(pack(0xC0, 4, 0), 3));

    assert!(wait_for_count(&count, 3, WAIT).await);
    let seen = seen.lock();
    assert!(matches!(seen[0], MidiMessage::NoteOn { note: 60, .. }));
    assert!(matches!(seen[1], MidiMessage::NoteOff { note: 60, .. }));
    assert!(matches!(seen[2], MidiMessage::ProgramChange { program: 4, .. }));
    drop(seen);
    client.stop();
}

// ============================================================================
// Manager Tests
// ============================================================================

#[tokio::test]
async fn test_manager_add_without_devices() {
    let manager = MidiClientManager::new(Arc::new(ScriptedMidiDriver::with_devices(&[])));

    assert!(matches!(
        manager.add("RelayMIDI", 0, None),
        Err(BridgeError::NoDevices)
    ));
    assert!(manager.is_empty());
    assert!(matches!(
        manager.auto_select_device(),
        Err(BridgeError::NoDevices)
    ));
}

#[tokio::test]
async fn test_manager_add_out_of_range() {
    let manager = MidiClientManager::new(Arc::new(ScriptedMidiDriver::with_devices(&["pad"])));

    assert!(matches!(
        manager.add("RelayMIDI", 2, None),
        Err(BridgeError::DeviceIndexOutOfRange { index: 2, .. })
    ));
    assert!(manager.is_empty());
}

#[tokio::test]
async fn test_manager_duplicate_and_set_callback() {
    let driver = ScriptedMidiDriver::with_devices(&["a", "b"]);
    let manager = MidiClientManager::new(Arc::new(driver.clone()));

    manager.add("m", 0, None).unwrap();
    assert!(manager.add("m", 1, None).is_err());
    assert_eq!(manager.len(), 1);
    assert!(!driver.is_open(1), "rejected duplicate must not open a device");

    let (callback, _seen, count) = recorder();
    manager.set_callback("m", Some(callback)).unwrap();
    driver.inject_cc(0, 1, 0, 9);
    assert!(wait_for_count(&count, 1, WAIT).await);

    let list = manager.list();
    assert_eq!(list[0].device_name.as_deref(), Some("a"));

    manager.remove("m").unwrap();
    assert!(manager.remove("m").is_err());
    assert!(!driver.is_open(0));
}

#[tokio::test]
async fn test_manager_auto_select() {
    let single = MidiClientManager::new(Arc::new(ScriptedMidiDriver::with_devices(&["only"])));
    assert_eq!(single.auto_select_device().unwrap(), 0);

    let several =
        MidiClientManager::new(Arc::new(ScriptedMidiDriver::with_devices(&["a", "b", "c"])));
    assert_eq!(several.auto_select_device().unwrap(), 0);
}
