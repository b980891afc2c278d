//! MIDI input drivers
//!
//! A driver enumerates input devices and opens one by index, pushing every
//! event it receives into a [`MidiSink`] until the returned handle is closed.

use serde::Serialize;
use tokio::sync::mpsc;

use super::MidiEvent;
use crate::Result;

/// Where a driver delivers events, in arrival order
pub type MidiSink = mpsc::UnboundedSender<MidiEvent>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MidiDevice {
    pub index: usize,
    pub name: String,
}

/// An open input device. Closing stops delivery and releases the device.
pub trait MidiInputHandle: Send {
    fn close(self: Box<Self>);
}

pub trait MidiDriver: Send + Sync {
    /// Devices currently available. Devices whose details cannot be read are
    /// skipped.
    fn list_devices(&self) -> Result<Vec<MidiDevice>>;

    /// Open device `index` and start delivering into `sink`
    fn open(&self, index: usize, sink: MidiSink) -> Result<Box<dyn MidiInputHandle>>;
}

#[cfg(feature = "midi")]
pub use self::midir_impl::MidirDriver;

#[cfg(feature = "midi")]
mod midir_impl {
    use midir::{Ignore, MidiInput};
    use std::sync::mpsc as std_mpsc;
    use std::thread::JoinHandle;
    use tracing::{debug, info, warn};

    use super::{MidiDevice, MidiDriver, MidiInputHandle, MidiSink};
    use crate::midi::MidiEvent;
    use crate::{BridgeError, Result};

    /// Host MIDI through midir
    #[derive(Debug, Clone)]
    pub struct MidirDriver {
        client_name: String,
    }

    impl MidirDriver {
        pub fn new(client_name: &str) -> Self {
            Self {
                client_name: client_name.to_string(),
            }
        }

        fn input(&self, role: &str) -> Result<MidiInput> {
            MidiInput::new(&format!("{} {}", self.client_name, role))
                .map_err(|e| BridgeError::Protocol(e.to_string()))
        }
    }

    impl Default for MidirDriver {
        fn default() -> Self {
            Self::new("comrelay")
        }
    }

    impl MidiDriver for MidirDriver {
        fn list_devices(&self) -> Result<Vec<MidiDevice>> {
            let midi_in = self.input("scanner")?;
            let ports = midi_in.ports();
            info!("Found {} MIDI input devices:", ports.len());

            let mut devices = Vec::with_capacity(ports.len());
            for (index, port) in ports.iter().enumerate() {
                match midi_in.port_name(port) {
                    Ok(name) => {
                        info!("  {}: {}", index, name);
                        devices.push(MidiDevice { index, name });
                    }
                    Err(e) => warn!("  {}: Error getting device info ({})", index, e),
                }
            }
            Ok(devices)
        }

        fn open(&self, index: usize, sink: MidiSink) -> Result<Box<dyn MidiInputHandle>> {
            let client_name = format!("{} input", self.client_name);
            let (ready_tx, ready_rx) = std_mpsc::channel::<Result<String>>();
            let (close_tx, close_rx) = std_mpsc::channel::<()>();

            // midir handles are not Send on every platform; the connection
            // lives and dies on its own thread
            let thread = std::thread::Builder::new()
                .name(format!("midi-input-{}", index))
                .spawn(move || {
                    let mut midi_in = match MidiInput::new(&client_name) {
                        Ok(m) => m,
                        Err(e) => {
                            let _ = ready_tx.send(Err(BridgeError::Protocol(e.to_string())));
                            return;
                        }
                    };
                    midi_in.ignore(Ignore::None);

                    let ports = midi_in.ports();
                    let Some(port) = ports.get(index).cloned() else {
                        let _ = ready_tx.send(Err(BridgeError::DeviceIndexOutOfRange {
                            index,
                            available: ports.len(),
                        }));
                        return;
                    };
                    let name = midi_in
                        .port_name(&port)
                        .unwrap_or_else(|_| "Unknown".to_string());

                    let connection = midi_in.connect(
                        &port,
                        "comrelay-input",
                        move |stamp, message, _| {
                            if let Some(event) = MidiEvent::from_bytes(message, stamp) {
                                let _ = sink.send(event);
                            }
                        },
                        (),
                    );

                    let connection = match connection {
                        Ok(c) => c,
                        Err(e) => {
                            let _ = ready_tx.send(Err(BridgeError::ConnectionFailed(format!(
                                "failed to open MIDI device {}: {}",
                                index, e
                            ))));
                            return;
                        }
                    };

                    let _ = ready_tx.send(Ok(name));

                    // Block until the handle is closed or dropped
                    let _ = close_rx.recv();
                    let _ = connection.close();
                    debug!("MIDI input thread {} exited", index);
                })?;

            match ready_rx.recv() {
                Ok(Ok(name)) => {
                    debug!("MIDI input {} open: {}", index, name);
                    Ok(Box::new(MidirHandle {
                        close_tx: Some(close_tx),
                        thread: Some(thread),
                    }))
                }
                Ok(Err(e)) => {
                    let _ = thread.join();
                    Err(e)
                }
                Err(_) => Err(BridgeError::ConnectionFailed(
                    "MIDI input thread exited".to_string(),
                )),
            }
        }
    }

    struct MidirHandle {
        close_tx: Option<std_mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl MidiInputHandle for MidirHandle {
        fn close(mut self: Box<Self>) {
            self.shutdown();
        }
    }

    impl MidirHandle {
        fn shutdown(&mut self) {
            if let Some(tx) = self.close_tx.take() {
                let _ = tx.send(());
            }
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    impl Drop for MidirHandle {
        fn drop(&mut self) {
            self.shutdown();
        }
    }
}
