// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Event processing and host output.

use anyhow::Result;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::bluetooth::{AdvertiseFailure, BleError, BleEvent, Role};
use crate::state::AppState;

/// Shows short status lines to the user.
pub trait StatusNotifier: Send + Sync {
    fn show(&self, text: &str);
}

/// Notifier that writes status lines to the log.
pub struct LogNotifier;

impl StatusNotifier for LogNotifier {
    fn show(&self, text: &str) {
        info!("Status: {}", text);
    }
}

/// How events are written to the host output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable lines for inbound traffic only.
    Text,
    /// Every event as one JSON object per line.
    Json,
}

/// Process events from the BLE engines.
pub struct EventProcessor {
    state: Arc<AppState>,
    notifier: Box<dyn StatusNotifier>,
    format: OutputFormat,
    out: Box<dyn Write + Send>,
    last_status: Option<String>,
}

impl EventProcessor {
    /// Create a new event processor writing to stdout.
    pub fn new(state: Arc<AppState>, notifier: Box<dyn StatusNotifier>, format: OutputFormat) -> Self {
        Self::with_output(state, notifier, format, Box::new(std::io::stdout()))
    }

    pub fn with_output(
        state: Arc<AppState>,
        notifier: Box<dyn StatusNotifier>,
        format: OutputFormat,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            state,
            notifier,
            format,
            out,
            last_status: None,
        }
    }

    /// Process a single event.
    pub fn process_event(&mut self, event: BleEvent) -> Result<()> {
        let previous_clients = self.state.get_clients().len();
        self.state.apply(&event);

        match self.format {
            OutputFormat::Json => {
                let line = serde_json::to_string(&event)?;
                writeln!(self.out, "{}", line)?;
            }
            OutputFormat::Text => self.write_text(&event)?,
        }

        if let Some(status) = self.status_for(&event, previous_clients) {
            self.show(status);
        }
        Ok(())
    }

    fn write_text(&mut self, event: &BleEvent) -> Result<()> {
        match event {
            BleEvent::InboundMessage { text, sender } => {
                writeln!(self.out, "[{}] {}", sender, text)?;
            }
            BleEvent::IdentifierReceived { identifier, sender } => {
                writeln!(self.out, "[{}] identifier {}", sender, identifier)?;
            }
            BleEvent::PeerIdentifier { identifier, peer } => {
                writeln!(self.out, "[{}] identifier {}", peer, identifier)?;
            }
            BleEvent::ImageReceived {
                sender,
                location,
                size,
            } => {
                writeln!(self.out, "[{}] image {} bytes -> {}", sender, size, location)?;
            }
            BleEvent::Error(e) => {
                error!("BLE error: {}", e);
            }
            other => debug!("Event: {:?}", other),
        }
        Ok(())
    }

    /// Status line an event warrants, if any.
    fn status_for(&self, event: &BleEvent, previous_clients: usize) -> Option<String> {
        match event {
            BleEvent::RoleChanged(Role::Peripheral) => Some("Starting Peripheral Mode...".to_string()),
            BleEvent::RoleChanged(Role::Central) => Some("BLE Connections Active".to_string()),
            BleEvent::RoleChanged(Role::Idle) => Some("Idle".to_string()),
            BleEvent::AdvertisingStateChanged(true) => {
                Some("Advertising - Waiting for connections".to_string())
            }
            BleEvent::AdvertisingStateChanged(false) => Some("Advertising stopped".to_string()),
            BleEvent::Error(BleError::AdvertiseFailed(reason)) => {
                Some(format!("Advertising failed: {}", advertise_reason(reason)))
            }
            BleEvent::ConnectedClientsUpdated(clients) => match clients.len() {
                0 if self.state.get_role() == Role::Peripheral => {
                    Some("Advertising - No connections".to_string())
                }
                0 => None,
                n if n > previous_clients => clients
                    .last()
                    .map(|c| format!("Connected: {}", c.identity)),
                n => Some(format!("Connected: {} clients", n)),
            },
            BleEvent::ConnectedPeersUpdated(_) => Some(self.state.summary()),
            _ => None,
        }
    }

    fn show(&mut self, status: String) {
        if self.last_status.as_deref() == Some(status.as_str()) {
            return;
        }
        self.notifier.show(&status);
        self.last_status = Some(status);
    }
}

fn advertise_reason(reason: &AdvertiseFailure) -> &'static str {
    match reason {
        AdvertiseFailure::AlreadyStarted => "Already started",
        AdvertiseFailure::DataTooLarge => "Data too large",
        AdvertiseFailure::FeatureUnsupported => "Feature unsupported",
        AdvertiseFailure::InternalError => "Internal error",
        AdvertiseFailure::TooManyAdvertisers => "Too many advertisers",
        AdvertiseFailure::Unknown(_) => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::{ConnectedClient, PeerIdentity};
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl StatusNotifier for Recorder {
        fn show(&self, text: &str) {
            self.0.lock().push(text.to_string());
        }
    }

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn client(address: &str, name: &str) -> ConnectedClient {
        ConnectedClient {
            identity: PeerIdentity::new(address, Some(name.to_string())),
        }
    }

    #[test]
    fn test_peripheral_status_lines() {
        let recorder = Recorder::default();
        let mut processor = EventProcessor::with_output(
            AppState::new(),
            Box::new(recorder.clone()),
            OutputFormat::Text,
            Box::new(Buffer::default()),
        );

        for event in [
            BleEvent::RoleChanged(Role::Peripheral),
            BleEvent::AdvertisingStateChanged(true),
            BleEvent::ConnectedClientsUpdated(vec![client("A", "phone")]),
            BleEvent::ConnectedClientsUpdated(vec![client("A", "phone"), client("B", "tab")]),
            BleEvent::ConnectedClientsUpdated(vec![client("B", "tab")]),
            BleEvent::ConnectedClientsUpdated(vec![]),
        ] {
            processor.process_event(event).unwrap();
        }

        assert_eq!(
            *recorder.0.lock(),
            vec![
                "Starting Peripheral Mode...",
                "Advertising - Waiting for connections",
                "Connected: phone (A)",
                "Connected: tab (B)",
                "Connected: 1 clients",
                "Advertising - No connections",
            ]
        );
    }

    #[test]
    fn test_json_output() {
        let buffer = Buffer::default();
        let mut processor = EventProcessor::with_output(
            AppState::new(),
            Box::new(LogNotifier),
            OutputFormat::Json,
            Box::new(buffer.clone()),
        );
        processor
            .process_event(BleEvent::ScanningStateChanged(true))
            .unwrap();

        let written = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert_eq!(written, "{\"event\":\"scanning_state_changed\",\"data\":true}\n");
    }

    #[test]
    fn test_inbound_message_printed() {
        let buffer = Buffer::default();
        let mut processor = EventProcessor::with_output(
            AppState::new(),
            Box::new(LogNotifier),
            OutputFormat::Text,
            Box::new(buffer.clone()),
        );
        processor
            .process_event(BleEvent::InboundMessage {
                text: "hi".to_string(),
                sender: PeerIdentity::new("A", Some("phone".to_string())),
            })
            .unwrap();

        let written = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert_eq!(written, "[phone (A)] hi\n");
    }
}
