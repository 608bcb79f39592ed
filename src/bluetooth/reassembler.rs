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

//! Inbound frame handling and image reassembly.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::TransferError;
use super::events::{BleEvent, EventSink};
use super::peers::PeerIdentity;
use super::protocol::TransferFrame;
use crate::storage::ImageSink;

/// Reassembles one sender's image chunks.
pub struct ImageReassembler {
    chunks: BTreeMap<usize, String>,
    expected: usize,
    in_progress: bool,
}

impl ImageReassembler {
    pub fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
            expected: 0,
            in_progress: false,
        }
    }

    /// Begin a new image, discarding any partial one.
    pub fn start(&mut self, count: usize) {
        if self.in_progress {
            debug!("Discarding partial image with {} chunks", self.chunks.len());
        }
        self.chunks.clear();
        self.expected = count;
        self.in_progress = true;
    }

    /// Store a chunk. A repeated index replaces the earlier chunk.
    pub fn push(&mut self, index: usize, data: String) -> Result<(), TransferError> {
        if !self.in_progress {
            return Err(TransferError::NotStarted);
        }
        if index >= self.expected {
            return Err(TransferError::IndexOutOfRange {
                index,
                count: self.expected,
            });
        }
        self.chunks.insert(index, data);
        Ok(())
    }

    /// Concatenate chunks in index order and decode.
    ///
    /// The reassembler is reset whatever the outcome.
    pub fn finish(&mut self) -> Result<Vec<u8>, TransferError> {
        if !self.in_progress {
            return Err(TransferError::NotStarted);
        }

        let expected = self.expected;
        let chunks = std::mem::take(&mut self.chunks);
        self.reset();

        if chunks.len() != expected {
            return Err(TransferError::Incomplete {
                expected,
                received: chunks.len(),
            });
        }

        let encoded: String = chunks.into_values().collect();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(|_| TransferError::InvalidBase64)
    }

    pub fn reset(&mut self) {
        self.chunks.clear();
        self.expected = 0;
        self.in_progress = false;
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn received(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for ImageReassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes inbound text from either role to messages or image reassembly.
pub struct InboundRouter {
    sessions: Mutex<HashMap<String, ImageReassembler>>,
    sink: Arc<dyn ImageSink>,
    events: EventSink,
}

impl InboundRouter {
    pub fn new(sink: Arc<dyn ImageSink>, events: EventSink) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            sink,
            events,
        }
    }

    /// Handle raw characteristic bytes from `sender`.
    pub fn handle_bytes(&self, sender: &PeerIdentity, value: &[u8]) {
        match std::str::from_utf8(value) {
            Ok(text) => self.handle_text(sender, text),
            Err(e) => warn!(
                "Dropping non-UTF-8 payload from {}: {} ({})",
                sender,
                e,
                hex::encode(&value[..value.len().min(16)])
            ),
        }
    }

    pub fn handle_text(&self, sender: &PeerIdentity, text: &str) {
        let Some(frame) = TransferFrame::parse(text) else {
            warn!("Dropping malformed frame from {}: {:.40}", sender, text);
            return;
        };

        match frame {
            TransferFrame::Text(text) => {
                self.events.log(format!("Message from {}: {}", sender, text));
                self.events.emit(BleEvent::InboundMessage {
                    text,
                    sender: sender.clone(),
                });
            }
            TransferFrame::ImageStart { count } => {
                self.events
                    .log(format!("Receiving image from {} ({} chunks)", sender, count));
                self.sessions
                    .lock()
                    .entry(sender.address.clone())
                    .or_default()
                    .start(count);
            }
            TransferFrame::ImageChunk { index, data } => {
                let result = self
                    .sessions
                    .lock()
                    .get_mut(&sender.address)
                    .map(|session| session.push(index, data))
                    .unwrap_or(Err(TransferError::NotStarted));
                if let Err(e) = result {
                    self.events.error(e.into());
                }
            }
            TransferFrame::ImageEnd => {
                let result = self
                    .sessions
                    .lock()
                    .remove(&sender.address)
                    .map(|mut session| session.finish())
                    .unwrap_or(Err(TransferError::NotStarted));
                match result {
                    Ok(bytes) => self.persist(sender, bytes),
                    Err(e) => self.events.error(e.into()),
                }
            }
        }
    }

    fn persist(&self, sender: &PeerIdentity, bytes: Vec<u8>) {
        let size = bytes.len();
        match self.sink.save(&bytes) {
            Ok(location) => {
                self.events
                    .log(format!("Image saved: {} ({} bytes)", location, size));
                self.events.emit(BleEvent::ImageReceived {
                    sender: sender.clone(),
                    location,
                    size,
                });
            }
            Err(e) => self
                .events
                .error(TransferError::Persist(e.to_string()).into()),
        }
    }

    /// Drop the partial image of a peer that went away.
    pub fn forget(&self, sender: &PeerIdentity) {
        if let Some(session) = self.sessions.lock().remove(&sender.address) {
            if session.is_in_progress() {
                debug!(
                    "Dropping partial image from {} ({} chunks)",
                    sender,
                    session.received()
                );
            }
        }
    }

    /// Drop every partial image.
    pub fn reset(&self) {
        self.sessions.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::protocol::TransferSession;
    use crate::storage::MemoryImageSink;

    #[test]
    fn test_out_of_order_reassembly() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let session = TransferSession::new(&bytes, 180);

        let mut r = ImageReassembler::new();
        r.start(session.chunk_count());
        r.push(1, session.chunks()[1].clone()).unwrap();
        r.push(0, session.chunks()[0].clone()).unwrap();
        assert_eq!(r.finish().unwrap(), bytes);
        assert!(!r.is_in_progress());
    }

    #[test]
    fn test_duplicate_chunk_last_wins() {
        let mut r = ImageReassembler::new();
        r.start(1);
        r.push(0, "!!!!".to_string()).unwrap();
        r.push(0, "QUJD".to_string()).unwrap();
        assert_eq!(r.finish().unwrap(), b"ABC");
    }

    #[test]
    fn test_rejections() {
        let mut r = ImageReassembler::new();
        assert_eq!(r.push(0, "AA".into()), Err(TransferError::NotStarted));

        r.start(2);
        assert_eq!(
            r.push(2, "AA".into()),
            Err(TransferError::IndexOutOfRange { index: 2, count: 2 })
        );
        r.push(0, "QUJD".into()).unwrap();
        assert_eq!(
            r.finish(),
            Err(TransferError::Incomplete {
                expected: 2,
                received: 1
            })
        );

        r.start(1);
        r.push(0, "***".into()).unwrap();
        assert_eq!(r.finish(), Err(TransferError::InvalidBase64));
    }

    #[test]
    fn test_start_resets_partial() {
        let mut r = ImageReassembler::new();
        r.start(3);
        r.push(0, "AAAA".into()).unwrap();
        r.start(1);
        assert_eq!(r.received(), 0);
        r.push(0, "QUJD".into()).unwrap();
        assert_eq!(r.finish().unwrap(), b"ABC");
    }

    #[test]
    fn test_router_per_sender() {
        let sink = Arc::new(MemoryImageSink::default());
        let (events, mut rx) = EventSink::channel();
        let router = InboundRouter::new(sink.clone(), events);

        let a = PeerIdentity::new("AA", None);
        let b = PeerIdentity::new("BB", None);

        router.handle_text(&a, "IMG_START:1");
        router.handle_text(&b, "IMG_START:1");
        router.handle_text(&b, "IMG_CHUNK:0:WFla");
        router.handle_text(&a, "IMG_CHUNK:0:QUJD");
        router.handle_text(&a, "hello");
        router.handle_text(&a, "IMG_END");
        router.handle_text(&b, "IMG_END");

        assert_eq!(sink.saved(), vec![b"ABC".to_vec(), b"XYZ".to_vec()]);

        let mut inbound = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BleEvent::InboundMessage { text, sender } = event {
                inbound.push((text, sender.address));
            }
        }
        assert_eq!(inbound, vec![("hello".to_string(), "AA".to_string())]);
    }

    #[test]
    fn test_chunk_without_start_opens_no_session() {
        let sink = Arc::new(MemoryImageSink::default());
        let (events, mut rx) = EventSink::channel();
        let router = InboundRouter::new(sink.clone(), events);
        let peer = PeerIdentity::new("AA", None);

        router.handle_text(&peer, "IMG_CHUNK:0:QUJD");
        assert!(router.sessions.lock().is_empty());
        assert_eq!(
            rx.try_recv().ok(),
            Some(BleEvent::Error(TransferError::NotStarted.into()))
        );
    }

    #[test]
    fn test_forget_drops_partial_image() {
        let sink = Arc::new(MemoryImageSink::default());
        let (events, _rx) = EventSink::channel();
        let router = InboundRouter::new(sink.clone(), events);
        let a = PeerIdentity::new("AA", None);
        let b = PeerIdentity::new("BB", None);

        router.handle_text(&a, "IMG_START:2");
        router.handle_text(&a, "IMG_CHUNK:0:QUJD");
        router.handle_text(&b, "IMG_START:1");
        router.forget(&a);

        let sessions = router.sessions.lock();
        assert!(!sessions.contains_key("AA"));
        assert!(sessions.contains_key("BB"));
    }

    #[test]
    fn test_router_drops_bad_input() {
        let sink = Arc::new(MemoryImageSink::default());
        let (events, mut rx) = EventSink::channel();
        let router = InboundRouter::new(sink.clone(), events);
        let peer = PeerIdentity::new("AA", None);

        router.handle_bytes(&peer, &[0xff, 0xfe]);
        router.handle_text(&peer, "IMG_START:many");
        router.handle_text(&peer, "IMG_END");

        assert!(sink.saved().is_empty());
        let errors: Vec<BleEvent> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, BleEvent::Error(_)))
            .collect();
        assert_eq!(
            errors,
            vec![BleEvent::Error(TransferError::NotStarted.into())]
        );
    }
}
