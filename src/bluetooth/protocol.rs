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

//! Text framing carried over the message characteristics.
//!
//! Every characteristic write or notification is one UTF-8 string. Images
//! travel as `IMG_START:<n>`, then `IMG_CHUNK:<i>:<base64>` for each chunk
//! in ascending order, then `IMG_END`. Anything else is a plain message.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::fmt;

const IMG_START: &str = "IMG_START:";
const IMG_CHUNK: &str = "IMG_CHUNK:";
const IMG_END: &str = "IMG_END";

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    /// Start of an image with the number of chunks that follow.
    ImageStart { count: usize },
    /// One base64 chunk at its position.
    ImageChunk { index: usize, data: String },
    ImageEnd,
    Text(String),
}

impl TransferFrame {
    /// Parse one inbound string.
    ///
    /// Returns `None` for image frames with a missing or non-numeric count
    /// or index.
    pub fn parse(text: &str) -> Option<Self> {
        if let Some(rest) = text.strip_prefix(IMG_START) {
            return rest
                .trim()
                .parse()
                .ok()
                .map(|count| Self::ImageStart { count });
        }

        if let Some(rest) = text.strip_prefix(IMG_CHUNK) {
            let (index, data) = rest.split_once(':')?;
            let index = index.parse().ok()?;
            return Some(Self::ImageChunk {
                index,
                data: data.to_string(),
            });
        }

        if text == IMG_END {
            return Some(Self::ImageEnd);
        }

        Some(Self::Text(text.to_string()))
    }

    /// Wire string for this frame.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn is_image_frame(&self) -> bool {
        !matches!(self, Self::Text(_))
    }
}

impl fmt::Display for TransferFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageStart { count } => write!(f, "{}{}", IMG_START, count),
            Self::ImageChunk { index, data } => write!(f, "{}{}:{}", IMG_CHUNK, index, data),
            Self::ImageEnd => f.write_str(IMG_END),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Outbound image split into base64 chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    chunks: Vec<String>,
    chunk_size: usize,
}

impl TransferSession {
    /// Encode `bytes` and split the base64 text into `chunk_size` pieces.
    pub fn new(bytes: &[u8], chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let encoded = STANDARD.encode(bytes);
        // base64 output is ASCII, so byte chunks are valid strings
        let chunks = encoded
            .as_bytes()
            .chunks(chunk_size)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();

        Self { chunks, chunk_size }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    /// START, every chunk in order, END.
    pub fn frames(&self) -> Vec<TransferFrame> {
        let mut frames = Vec::with_capacity(self.chunks.len() + 2);
        frames.push(TransferFrame::ImageStart {
            count: self.chunks.len(),
        });
        frames.extend(
            self.chunks
                .iter()
                .enumerate()
                .map(|(index, data)| TransferFrame::ImageChunk {
                    index,
                    data: data.clone(),
                }),
        );
        frames.push(TransferFrame::ImageEnd);
        frames
    }
}

/// Number of chunk messages for an image of `len` bytes.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    let encoded = len.div_ceil(3) * 4;
    encoded.div_ceil(chunk_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frames() {
        assert_eq!(
            TransferFrame::parse("IMG_START:2"),
            Some(TransferFrame::ImageStart { count: 2 })
        );
        assert_eq!(
            TransferFrame::parse("IMG_CHUNK:1:QUJD"),
            Some(TransferFrame::ImageChunk {
                index: 1,
                data: "QUJD".to_string()
            })
        );
        assert_eq!(TransferFrame::parse("IMG_END"), Some(TransferFrame::ImageEnd));
        assert_eq!(
            TransferFrame::parse("hello: world"),
            Some(TransferFrame::Text("hello: world".to_string()))
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(TransferFrame::parse("IMG_START:x"), None);
        assert_eq!(TransferFrame::parse("IMG_CHUNK:abc"), None);
        assert_eq!(TransferFrame::parse("IMG_CHUNK:-1:AA"), None);
    }

    #[test]
    fn test_encode_matches_wire() {
        assert_eq!(TransferFrame::ImageStart { count: 3 }.encode(), "IMG_START:3");
        assert_eq!(
            TransferFrame::ImageChunk {
                index: 0,
                data: "AAEC".to_string()
            }
            .encode(),
            "IMG_CHUNK:0:AAEC"
        );
        assert_eq!(TransferFrame::ImageEnd.encode(), "IMG_END");
    }

    #[test]
    fn test_session_256_bytes() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let session = TransferSession::new(&bytes, 180);

        let total: usize = session.chunks().iter().map(|c| c.len()).sum();
        assert_eq!(total, 344);
        assert_eq!(session.chunk_count(), 2);
        assert_eq!(session.chunks()[0].len(), 180);
        assert_eq!(session.chunks()[1].len(), 164);

        let frames = session.frames();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0], TransferFrame::ImageStart { count: 2 });
        assert_eq!(frames[3], TransferFrame::ImageEnd);
    }

    #[test]
    fn test_chunk_count_formula() {
        for len in [0usize, 1, 2, 3, 134, 135, 136, 256, 1000, 4096] {
            let session = TransferSession::new(&vec![0xAB; len], 180);
            assert_eq!(session.chunk_count(), chunk_count(len, 180), "len {}", len);
        }
    }
}
