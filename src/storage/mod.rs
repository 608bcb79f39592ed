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

//! Storage for received payloads.

mod images;

pub use images::{ImageFormat, ImageStore, MemoryImageSink};

use anyhow::Result;

/// Persists a reassembled image.
pub trait ImageSink: Send + Sync {
    /// Store the bytes and return where they went.
    fn save(&self, bytes: &[u8]) -> Result<String>;
}
