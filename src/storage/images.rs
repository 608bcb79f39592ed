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

//! Image files written to the data directory.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::info;

use super::ImageSink;

/// Image container detected from magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Unknown,
}

impl ImageFormat {
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
            Self::Jpeg
        } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
            Self::Png
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Self::Gif
        } else {
            Self::Unknown
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Unknown => "bin",
        }
    }
}

/// Writes images to `<data_dir>/images`.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    /// Create the store, creating the directory if needed.
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("images");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating image directory {:?}", dir))?;
        info!("Image directory: {:?}", dir);
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, format: ImageFormat) -> PathBuf {
        let stamp = Utc::now().timestamp_millis();
        let mut path = self
            .dir
            .join(format!("BLE_IMG_{}.{}", stamp, format.extension()));
        // Two images within the same millisecond
        let mut n = 1;
        while path.exists() {
            path = self
                .dir
                .join(format!("BLE_IMG_{}_{}.{}", stamp, n, format.extension()));
            n += 1;
        }
        path
    }
}

impl ImageSink for ImageStore {
    fn save(&self, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(ImageFormat::detect(bytes));
        std::fs::write(&path, bytes).with_context(|| format!("writing {:?}", path))?;
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Keeps images in memory. Used when no data directory is available.
#[derive(Debug, Default)]
pub struct MemoryImageSink {
    images: Mutex<Vec<Vec<u8>>>,
}

impl MemoryImageSink {
    pub fn saved(&self) -> Vec<Vec<u8>> {
        self.images.lock().clone()
    }
}

impl ImageSink for MemoryImageSink {
    fn save(&self, bytes: &[u8]) -> Result<String> {
        let mut images = self.images.lock();
        images.push(bytes.to_vec());
        Ok(format!("memory:{}", images.len() - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_detect_format() {
        assert_eq!(ImageFormat::detect(&[0xff, 0xd8, 0xff, 0xe0]), ImageFormat::Jpeg);
        assert_eq!(
            ImageFormat::detect(&[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0]),
            ImageFormat::Png
        );
        assert_eq!(ImageFormat::detect(b"GIF89a..."), ImageFormat::Gif);
        assert_eq!(ImageFormat::detect(&[0, 1, 2]), ImageFormat::Unknown);
        assert_eq!(ImageFormat::Unknown.extension(), "bin");
    }

    #[test]
    fn test_store_writes_files() {
        let dir = tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();

        let first = store.save(&[0xff, 0xd8, 0xff, 0x00]).unwrap();
        let second = store.save(&[0xff, 0xd8, 0xff, 0x01]).unwrap();
        assert_ne!(first, second);

        let path = PathBuf::from(&first);
        assert!(path.starts_with(dir.path().join("images")));
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("BLE_IMG_") && n.ends_with(".jpg")));
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xff, 0xd8, 0xff, 0x00]);
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemoryImageSink::default();
        assert_eq!(sink.save(b"abc").unwrap(), "memory:0");
        assert_eq!(sink.saved(), vec![b"abc".to_vec()]);
    }
}
