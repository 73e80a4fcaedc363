//! Camera collaborator
//!
//! A session holds exactly one stream for its whole lifetime.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Encoded still frame (JPEG/PNG bytes) as delivered by the camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData(pub Vec<u8>);

impl ImageData {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ImageData {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CameraError {
    #[error("Camera unavailable: {0}")]
    Unavailable(String),
}

/// Opaque token for a live stream.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamHandle(u64);

impl StreamHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

pub trait Camera {
    fn start_stream(&mut self) -> Result<StreamHandle, CameraError>;

    /// `None` when no frame is available right now.
    fn capture_frame(&mut self, handle: &StreamHandle) -> Option<ImageData>;

    fn stop_stream(&mut self, handle: StreamHandle);
}

/// Camera that replays a queue of frames; `None` entries simulate misses.
#[derive(Debug, Default)]
pub struct QueuedCamera {
    frames: VecDeque<Option<ImageData>>,
    available: bool,
    next_stream: u64,
    live: Option<u64>,
    starts: u32,
    stops: u32,
}

impl QueuedCamera {
    pub fn new(frames: impl IntoIterator<Item = Option<ImageData>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            available: true,
            ..Self::default()
        }
    }

    /// A camera whose stream never starts.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Frames are every image file in `dir`, in file-name order.
    pub fn from_dir(dir: &Path) -> Result<Self, std::io::Error> {
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
            })
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            frames.push(Some(ImageData(fs::read(&path)?)));
        }
        log::info!("loaded {} frames from {}", frames.len(), dir.display());
        Ok(Self::new(frames))
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    pub fn start_count(&self) -> u32 {
        self.starts
    }

    pub fn stop_count(&self) -> u32 {
        self.stops
    }

    pub fn is_streaming(&self) -> bool {
        self.live.is_some()
    }
}

impl Camera for QueuedCamera {
    fn start_stream(&mut self) -> Result<StreamHandle, CameraError> {
        if !self.available {
            return Err(CameraError::Unavailable("no video device".to_string()));
        }
        if self.live.is_some() {
            return Err(CameraError::Unavailable("stream already held".to_string()));
        }
        self.next_stream += 1;
        self.starts += 1;
        self.live = Some(self.next_stream);
        Ok(StreamHandle(self.next_stream))
    }

    fn capture_frame(&mut self, handle: &StreamHandle) -> Option<ImageData> {
        if self.live != Some(handle.0) {
            return None;
        }
        self.frames.pop_front().flatten()
    }

    fn stop_stream(&mut self, handle: StreamHandle) {
        if self.live == Some(handle.0) {
            self.live = None;
        }
        self.stops += 1;
    }
}
