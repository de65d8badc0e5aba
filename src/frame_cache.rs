use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Frames older than this are reported as absent.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Disconnected,
    Connecting,
    Streaming,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Connecting,
            2 => StreamState::Streaming,
            _ => StreamState::Disconnected,
        }
    }
}

/// A captured JPEG frame and its capture time.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub captured_at: DateTime<Utc>,
}

struct Slot {
    frame: Frame,
    stored_at: Instant,
}

/// Latest-frame slot for one camera.
///
/// The slot is only reachable through `store`/`get_frame`, which take the
/// lock, swap or clone the frame, and release it before returning. Frame
/// buffers are immutable `Bytes`, so a copy handed to a reader stays valid
/// no matter how many frames are written afterwards.
pub struct FrameCache {
    camera_id: String,
    slot: Mutex<Option<Slot>>,
    state: AtomicU8,
}

impl FrameCache {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            slot: Mutex::new(None),
            state: AtomicU8::new(StreamState::Disconnected as u8),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    fn lock(&self) -> MutexGuard<'_, Option<Slot>> {
        // Writes are a single assignment, so a poisoned slot is still consistent.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn store(&self, data: Bytes) {
        let slot = Slot {
            frame: Frame { data, captured_at: Utc::now() },
            stored_at: Instant::now(),
        };
        *self.lock() = Some(slot);
    }

    /// Latest frame if it was captured less than `STALE_AFTER` ago.
    pub fn get_frame(&self) -> Option<Frame> {
        let guard = self.lock();
        let slot = guard.as_ref()?;
        if slot.stored_at.elapsed() < STALE_AFTER {
            Some(slot.frame.clone())
        } else {
            None
        }
    }

    pub fn last_frame_time(&self) -> Option<DateTime<Utc>> {
        self.lock().as_ref().map(|slot| slot.frame.captured_at)
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// One enabled camera as seen by preview clients.
pub struct CameraFeed {
    pub id: String,
    pub name: String,
    pub cache: Arc<FrameCache>,
}

/// Read-only view over every camera's frame cache, in configuration order.
#[derive(Clone, Default)]
pub struct FrameRegistry {
    feeds: Arc<Vec<CameraFeed>>,
}

impl FrameRegistry {
    pub fn new(feeds: Vec<CameraFeed>) -> Self {
        Self { feeds: Arc::new(feeds) }
    }

    pub fn feed(&self, camera_id: &str) -> Option<&CameraFeed> {
        self.feeds.iter().find(|f| f.id == camera_id)
    }

    pub fn first(&self) -> Option<&CameraFeed> {
        self.feeds.first()
    }

    pub fn feeds(&self) -> &[CameraFeed] {
        &self.feeds
    }

    pub fn get_frame(&self, camera_id: &str) -> Option<Frame> {
        self.feed(camera_id)?.cache.get_frame()
    }
}
