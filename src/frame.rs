use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Returns captured buffers to the stream/allocator layer once all references
/// are dropped. The buffer pool itself is owned by the stream layer; this core
/// only tracks release responsibility.
pub trait FrameReleaser: Send + Sync {
    fn release_buffer(&self, stream_id: u32, buf_idx: u32);
}

/// Releaser for buffers that no one downstream needs back (synthetic frames,
/// reprocess outputs drawn from a device-internal pool).
pub struct NullReleaser;

impl FrameReleaser for NullReleaser {
    fn release_buffer(&self, _stream_id: u32, _buf_idx: u32) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    Preview,
    Snapshot,
    Raw,
    Metadata,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PlaneInfo {
    pub offset: usize,
    pub stride: usize,
    pub scanlines: usize,
}

/// Descriptor for one capture buffer. The raw memory handle is a cheap
/// refcounted `Bytes`; the actual allocation belongs to the stream layer and
/// is identified by (stream_id, buf_idx) at release time.
#[derive(Clone)]
pub struct FrameBuf {
    pub stream_id: u32,
    pub buf_idx: u32,
    pub frame_idx: u32,
    pub timestamp_us: i64,
    pub stream_type: StreamType,
    pub planes: Vec<PlaneInfo>,
    pub data: Bytes,
    /// AF result for this frame; priority filtering keys off it.
    pub focused: bool,
    /// Metadata streams deliver frames whose payload may not be valid yet.
    pub meta_valid: bool,
}

impl FrameBuf {
    pub fn new(stream_id: u32, buf_idx: u32, frame_idx: u32, data: Bytes) -> Self {
        Self {
            stream_id,
            buf_idx,
            frame_idx,
            timestamp_us: 0,
            stream_type: StreamType::Snapshot,
            planes: Vec::new(),
            data,
            focused: true,
            meta_valid: true,
        }
    }
}

impl Display for FrameBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "FrameBuf stream: {}, buf: {}, frame_idx: {}, type: {:?}, len: {}",
            self.stream_id,
            self.buf_idx,
            self.frame_idx,
            self.stream_type,
            self.data.len()
        )
    }
}

/// Compares frame indices with wrap-around: true if `a` is newer than or equal
/// to `b` within half the index space.
pub fn frame_idx_newer(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) < u32::MAX / 2
}

/// A matched aggregate of frames, one per bundled stream, sharing a capture
/// index. Exclusively owned by whichever pipeline stage currently holds it.
///
/// Every frame is released back to the stream layer exactly once: explicitly
/// via [`SuperBuf::release`], by transfer via [`SuperBuf::forget`], or on drop
/// as a backstop so a super-buffer can never leak silently.
pub struct SuperBuf {
    pub ch_id: u32,
    pub frame_idx: u32,
    frames: Vec<FrameBuf>,
    releaser: Arc<dyn FrameReleaser>,
    released: bool,
}

impl SuperBuf {
    pub fn new(ch_id: u32, frames: Vec<FrameBuf>, releaser: Arc<dyn FrameReleaser>) -> Self {
        let frame_idx = frames.first().map(|f| f.frame_idx).unwrap_or(0);
        Self {
            ch_id,
            frame_idx,
            frames,
            releaser,
            released: false,
        }
    }

    pub fn frames(&self) -> &[FrameBuf] {
        &self.frames
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_of_type(&self, ty: StreamType) -> Option<&FrameBuf> {
        self.frames.iter().find(|f| f.stream_type == ty)
    }

    /// Main image frame: the snapshot stream if bundled, else the first frame.
    pub fn main_frame(&self) -> Option<&FrameBuf> {
        self.frame_of_type(StreamType::Snapshot)
            .or_else(|| self.frames.first())
    }

    /// Return every constituent frame to the stream layer. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for f in &self.frames {
            self.releaser.release_buffer(f.stream_id, f.buf_idx);
        }
    }

    /// Mark release responsibility as transferred to an earlier stage; no
    /// buffers are returned from here.
    pub fn forget(&mut self) {
        self.released = true;
    }
}

impl Drop for SuperBuf {
    fn drop(&mut self) {
        if !self.released {
            log::debug!(
                "SuperBuf ch {} frame_idx {}: releasing {} frames on drop",
                self.ch_id,
                self.frame_idx,
                self.frames.len()
            );
            self.release();
        }
    }
}

impl std::fmt::Debug for SuperBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("SuperBuf")
            .field("ch_id", &self.ch_id)
            .field("frame_idx", &self.frame_idx)
            .field("frames", &self.frames.len())
            .finish()
    }
}

impl Display for SuperBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "SuperBuf ch: {}, frame_idx: {}, frames: {}",
            self.ch_id,
            self.frame_idx,
            self.frames.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    pub(crate) struct RecordingReleaser {
        pub released: Mutex<Vec<(u32, u32)>>,
    }

    impl RecordingReleaser {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                released: Mutex::new(Vec::new()),
            })
        }
    }

    impl FrameReleaser for RecordingReleaser {
        fn release_buffer(&self, stream_id: u32, buf_idx: u32) {
            self.released.lock().unwrap().push((stream_id, buf_idx));
        }
    }

    #[test]
    fn release_is_exactly_once() {
        let rec = RecordingReleaser::new();
        let mut sb = SuperBuf::new(
            1,
            vec![
                FrameBuf::new(1, 0, 7, Bytes::new()),
                FrameBuf::new(2, 3, 7, Bytes::new()),
            ],
            rec.clone(),
        );
        sb.release();
        sb.release();
        drop(sb);
        assert_eq!(&*rec.released.lock().unwrap(), &[(1, 0), (2, 3)]);
    }

    #[test]
    fn drop_releases_unreleased() {
        let rec = RecordingReleaser::new();
        drop(SuperBuf::new(
            2,
            vec![FrameBuf::new(5, 1, 9, Bytes::new())],
            rec.clone(),
        ));
        assert_eq!(&*rec.released.lock().unwrap(), &[(5, 1)]);
    }

    #[test]
    fn forget_transfers_ownership() {
        let rec = RecordingReleaser::new();
        let mut sb = SuperBuf::new(3, vec![FrameBuf::new(1, 2, 4, Bytes::new())], rec.clone());
        sb.forget();
        drop(sb);
        assert!(rec.released.lock().unwrap().is_empty());
    }

    #[test]
    fn idx_rollover_compare() {
        assert!(frame_idx_newer(10, 5));
        assert!(frame_idx_newer(5, 5));
        assert!(!frame_idx_newer(5, 10));
        // across the wrap point
        assert!(frame_idx_newer(2, u32::MAX - 2));
        assert!(!frame_idx_newer(u32::MAX - 2, 2));
    }
}
