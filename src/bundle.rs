use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::frame::{FrameBuf, FrameReleaser, StreamType, SuperBuf, frame_idx_newer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyMode {
    /// Matches accumulate in the channel queue and are dispatched on request.
    Burst,
    /// Every match is dispatched to the notify callback as it completes.
    Continuous,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Normal,
    /// Only frames reported in-focus qualify for matching.
    Focused,
}

/// Per-channel bundling policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleAttr {
    /// Member streams; a super-buffer needs one frame from each.
    pub streams: Vec<u32>,
    pub notify_mode: NotifyMode,
    /// Burst mode: max matched super-buffers retained in the queue.
    pub water_mark: usize,
    /// Burst mode: dispatch counts back this many entries from the newest.
    pub look_back: usize,
    /// Continuous mode: suppress matching for this many frames after a match.
    pub post_frame_skip: u32,
    /// Unmatched bundles beyond this bound evict the oldest (backpressure).
    pub max_unmatched_frames: usize,
    pub priority: Priority,
}

impl Default for BundleAttr {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            notify_mode: NotifyMode::Continuous,
            water_mark: 2,
            look_back: 0,
            post_frame_skip: 0,
            max_unmatched_frames: 4,
            priority: Priority::Normal,
        }
    }
}

/// One bundling round: a frame slot per member stream, keyed by frame index.
struct MatchSlot {
    frame_idx: u32,
    matched: bool,
    slots: Vec<Option<FrameBuf>>,
}

impl MatchSlot {
    fn new(frame_idx: u32, num_streams: usize) -> Self {
        Self {
            frame_idx,
            matched: false,
            slots: (0..num_streams).map(|_| None).collect(),
        }
    }
}

/// The per-channel matching queue. Bundles are kept sorted by frame index so
/// matched super-buffers come out in non-decreasing order.
///
/// Only the owning channel worker touches this; cross-thread access goes
/// through the channel's command queue.
pub struct MatchQueue {
    ch_id: u32,
    attr: BundleAttr,
    releaser: Arc<dyn FrameReleaser>,
    bundles: VecDeque<MatchSlot>,
    expected_frame_idx: u32,
    match_cnt: usize,
}

impl MatchQueue {
    pub fn new(ch_id: u32, attr: BundleAttr, releaser: Arc<dyn FrameReleaser>) -> Self {
        Self {
            ch_id,
            attr,
            releaser,
            bundles: VecDeque::new(),
            expected_frame_idx: 0,
            match_cnt: 0,
        }
    }

    pub fn attr(&self) -> &BundleAttr {
        &self.attr
    }

    pub fn matched_cnt(&self) -> usize {
        self.match_cnt
    }

    pub fn unmatched_cnt(&self) -> usize {
        self.bundles.len() - self.match_cnt
    }

    pub fn expected_frame_idx(&self) -> u32 {
        self.expected_frame_idx
    }

    pub fn set_notify_mode(&mut self, mode: NotifyMode) {
        self.attr.notify_mode = mode;
    }

    /// Move the expected index forward (metadata hint / flush target). Frames
    /// older than the new index will be rejected on arrival.
    pub fn set_expected(&mut self, frame_idx: u32) {
        self.expected_frame_idx = frame_idx;
    }

    fn release_frame(&self, f: &FrameBuf) {
        self.releaser.release_buffer(f.stream_id, f.buf_idx);
    }

    fn release_slot(&self, slot: MatchSlot) {
        for f in slot.slots.into_iter().flatten() {
            self.release_frame(&f);
        }
    }

    /// Matching logic for one incoming stream frame.
    ///
    /// The frame either completes or joins a bundling round, or is released
    /// straight back to the stream layer (stale index, invalid metadata,
    /// priority-filtered, or evicted under the unmatched-frame cap). An
    /// unknown stream id is a caller error; the frame is still released.
    pub fn feed(&mut self, buf: FrameBuf) -> anyhow::Result<()> {
        let Some(slot_idx) = self.attr.streams.iter().position(|s| *s == buf.stream_id) else {
            self.release_frame(&buf);
            anyhow::bail!(
                "ch {}: frame from stream {} is not bundled",
                self.ch_id,
                buf.stream_id
            );
        };

        if buf.stream_type == StreamType::Metadata && !buf.meta_valid {
            self.release_frame(&buf);
            return Ok(());
        }

        if !frame_idx_newer(buf.frame_idx, self.expected_frame_idx) {
            // older than what we are waiting for
            self.release_frame(&buf);
            return Ok(());
        }

        if self.attr.priority == Priority::Focused && !buf.focused {
            self.release_frame(&buf);
            return Ok(());
        }

        if let Some(pos) = self
            .bundles
            .iter()
            .position(|b| !b.matched && b.frame_idx == buf.frame_idx)
        {
            self.join_bundle(pos, slot_idx, buf);
        } else {
            self.insert_bundle(slot_idx, buf);
        }
        Ok(())
    }

    fn join_bundle(&mut self, pos: usize, slot_idx: usize, buf: FrameBuf) {
        let frame_idx = buf.frame_idx;
        {
            let bundle = &mut self.bundles[pos];
            if let Some(old) = bundle.slots[slot_idx].take() {
                log::error!(
                    "ch {}: stream {} already present in bundle {}",
                    self.ch_id,
                    old.stream_id,
                    frame_idx
                );
                self.release_frame(&old);
            }
            let bundle = &mut self.bundles[pos];
            bundle.slots[slot_idx] = Some(buf);
            bundle.matched = bundle.slots.iter().all(|s| s.is_some());
            if !bundle.matched {
                return;
            }
        }

        self.expected_frame_idx = frame_idx.wrapping_add(self.attr.post_frame_skip);
        self.match_cnt += 1;

        // a completed match obsoletes every older round still waiting
        let stale: Vec<usize> = self
            .bundles
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.matched && !frame_idx_newer(b.frame_idx, frame_idx))
            .map(|(i, _)| i)
            .collect();
        for i in stale.into_iter().rev() {
            if let Some(slot) = self.bundles.remove(i) {
                self.release_slot(slot);
            }
        }
    }

    fn insert_bundle(&mut self, slot_idx: usize, buf: FrameBuf) {
        let has_older_unmatched = self
            .bundles
            .iter()
            .any(|b| !b.matched && frame_idx_newer(buf.frame_idx, b.frame_idx));

        if self.unmatched_cnt() >= self.attr.max_unmatched_frames {
            if !has_older_unmatched {
                // incoming is older than everything buffered; drop it instead
                self.release_frame(&buf);
                return;
            }
            if let Some(oldest) = self
                .bundles
                .iter()
                .position(|b| !b.matched)
                .and_then(|i| self.bundles.remove(i))
            {
                log::debug!(
                    "ch {}: unmatched cap {} hit, evicting round {}",
                    self.ch_id,
                    self.attr.max_unmatched_frames,
                    oldest.frame_idx
                );
                self.release_slot(oldest);
            }
        }

        let mut slot = MatchSlot::new(buf.frame_idx, self.attr.streams.len());
        let frame_idx = buf.frame_idx;
        slot.slots[slot_idx] = Some(buf);
        if self.attr.streams.len() == 1 {
            slot.matched = true;
            self.expected_frame_idx = frame_idx.wrapping_add(self.attr.post_frame_skip);
            self.match_cnt += 1;
        }

        // keep sorted by frame index
        let insert_at = self
            .bundles
            .iter()
            .position(|b| frame_idx_newer(b.frame_idx, frame_idx) && b.frame_idx != frame_idx)
            .unwrap_or(self.bundles.len());
        self.bundles.insert(insert_at, slot);
    }

    /// Pop the head super-buffer if it is fully matched. A stalled unmatched
    /// head blocks newer matches so emission order stays non-decreasing.
    pub fn dequeue_matched(&mut self) -> Option<SuperBuf> {
        if !self.bundles.front()?.matched {
            return None;
        }
        let slot = self.bundles.pop_front()?;
        self.match_cnt -= 1;
        let frames: Vec<FrameBuf> = slot.slots.into_iter().flatten().collect();
        Some(SuperBuf::new(self.ch_id, frames, self.releaser.clone()))
    }

    /// Burst-mode overflow: release matched rounds beyond the water mark.
    pub fn purge_to_watermark(&mut self) {
        while self.match_cnt > self.attr.water_mark {
            match self.dequeue_matched() {
                Some(mut sb) => sb.release(),
                None => break,
            }
        }
    }

    /// Burst-mode request: keep only the newest `look_back` matches.
    pub fn skip_to_lookback(&mut self) {
        if self.attr.notify_mode == NotifyMode::Continuous {
            return;
        }
        while self.match_cnt > self.attr.look_back {
            match self.dequeue_matched() {
                Some(mut sb) => sb.release(),
                None => break,
            }
        }
    }

    /// Release every buffered round, matched or not.
    pub fn flush(&mut self) {
        for slot in self.bundles.drain(..).collect::<Vec<_>>() {
            self.release_slot(slot);
        }
        self.match_cnt = 0;
    }

    /// Release only the matched rounds, keeping partial ones in flight.
    pub fn flush_matched(&mut self) {
        let matched: Vec<usize> = self
            .bundles
            .iter()
            .enumerate()
            .filter(|(_, b)| b.matched)
            .map(|(i, _)| i)
            .collect();
        for i in matched.into_iter().rev() {
            if let Some(slot) = self.bundles.remove(i) {
                self.release_slot(slot);
            }
        }
        self.match_cnt = 0;
    }
}
