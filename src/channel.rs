use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::bundle::{BundleAttr, MatchQueue, NotifyMode};
use crate::frame::{FrameBuf, FrameReleaser, SuperBuf};
use crate::poller::EventMux;
use crate::worker::{Handler, Worker};

/// Client callback receiving matched super-buffers. Runs on the channel's
/// notify worker, never on the matcher itself.
pub type SuperBufCb = Box<dyn FnMut(SuperBuf) + Send>;

pub enum ChannelCmd {
    /// One captured frame from a bundled stream.
    StreamBuf(FrameBuf),
    /// Burst-mode pull: dispatch up to `count` matches, newest-first window.
    RequestSuperBufs { count: usize },
    CancelRequest,
    /// Drop everything buffered and fast-forward the expected index.
    Flush { to_idx: u32 },
    ConfigNotify(NotifyMode),
    Configure {
        attr: BundleAttr,
        done: oneshot::Sender<()>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

enum NotifyCmd {
    Dispatch(SuperBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BundleState {
    /// Configured, waiting for frames.
    Active,
    /// Frames accumulating for the current expected index.
    Matching,
    /// Flush/stop requested; buffered rounds being released.
    Draining,
}

struct NotifyHandler {
    cb: SuperBufCb,
}

impl Handler for NotifyHandler {
    type Cmd = NotifyCmd;

    async fn handle(&mut self, cmd: NotifyCmd) {
        match cmd {
            NotifyCmd::Dispatch(sb) => (self.cb)(sb),
        }
    }
}

struct MatcherHandler {
    ch_id: u32,
    queue: MatchQueue,
    releaser: Arc<dyn FrameReleaser>,
    notify_tx: mpsc::UnboundedSender<NotifyCmd>,
    state: BundleState,
    /// Burst mode: matches still owed to the client.
    pending_cnt: usize,
}

impl MatcherHandler {
    fn set_state(&mut self, next: BundleState) {
        if self.state != next {
            log::debug!("ch {}: {:?} -> {:?}", self.ch_id, self.state, next);
            self.state = next;
        }
    }

    fn dispatch(&mut self, sb: SuperBuf) {
        // a failed send drops the super-buffer, which releases its frames
        if self.notify_tx.send(NotifyCmd::Dispatch(sb)).is_err() {
            log::warn!("ch {}: notify worker gone, releasing match", self.ch_id);
        }
    }

    /// Dispatch tail run after every command: emit while something is owed
    /// (or always, in continuous mode), then release burst overflow beyond
    /// the water mark.
    fn drive_dispatch(&mut self) {
        let mode = self.queue.attr().notify_mode;
        while self.pending_cnt > 0 || mode == NotifyMode::Continuous {
            let Some(sb) = self.queue.dequeue_matched() else {
                break;
            };
            if mode == NotifyMode::Burst {
                self.pending_cnt -= 1;
            }
            self.dispatch(sb);
        }
        if mode == NotifyMode::Burst && self.pending_cnt == 0 {
            self.queue.purge_to_watermark();
        }

        if self.queue.unmatched_cnt() > 0 {
            self.set_state(BundleState::Matching);
        } else if self.state != BundleState::Draining {
            self.set_state(BundleState::Active);
        }
    }
}

impl Handler for MatcherHandler {
    type Cmd = ChannelCmd;

    async fn handle(&mut self, cmd: ChannelCmd) {
        match cmd {
            ChannelCmd::StreamBuf(frame) => {
                if let Err(e) = self.queue.feed(frame) {
                    log::error!("ch {}: {:#}", self.ch_id, e);
                    return;
                }
            }
            ChannelCmd::RequestSuperBufs { count } => {
                self.pending_cnt = count;
                self.queue.skip_to_lookback();
            }
            ChannelCmd::CancelRequest => {
                self.pending_cnt = 0;
            }
            ChannelCmd::Flush { to_idx } => {
                self.set_state(BundleState::Draining);
                self.queue.set_expected(to_idx);
                self.queue.flush();
                self.set_state(BundleState::Active);
            }
            ChannelCmd::ConfigNotify(mode) => {
                self.queue.set_notify_mode(mode);
            }
            ChannelCmd::Configure { attr, done } => {
                // re-applying the same policy must not disturb matching state
                if *self.queue.attr() != attr {
                    self.queue.flush();
                    self.queue = MatchQueue::new(self.ch_id, attr, self.releaser.clone());
                    self.pending_cnt = 0;
                }
                let _ = done.send(());
            }
            ChannelCmd::Stop { done } => {
                self.set_state(BundleState::Draining);
                self.pending_cnt = 0;
                self.queue.flush();
                let _ = done.send(());
                return;
            }
        }
        self.drive_dispatch();
    }
}

/// One capture channel: owns the matching queue plus a matcher worker and a
/// notify worker, so client callbacks can never stall frame matching.
pub struct Channel {
    id: u32,
    matcher: Worker<ChannelCmd>,
    notifier: Worker<NotifyCmd>,
}

impl Channel {
    pub fn new(id: u32, attr: BundleAttr, releaser: Arc<dyn FrameReleaser>, cb: SuperBufCb) -> Self {
        let notifier = Worker::spawn(&format!("ch{}-notify", id), NotifyHandler { cb });
        let matcher = Worker::spawn(
            &format!("ch{}-match", id),
            MatcherHandler {
                ch_id: id,
                queue: MatchQueue::new(id, attr, releaser.clone()),
                releaser,
                notify_tx: notifier.sender(),
                state: BundleState::Active,
                pending_cnt: 0,
            },
        );
        Self {
            id,
            matcher,
            notifier,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Per-captured-frame entry point from the stream layer.
    pub fn on_stream_buffer(&self, frame: FrameBuf) -> anyhow::Result<()> {
        self.matcher.send(ChannelCmd::StreamBuf(frame))
    }

    /// Route a stream's frame source through an event multiplexer into this
    /// channel's matcher.
    pub async fn attach_source(
        &self,
        mux: &EventMux<FrameBuf>,
        stream_id: u32,
        rx: mpsc::UnboundedReceiver<FrameBuf>,
    ) -> anyhow::Result<()> {
        let tx = self.matcher.sender();
        mux.add_source(
            stream_id,
            rx,
            Box::new(move |_, frame| {
                let _ = tx.send(ChannelCmd::StreamBuf(frame));
            }),
        )
        .await
    }

    /// Re-apply or replace the bundling policy. Identical policies are a
    /// no-op; a changed policy flushes buffered rounds first.
    pub async fn configure(&self, attr: BundleAttr) -> anyhow::Result<()> {
        let (done, wait) = oneshot::channel();
        self.matcher.send(ChannelCmd::Configure { attr, done })?;
        wait.await
            .map_err(|_| anyhow::anyhow!("ch {}: configure dropped", self.id))
    }

    pub fn request_super_bufs(&self, count: usize) -> anyhow::Result<()> {
        self.matcher.send(ChannelCmd::RequestSuperBufs { count })
    }

    pub fn cancel_super_buf_request(&self) -> anyhow::Result<()> {
        self.matcher.send(ChannelCmd::CancelRequest)
    }

    pub fn flush(&self, to_idx: u32) -> anyhow::Result<()> {
        self.matcher.send(ChannelCmd::Flush { to_idx })
    }

    pub fn config_notify_mode(&self, mode: NotifyMode) -> anyhow::Result<()> {
        self.matcher.send(ChannelCmd::ConfigNotify(mode))
    }

    /// Synchronous stop: buffered rounds are released before this returns.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let (done, wait) = oneshot::channel();
        self.matcher.send(ChannelCmd::Stop { done })?;
        wait.await
            .map_err(|_| anyhow::anyhow!("ch {}: stop dropped", self.id))?;
        self.matcher.shutdown().await;
        self.notifier.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod channel_test;
