use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::bundle::{BundleAttr, NotifyMode, Priority};
use crate::frame::{FrameBuf, FrameReleaser, SuperBuf};

use super::Channel;

struct CountingReleaser {
    released: AtomicUsize,
}

impl CountingReleaser {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            released: AtomicUsize::new(0),
        })
    }

    fn count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl FrameReleaser for CountingReleaser {
    fn release_buffer(&self, _stream_id: u32, _buf_idx: u32) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

fn attr(streams: &[u32], mode: NotifyMode) -> BundleAttr {
    BundleAttr {
        streams: streams.to_vec(),
        notify_mode: mode,
        water_mark: 2,
        look_back: 0,
        post_frame_skip: 0,
        max_unmatched_frames: 4,
        priority: Priority::Normal,
    }
}

fn frame(stream_id: u32, frame_idx: u32) -> FrameBuf {
    FrameBuf::new(stream_id, frame_idx % 8, frame_idx, Bytes::from_static(b"x"))
}

fn collecting_channel(
    id: u32,
    attr: BundleAttr,
    releaser: Arc<dyn FrameReleaser>,
) -> (Channel, mpsc::UnboundedReceiver<SuperBuf>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let ch = Channel::new(
        id,
        attr,
        releaser,
        Box::new(move |sb| {
            let _ = tx.send(sb);
        }),
    );
    (ch, rx)
}

async fn recv_match(rx: &mut mpsc::UnboundedReceiver<SuperBuf>) -> anyhow::Result<SuperBuf> {
    timeout(Duration::from_secs(2), rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("notify channel closed"))
}

#[tokio::test]
async fn continuous_mode_dispatches_each_match() -> anyhow::Result<()> {
    let releaser = CountingReleaser::new();
    let (ch, mut rx) = collecting_channel(1, attr(&[1, 2], NotifyMode::Continuous), releaser);

    for idx in [10u32, 11, 12] {
        ch.on_stream_buffer(frame(1, idx))?;
        ch.on_stream_buffer(frame(2, idx))?;
    }

    for idx in [10u32, 11, 12] {
        let sb = recv_match(&mut rx).await?;
        assert_eq!(sb.frame_idx, idx);
        assert_eq!(sb.num_frames(), 2);
    }

    ch.stop().await?;
    Ok(())
}

#[tokio::test]
async fn burst_mode_holds_matches_until_requested() -> anyhow::Result<()> {
    let releaser = CountingReleaser::new();
    let mut policy = attr(&[1, 2], NotifyMode::Burst);
    policy.look_back = 1;
    let (ch, mut rx) = collecting_channel(2, policy, releaser.clone());

    ch.on_stream_buffer(frame(1, 5))?;
    ch.on_stream_buffer(frame(2, 5))?;

    // nothing owed yet, so the match stays queued
    assert!(
        timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
        "burst match dispatched without a request"
    );

    // look_back keeps the most recent match for the request to consume
    ch.request_super_bufs(1)?;
    let sb = recv_match(&mut rx).await?;
    assert_eq!(sb.frame_idx, 5);

    ch.stop().await?;
    Ok(())
}

#[tokio::test]
async fn burst_request_skips_already_queued_matches() -> anyhow::Result<()> {
    let releaser = CountingReleaser::new();
    let (ch, mut rx) =
        collecting_channel(8, attr(&[1, 2], NotifyMode::Burst), releaser.clone());

    // a stale match sits in the queue; look_back 0 means the request only
    // wants frames captured from now on
    ch.on_stream_buffer(frame(1, 5))?;
    ch.on_stream_buffer(frame(2, 5))?;
    ch.request_super_bufs(1)?;

    ch.on_stream_buffer(frame(1, 6))?;
    ch.on_stream_buffer(frame(2, 6))?;
    let sb = recv_match(&mut rx).await?;
    assert_eq!(sb.frame_idx, 6);

    ch.stop().await?;
    Ok(())
}

#[tokio::test]
async fn burst_request_spans_future_matches() -> anyhow::Result<()> {
    let releaser = CountingReleaser::new();
    let (ch, mut rx) =
        collecting_channel(3, attr(&[1, 2], NotifyMode::Burst), releaser);

    // request arrives before any frames; the next two matches satisfy it
    ch.request_super_bufs(2)?;
    for idx in [7u32, 8, 9] {
        ch.on_stream_buffer(frame(1, idx))?;
        ch.on_stream_buffer(frame(2, idx))?;
    }

    assert_eq!(recv_match(&mut rx).await?.frame_idx, 7);
    assert_eq!(recv_match(&mut rx).await?.frame_idx, 8);
    assert!(
        timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
        "third match dispatched past the requested count"
    );

    ch.stop().await?;
    Ok(())
}

#[tokio::test]
async fn flush_releases_buffered_frames() -> anyhow::Result<()> {
    let releaser = CountingReleaser::new();
    let (ch, mut rx) = collecting_channel(
        4,
        attr(&[1, 2], NotifyMode::Burst),
        releaser.clone(),
    );

    // half-filled rounds only
    ch.on_stream_buffer(frame(1, 20))?;
    ch.on_stream_buffer(frame(1, 21))?;
    ch.flush(30)?;

    // a pre-flush index is now stale and goes straight back
    ch.on_stream_buffer(frame(2, 21))?;
    ch.stop().await?;

    assert_eq!(releaser.count(), 3);
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn reconfigure_with_same_policy_keeps_pending_rounds() -> anyhow::Result<()> {
    let releaser = CountingReleaser::new();
    let policy = attr(&[1, 2], NotifyMode::Continuous);
    let (ch, mut rx) = collecting_channel(5, policy.clone(), releaser.clone());

    ch.on_stream_buffer(frame(1, 40))?;
    ch.configure(policy).await?;
    assert_eq!(releaser.count(), 0, "identical policy must not flush");

    ch.on_stream_buffer(frame(2, 40))?;
    let sb = recv_match(&mut rx).await?;
    assert_eq!(sb.frame_idx, 40);

    ch.stop().await?;
    Ok(())
}

#[tokio::test]
async fn reconfigure_with_new_policy_flushes() -> anyhow::Result<()> {
    let releaser = CountingReleaser::new();
    let (ch, _rx) = collecting_channel(
        6,
        attr(&[1, 2], NotifyMode::Continuous),
        releaser.clone(),
    );

    ch.on_stream_buffer(frame(1, 50))?;
    ch.configure(attr(&[1, 2, 3], NotifyMode::Continuous)).await?;
    assert_eq!(releaser.count(), 1);

    ch.stop().await?;
    Ok(())
}

#[tokio::test]
async fn frames_flow_from_mux_sources_into_the_matcher() -> anyhow::Result<()> {
    use crate::poller::EventMux;

    let releaser = CountingReleaser::new();
    let (ch, mut rx) = collecting_channel(9, attr(&[1, 2], NotifyMode::Continuous), releaser);

    let mux = EventMux::spawn("streams");
    let (tx_1, rx_1) = mpsc::unbounded_channel();
    let (tx_2, rx_2) = mpsc::unbounded_channel();
    ch.attach_source(&mux, 1, rx_1).await?;
    ch.attach_source(&mux, 2, rx_2).await?;

    tx_1.send(frame(1, 3)).ok();
    tx_2.send(frame(2, 3)).ok();

    let sb = recv_match(&mut rx).await?;
    assert_eq!(sb.frame_idx, 3);
    assert_eq!(sb.num_frames(), 2);

    mux.shutdown().await;
    ch.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stop_releases_everything_and_rejects_new_frames() -> anyhow::Result<()> {
    let releaser = CountingReleaser::new();
    let (ch, _rx) = collecting_channel(
        7,
        attr(&[1, 2], NotifyMode::Burst),
        releaser.clone(),
    );

    ch.on_stream_buffer(frame(1, 60))?;
    ch.on_stream_buffer(frame(2, 60))?;
    ch.on_stream_buffer(frame(1, 61))?;
    ch.stop().await?;

    assert_eq!(releaser.count(), 3);
    assert!(ch.on_stream_buffer(frame(2, 61)).is_err());
    Ok(())
}
