use std::sync::Arc;

use bytes::Bytes;
use capture_bus::bundle::{BundleAttr, NotifyMode};
use capture_bus::channel::Channel;
use capture_bus::encoder::{ColorFormat, SoftJpegCodec};
use capture_bus::frame::{FrameBuf, NullReleaser, StreamType, SuperBuf};
use capture_bus::postproc::{Event, PostProc, PpConfig};
use capture_bus::registry::ChannelRegistry;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("capture_bus", log::LevelFilter::Debug)
        .init();
}

fn synthetic_frame(stream_id: u32, frame_idx: u32, width: u32, height: u32) -> FrameBuf {
    let mut px = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            px.push(((x ^ y) + frame_idx) as u8);
        }
    }
    let mut frame = FrameBuf::new(stream_id, frame_idx % 4, frame_idx, Bytes::from(px));
    frame.stream_type = if stream_id == 1 {
        StreamType::Snapshot
    } else {
        StreamType::Metadata
    };
    frame
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    const WIDTH: u32 = 320;
    const HEIGHT: u32 = 240;

    let cfg = PpConfig {
        width: WIDTH,
        height: HEIGHT,
        color: ColorFormat::Gray,
        ..PpConfig::default()
    };
    let (pp, mut events) = PostProc::new(cfg, Arc::new(SoftJpegCodec::new()), Vec::new());
    let pp = Arc::new(pp);
    pp.start().await?;

    let registry = Arc::new(ChannelRegistry::new());
    let ch_id = registry.alloc_id();
    let attr = BundleAttr {
        streams: vec![1, 2],
        notify_mode: NotifyMode::Continuous,
        ..BundleAttr::default()
    };
    log::info!("bundle policy: {}", serde_json::to_string(&attr)?);

    let pp_clone = pp.clone();
    let channel = Arc::new(Channel::new(
        ch_id,
        attr,
        Arc::new(NullReleaser),
        Box::new(move |sb: SuperBuf| {
            log::info!("matched frame_idx {} ({} frames)", sb.frame_idx, sb.num_frames());
            if let Err(e) = pp_clone.submit(sb) {
                log::warn!("submit: {:#}", e);
            }
        }),
    ));
    registry.add(channel.clone());

    // image stream plus metadata stream, five capture rounds
    for frame_idx in 0..5u32 {
        channel.on_stream_buffer(synthetic_frame(1, frame_idx, WIDTH, HEIGHT))?;
        channel.on_stream_buffer(synthetic_frame(2, frame_idx, 1, 1))?;
    }

    for _ in 0..5 {
        match events.recv().await {
            Some(Event::Encoded { data, job_id }) => {
                println!("encode job {}: {} bytes of jpeg", job_id, data.len());
            }
            Some(Event::Error { job_id }) => {
                log::error!("job {} failed", job_id);
            }
            Some(other) => log::warn!("unexpected event: {:?}", other),
            None => break,
        }
    }

    for ch in registry.clear() {
        ch.stop().await?;
    }
    pp.stop().await?;
    pp.shutdown().await;
    Ok(())
}
