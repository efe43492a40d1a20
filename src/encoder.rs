use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use jpeg_encoder::{ColorType, Encoder};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type SessionId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorFormat {
    Gray,
    Rgb,
}

impl ColorFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ColorFormat::Gray => 1,
            ColorFormat::Rgb => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionParams {
    pub quality: u8,
    pub thumb_quality: u8,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            quality: 85,
            thumb_quality: 70,
        }
    }
}

/// One encode request. Source geometry describes the input payload; dst
/// geometry is what comes out after crop, scale and rotation.
#[derive(Clone, Debug)]
pub struct EncodeJobDesc {
    pub job_id: u32,
    pub src_width: u32,
    pub src_height: u32,
    pub dst_width: u32,
    pub dst_height: u32,
    pub crop: Option<CropRect>,
    /// Clockwise, degrees. Only 0/90/180/270 are meaningful.
    pub rotation: u32,
    pub color: ColorFormat,
    /// Requested thumbnail geometry; larger-than-main requests are clamped.
    pub thumb_width: u32,
    pub thumb_height: u32,
    pub data: Bytes,
}

impl EncodeJobDesc {
    pub fn new(job_id: u32, width: u32, height: u32, color: ColorFormat, data: Bytes) -> Self {
        Self {
            job_id,
            src_width: width,
            src_height: height,
            dst_width: width,
            dst_height: height,
            crop: None,
            rotation: 0,
            color,
            thumb_width: 0,
            thumb_height: 0,
            data,
        }
    }

    /// Thumbnail geometry may not exceed the main image.
    pub fn clamped_thumbnail(&self) -> (u32, u32) {
        (
            self.thumb_width.min(self.dst_width),
            self.thumb_height.min(self.dst_height),
        )
    }
}

#[derive(Debug)]
pub enum EncodeStatus {
    Done(Bytes),
    Aborted,
    Failed(String),
}

#[derive(Debug)]
pub struct EncodeEvent {
    pub session: SessionId,
    pub job_id: u32,
    pub status: EncodeStatus,
}

/// The still-image compressor behind the post-processor. Jobs run
/// asynchronously; results come back on the session's event channel.
///
/// At most one job per session is in flight at a time; the caller serializes.
pub trait ImageCodec: Send + Sync {
    fn create_session(
        &self,
        params: SessionParams,
        events: mpsc::UnboundedSender<EncodeEvent>,
    ) -> anyhow::Result<SessionId>;

    fn start_job(&self, session: SessionId, job: EncodeJobDesc) -> anyhow::Result<()>;

    /// Abort a job if it has not completed. Returns true when the job was
    /// still pending and its completion event is suppressed.
    fn abort_job(&self, session: SessionId, job_id: u32) -> bool;

    fn destroy_session(&self, session: SessionId);
}

struct SoftSession {
    params: SessionParams,
    events: mpsc::UnboundedSender<EncodeEvent>,
    /// job_id -> abort flag for jobs still in flight.
    active: HashMap<u32, Arc<AtomicBool>>,
}

/// Software JPEG compressor. Each job is pushed onto the blocking pool so the
/// async pipeline never stalls on pixel work.
pub struct SoftJpegCodec {
    next_session: AtomicU32,
    sessions: Arc<Mutex<HashMap<SessionId, SoftSession>>>,
}

impl SoftJpegCodec {
    pub fn new() -> Self {
        Self {
            next_session: AtomicU32::new(1),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for SoftJpegCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCodec for SoftJpegCodec {
    fn create_session(
        &self,
        params: SessionParams,
        events: mpsc::UnboundedSender<EncodeEvent>,
    ) -> anyhow::Result<SessionId> {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(
            id,
            SoftSession {
                params,
                events,
                active: HashMap::new(),
            },
        );
        log::debug!("jpeg session {} created", id);
        Ok(id)
    }

    fn start_job(&self, session: SessionId, job: EncodeJobDesc) -> anyhow::Result<()> {
        let (quality, events, aborted) = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            let s = sessions
                .get_mut(&session)
                .ok_or_else(|| anyhow::anyhow!("jpeg session {} not found", session))?;
            let flag = Arc::new(AtomicBool::new(false));
            s.active.insert(job.job_id, flag.clone());
            (s.params.quality, s.events.clone(), flag)
        };

        let sessions = self.sessions.clone();
        tokio::task::spawn_blocking(move || {
            let status = match encode_jpeg(&job, quality) {
                Ok(data) => EncodeStatus::Done(data),
                Err(e) => EncodeStatus::Failed(format!("{:#}", e)),
            };
            {
                let mut map = sessions.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(s) = map.get_mut(&session) {
                    s.active.remove(&job.job_id);
                }
            }
            if aborted.load(Ordering::SeqCst) {
                log::debug!("jpeg job {} finished after abort, dropping", job.job_id);
                return;
            }
            let _ = events.send(EncodeEvent {
                session,
                job_id: job.job_id,
                status,
            });
        });
        Ok(())
    }

    fn abort_job(&self, session: SessionId, job_id: u32) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(s) = sessions.get_mut(&session) else {
            return false;
        };
        match s.active.remove(&job_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn destroy_session(&self, session: SessionId) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = sessions.remove(&session) {
            for flag in s.active.values() {
                flag.store(true, Ordering::SeqCst);
            }
            log::debug!("jpeg session {} destroyed", session);
        }
    }
}

/// Crop, rotate, scale and compress one frame on the calling thread.
fn encode_jpeg(job: &EncodeJobDesc, quality: u8) -> anyhow::Result<Bytes> {
    let bpp = job.color.bytes_per_pixel();
    let expect = job.src_width as usize * job.src_height as usize * bpp;
    if job.data.len() < expect {
        anyhow::bail!(
            "payload too small: {} bytes for {}x{} {:?}",
            job.data.len(),
            job.src_width,
            job.src_height,
            job.color
        );
    }

    let (mut pixels, mut w, mut h) = match job.crop {
        Some(c) => crop(&job.data, job.src_width, c, bpp)?,
        None => (job.data[..expect].to_vec(), job.src_width, job.src_height),
    };

    if job.rotation % 360 != 0 {
        (pixels, w, h) = rotate(&pixels, w, h, job.rotation, bpp);
    }

    if (w, h) != (job.dst_width, job.dst_height) {
        pixels = scale(&pixels, w, h, job.dst_width, job.dst_height, bpp);
        w = job.dst_width;
        h = job.dst_height;
    }

    let color = match job.color {
        ColorFormat::Gray => ColorType::Luma,
        ColorFormat::Rgb => ColorType::Rgb,
    };
    let mut out = Vec::new();
    let encoder = Encoder::new(&mut out, quality);
    encoder
        .encode(&pixels, w as u16, h as u16, color)
        .map_err(|e| anyhow::anyhow!("jpeg encode failed: {}", e))?;
    Ok(Bytes::from(out))
}

fn crop(data: &[u8], src_width: u32, c: CropRect, bpp: usize) -> anyhow::Result<(Vec<u8>, u32, u32)> {
    let stride = src_width as usize * bpp;
    let row_len = c.width as usize * bpp;
    let mut out = Vec::with_capacity(row_len * c.height as usize);
    for row in c.top..c.top + c.height {
        let start = row as usize * stride + c.left as usize * bpp;
        let end = start + row_len;
        if end > data.len() {
            anyhow::bail!("crop rect exceeds source image");
        }
        out.extend_from_slice(&data[start..end]);
    }
    Ok((out, c.width, c.height))
}

fn rotate(data: &[u8], w: u32, h: u32, degrees: u32, bpp: usize) -> (Vec<u8>, u32, u32) {
    let (w, h) = (w as usize, h as usize);
    let px = |x: usize, y: usize| &data[(y * w + x) * bpp..(y * w + x) * bpp + bpp];
    let mut out = vec![0u8; data.len()];
    match degrees % 360 {
        90 => {
            for y in 0..h {
                for x in 0..w {
                    let (nx, ny) = (h - 1 - y, x);
                    out[(ny * h + nx) * bpp..(ny * h + nx) * bpp + bpp].copy_from_slice(px(x, y));
                }
            }
            (out, h as u32, w as u32)
        }
        180 => {
            for y in 0..h {
                for x in 0..w {
                    let (nx, ny) = (w - 1 - x, h - 1 - y);
                    out[(ny * w + nx) * bpp..(ny * w + nx) * bpp + bpp].copy_from_slice(px(x, y));
                }
            }
            (out, w as u32, h as u32)
        }
        270 => {
            for y in 0..h {
                for x in 0..w {
                    let (nx, ny) = (y, w - 1 - x);
                    out[(ny * h + nx) * bpp..(ny * h + nx) * bpp + bpp].copy_from_slice(px(x, y));
                }
            }
            (out, h as u32, w as u32)
        }
        _ => (data.to_vec(), w as u32, h as u32),
    }
}

/// Nearest-neighbor resample.
fn scale(data: &[u8], sw: u32, sh: u32, dw: u32, dh: u32, bpp: usize) -> Vec<u8> {
    let (sw, sh, dw, dh) = (sw as usize, sh as usize, dw as usize, dh as usize);
    let mut out = vec![0u8; dw * dh * bpp];
    for y in 0..dh {
        let sy = y * sh / dh;
        for x in 0..dw {
            let sx = x * sw / dw;
            let src = (sy * sw + sx) * bpp;
            let dst = (y * dw + x) * bpp;
            out[dst..dst + bpp].copy_from_slice(&data[src..src + bpp]);
        }
    }
    out
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
