use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::frame::{FrameBuf, FrameReleaser, SuperBuf};

/// The transform device behind a reprocess channel. `run` executes on the
/// blocking pool; outputs are wrapped into a fresh super-buffer on the
/// channel's output side.
pub trait Reprocessor: Send + Sync {
    /// Device queue depth; the post-processor admits at most this many
    /// concurrent jobs.
    fn depth(&self) -> usize;

    fn run(&self, src: &SuperBuf) -> anyhow::Result<Vec<FrameBuf>>;
}

/// Completion record for one reprocess job. `src` is the input the job
/// consumed; `orig` is the frame at the head of the chain, carried through
/// every hop so it can be released exactly once at the end.
pub struct ReprocDone {
    pub job_id: u32,
    pub src: SuperBuf,
    pub orig: Option<SuperBuf>,
    pub result: anyhow::Result<SuperBuf>,
}

pub type ReprocDoneFn = Arc<dyn Fn(ReprocDone) + Send + Sync>;

/// One hop of the reprocess pipeline. Jobs run detached; completions are
/// pushed through `done`. A second channel whose `source_ch` equals this
/// channel's `out_ch` chains onto its output.
pub struct ReprocChannel {
    source_ch: u32,
    out_ch: u32,
    dev: Arc<dyn Reprocessor>,
    out_releaser: Arc<dyn FrameReleaser>,
    done: ReprocDoneFn,
    cancel: CancellationToken,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl ReprocChannel {
    pub fn new(
        source_ch: u32,
        out_ch: u32,
        dev: Arc<dyn Reprocessor>,
        out_releaser: Arc<dyn FrameReleaser>,
        done: ReprocDoneFn,
    ) -> Self {
        Self {
            source_ch,
            out_ch,
            dev,
            out_releaser,
            done,
            cancel: CancellationToken::new(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn source_ch(&self) -> u32 {
        self.source_ch
    }

    pub fn out_ch(&self) -> u32 {
        self.out_ch
    }

    pub fn queue_depth(&self) -> usize {
        self.dev.depth()
    }

    /// Kick one job. The source and carried original travel with the job;
    /// if the channel is stopped before the device finishes, both drop and
    /// their frames go back to the stream layer.
    pub fn submit(&self, job_id: u32, src: SuperBuf, orig: Option<SuperBuf>) {
        let dev = self.dev.clone();
        let out_ch = self.out_ch;
        let out_releaser = self.out_releaser.clone();
        let done = self.done.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let work = tokio::task::spawn_blocking(move || {
                let result = dev
                    .run(&src)
                    .map(|frames| SuperBuf::new(out_ch, frames, out_releaser));
                (src, result)
            });
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("reproc job {} cancelled", job_id);
                }
                joined = work => match joined {
                    Ok((src, result)) => done(ReprocDone {
                        job_id,
                        src,
                        orig,
                        result,
                    }),
                    Err(e) => log::error!("reproc job {} panicked: {}", job_id, e),
                },
            }
        });

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.retain(|h| !h.is_finished());
        jobs.push(handle);
    }

    /// Cancel outstanding jobs and wait for their tasks to wind down.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let jobs = {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *jobs)
        };
        for h in jobs {
            let _ = h.await;
        }
    }
}

impl Drop for ReprocChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "reprocess_test.rs"]
mod reprocess_test;
