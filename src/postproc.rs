use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::encoder::{
    ColorFormat, CropRect, EncodeEvent, EncodeJobDesc, EncodeStatus, ImageCodec, SessionId,
    SessionParams,
};
use crate::frame::{FrameReleaser, SuperBuf};
use crate::queue::BufQueue;
use crate::reprocess::{ReprocChannel, ReprocDone, Reprocessor};
use crate::save::SaveWorker;
use crate::worker::{Handler, Worker};

/// Still-pipeline output. Single consumer; payload ownership transfers with
/// the event.
#[derive(Debug)]
pub enum Event {
    Encoded { data: Bytes, job_id: u32 },
    Saved { path: PathBuf, job_id: u32 },
    Raw { frame: SuperBuf },
    Error { job_id: u32 },
}

/// Static encode parameters for the pipeline. Frame geometry comes from the
/// stream configuration, not from individual buffers.
#[derive(Clone)]
pub struct PpConfig {
    pub width: u32,
    pub height: u32,
    pub color: ColorFormat,
    pub rotation: u32,
    pub crop: Option<CropRect>,
    pub thumb_width: u32,
    pub thumb_height: u32,
    pub session: SessionParams,
    /// Route submitted frames through a reprocess hop before encoding.
    pub needs_reprocess: bool,
    /// Whether the pipeline owns the original frame at end of chain. False
    /// means the event consumer keeps it and we only forget our handle.
    pub release_orig: bool,
    /// Burst capture: write encodes to `save_dir` instead of emitting them.
    pub save_mode: bool,
    pub save_dir: PathBuf,
}

impl Default for PpConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            color: ColorFormat::Rgb,
            rotation: 0,
            crop: None,
            thumb_width: 0,
            thumb_height: 0,
            session: SessionParams::default(),
            needs_reprocess: false,
            release_orig: true,
            save_mode: false,
            save_dir: std::env::temp_dir(),
        }
    }
}

/// Declares one reprocess hop; channels chain when one's `source_ch` equals
/// another's `out_ch`.
pub struct ReprocSpec {
    pub source_ch: u32,
    pub out_ch: u32,
    pub dev: Arc<dyn Reprocessor>,
    pub out_releaser: Arc<dyn FrameReleaser>,
}

/// An input frame plus the head-of-chain original it carries.
struct PpEntry {
    frame: SuperBuf,
    orig: Option<SuperBuf>,
}

struct OngoingReproc {
    job_id: u32,
    source_ch: u32,
}

struct OngoingEncode {
    job_id: u32,
    frame: SuperBuf,
    orig: Option<SuperBuf>,
}

struct Queues {
    input_reproc: BufQueue<PpEntry>,
    input_raw: BufQueue<SuperBuf>,
    input_encode: BufQueue<PpEntry>,
    ongoing_reproc: BufQueue<OngoingReproc>,
    ongoing_encode: BufQueue<OngoingEncode>,
}

impl Queues {
    fn new() -> Self {
        Self {
            input_reproc: BufQueue::new(),
            input_raw: BufQueue::new(),
            input_encode: BufQueue::new(),
            ongoing_reproc: BufQueue::new(),
            ongoing_encode: BufQueue::new(),
        }
    }

    fn flush_all(&self) {
        self.input_reproc.flush();
        self.input_raw.flush();
        self.input_encode.flush();
        self.ongoing_reproc.flush();
        self.ongoing_encode.flush();
    }
}

pub enum PpCmd {
    Start { done: oneshot::Sender<()> },
    Stop { done: oneshot::Sender<()> },
    DoNextJob,
    EncodeEvt(EncodeEvent),
    ReprocDone(ReprocDone),
}

struct PpHandler {
    cfg: PpConfig,
    codec: Arc<dyn ImageCodec>,
    codec_tx: mpsc::UnboundedSender<EncodeEvent>,
    queues: Arc<Queues>,
    reprocs: Vec<Arc<ReprocChannel>>,
    events: mpsc::UnboundedSender<Event>,
    session: Option<SessionId>,
    save: Option<SaveWorker>,
    active: bool,
    next_job_id: u32,
    encode_inflight: Option<u32>,
}

impl PpHandler {
    fn alloc_job_id(&mut self) -> u32 {
        let id = self.next_job_id;
        self.next_job_id = self.next_job_id.wrapping_add(1);
        id
    }

    fn emit(&self, evt: Event) {
        if self.events.send(evt).is_err() {
            log::warn!("postproc event consumer gone");
        }
    }

    fn ensure_session(&mut self) -> anyhow::Result<SessionId> {
        if let Some(id) = self.session {
            return Ok(id);
        }
        let id = self
            .codec
            .create_session(self.cfg.session.clone(), self.codec_tx.clone())?;
        self.session = Some(id);
        Ok(id)
    }

    fn build_job_desc(&self, job_id: u32, data: Bytes) -> EncodeJobDesc {
        let mut job = EncodeJobDesc::new(job_id, self.cfg.width, self.cfg.height, self.cfg.color, data);
        job.crop = self.cfg.crop;
        job.rotation = self.cfg.rotation;
        if self.cfg.rotation % 180 == 90 {
            job.dst_width = self.cfg.height;
            job.dst_height = self.cfg.width;
        }
        job.thumb_width = self.cfg.thumb_width;
        job.thumb_height = self.cfg.thumb_height;
        job
    }

    /// One scheduling pass, in priority order: encode, raw, reprocess. A
    /// single job per pass keeps stop latency bounded.
    fn do_next_job(&mut self) {
        if !self.active {
            // late wakes after stop; queues were closed and flushed
            self.queues.flush_all();
            return;
        }

        // a failed start emits its error and the next queued entry gets a turn
        while self.encode_inflight.is_none() {
            let Some(entry) = self.queues.input_encode.dequeue() else {
                break;
            };
            self.start_encode(entry);
        }

        if let Some(frame) = self.queues.input_raw.dequeue() {
            self.emit(Event::Raw { frame });
        }

        // throttle against the device queue depth; a full channel just keeps
        // the entry queued for a later pass
        let reprocs = self.reprocs.clone();
        let ongoing = &self.queues.ongoing_reproc;
        let admitted = self.queues.input_reproc.dequeue_if(|entry| {
            reprocs
                .iter()
                .find(|rc| rc.source_ch() == entry.frame.ch_id)
                .is_some_and(|rc| {
                    ongoing.count_if(|j| j.source_ch == rc.source_ch()) < rc.queue_depth()
                })
        });
        if let Some(entry) = admitted {
            self.start_reprocess(entry);
        }
    }

    fn start_encode(&mut self, entry: PpEntry) {
        let job_id = self.alloc_job_id();
        let Some(data) = entry.frame.main_frame().map(|f| f.data.clone()) else {
            log::error!("encode job {}: no image frame in super-buffer", job_id);
            self.emit(Event::Error { job_id });
            return;
        };

        let session = match self.ensure_session() {
            Ok(s) => s,
            Err(e) => {
                log::error!("encode session: {:#}", e);
                self.emit(Event::Error { job_id });
                return;
            }
        };

        let desc = self.build_job_desc(job_id, data);
        if let Err(e) = self.codec.start_job(session, desc) {
            log::error!("encode job {}: {:#}", job_id, e);
            self.emit(Event::Error { job_id });
            return;
        }

        log::debug!("encode job {} started (frame_idx {})", job_id, entry.frame.frame_idx);
        self.encode_inflight = Some(job_id);
        if let Err(job) = self.queues.ongoing_encode.enqueue(OngoingEncode {
            job_id,
            frame: entry.frame,
            orig: entry.orig,
        }) {
            // closed mid-stop; dropping the job releases its frames
            drop(job);
            self.encode_inflight = None;
        }
    }

    fn start_reprocess(&mut self, entry: PpEntry) {
        let job_id = self.alloc_job_id();
        let Some(rc) = self
            .reprocs
            .iter()
            .find(|rc| rc.source_ch() == entry.frame.ch_id)
            .cloned()
        else {
            log::error!("reproc job {}: no channel for ch {}", job_id, entry.frame.ch_id);
            self.emit(Event::Error { job_id });
            return;
        };

        if self
            .queues
            .ongoing_reproc
            .enqueue(OngoingReproc {
                job_id,
                source_ch: rc.source_ch(),
            })
            .is_err()
        {
            return;
        }
        log::debug!("reproc job {} on ch {} -> {}", job_id, rc.source_ch(), rc.out_ch());
        rc.submit(job_id, entry.frame, entry.orig);
    }

    fn on_reproc_done(&mut self, done: ReprocDone) {
        if !self.active {
            // completion raced the stop; payloads release on drop
            return;
        }
        let known = self
            .queues
            .ongoing_reproc
            .dequeue_if(|j| j.job_id == done.job_id);
        if known.is_none() {
            log::error!("reproc job {} has no ongoing record", done.job_id);
            self.emit(Event::Error { job_id: done.job_id });
            self.do_next_job();
            return;
        }

        let out = match done.result {
            Ok(out) => out,
            Err(e) => {
                // the dequeued record freed a device slot; schedule whatever
                // it was holding back before bailing
                log::error!("reproc job {} failed: {:#}", done.job_id, e);
                self.emit(Event::Error { job_id: done.job_id });
                self.do_next_job();
                return;
            }
        };

        // provenance: the head-of-chain frame rides along untouched, any
        // intermediate is released here
        let orig = match done.orig {
            Some(orig) => {
                drop(done.src);
                Some(orig)
            }
            None => Some(done.src),
        };

        let entry = PpEntry { frame: out, orig };
        let next_hop = self
            .reprocs
            .iter()
            .any(|rc| rc.source_ch() == entry.frame.ch_id);
        let res = if next_hop {
            self.queues.input_reproc.enqueue(entry)
        } else {
            self.queues.input_encode.enqueue(entry)
        };
        if res.is_err() {
            log::debug!("reproc job {} output dropped, queues closed", done.job_id);
        }
        self.do_next_job();
    }

    fn on_encode_evt(&mut self, evt: EncodeEvent) {
        let Some(job) = self
            .queues
            .ongoing_encode
            .dequeue_if(|j| j.job_id == evt.job_id)
        else {
            log::debug!("encode evt for unknown job {}, dropping", evt.job_id);
            return;
        };
        if self.encode_inflight == Some(evt.job_id) {
            self.encode_inflight = None;
        }

        let OngoingEncode { job_id, frame, orig } = job;
        match evt.status {
            EncodeStatus::Done(data) => {
                drop(frame);
                self.settle_orig(orig);
                if let Some(save) = self.save.as_ref().filter(|_| self.cfg.save_mode) {
                    if let Err(e) = save.save(job_id, data) {
                        log::error!("save handoff: {:#}", e);
                        self.emit(Event::Error { job_id });
                    }
                } else {
                    self.emit(Event::Encoded { data, job_id });
                }
            }
            EncodeStatus::Aborted => {
                drop(frame);
                self.settle_orig(orig);
                log::debug!("encode job {} aborted", job_id);
            }
            EncodeStatus::Failed(msg) => {
                drop(frame);
                self.settle_orig(orig);
                log::error!("encode job {} failed: {}", job_id, msg);
                self.emit(Event::Error { job_id });
            }
        }
        self.do_next_job();
    }

    fn settle_orig(&self, orig: Option<SuperBuf>) {
        let Some(mut orig) = orig else { return };
        if self.cfg.release_orig {
            orig.release();
        } else {
            orig.forget();
        }
    }

    fn start(&mut self) {
        if self.active {
            return;
        }
        self.queues.input_reproc.reopen();
        self.queues.input_raw.reopen();
        self.queues.input_encode.reopen();
        self.queues.ongoing_reproc.reopen();
        self.queues.ongoing_encode.reopen();
        if self.cfg.save_mode && self.save.is_none() {
            self.save = Some(SaveWorker::spawn(
                self.cfg.save_dir.clone(),
                self.events.clone(),
            ));
        }
        self.active = true;
        log::info!("postproc started");
    }

    async fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        if let Some(save) = self.save.take() {
            save.stop().await;
        }

        // abort whatever the codec still holds; completions for these jobs
        // are suppressed, their frames release on drop below
        if let Some(session) = self.session.take() {
            for job in self.queues.ongoing_encode.drain_if(|_| true) {
                self.codec.abort_job(session, job.job_id);
                drop(job.frame);
                self.settle_orig(job.orig);
            }
            self.codec.destroy_session(session);
        }
        self.encode_inflight = None;

        for rc in &self.reprocs {
            rc.stop().await;
        }

        self.queues.input_reproc.close();
        self.queues.input_raw.close();
        self.queues.input_encode.close();
        self.queues.ongoing_reproc.close();
        self.queues.ongoing_encode.close();
        self.queues.flush_all();
        log::info!("postproc stopped");
    }
}

impl Handler for PpHandler {
    type Cmd = PpCmd;

    async fn handle(&mut self, cmd: PpCmd) {
        match cmd {
            PpCmd::Start { done } => {
                self.start();
                let _ = done.send(());
            }
            PpCmd::Stop { done } => {
                self.stop().await;
                let _ = done.send(());
            }
            PpCmd::DoNextJob => self.do_next_job(),
            PpCmd::EncodeEvt(evt) => self.on_encode_evt(evt),
            PpCmd::ReprocDone(done) => self.on_reproc_done(done),
        }
    }
}

/// The staged still pipeline: reprocess hops, one-at-a-time encode, raw
/// passthrough and the burst save path, driven by a single data worker.
pub struct PostProc {
    cfg_needs_reprocess: bool,
    reproc_srcs: Vec<u32>,
    queues: Arc<Queues>,
    worker: Worker<PpCmd>,
}

impl PostProc {
    /// Builds the pipeline. Returns the event stream the consumer drains
    /// alongside the handle.
    pub fn new(
        cfg: PpConfig,
        codec: Arc<dyn ImageCodec>,
        reproc_specs: Vec<ReprocSpec>,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (codec_tx, mut codec_rx) = mpsc::unbounded_channel::<EncodeEvent>();
        let queues = Arc::new(Queues::new());
        // queues open on start, not construction
        queues.input_reproc.close();
        queues.input_raw.close();
        queues.input_encode.close();
        queues.ongoing_reproc.close();
        queues.ongoing_encode.close();

        let needs_reprocess = cfg.needs_reprocess;
        let reproc_srcs: Vec<u32> = reproc_specs.iter().map(|s| s.source_ch).collect();
        let q = queues.clone();
        let worker = Worker::spawn_with("postproc", move |self_tx| {
            let reprocs: Vec<Arc<ReprocChannel>> = reproc_specs
                .into_iter()
                .map(|spec| {
                    let tx = self_tx.clone();
                    Arc::new(ReprocChannel::new(
                        spec.source_ch,
                        spec.out_ch,
                        spec.dev,
                        spec.out_releaser,
                        Arc::new(move |done| {
                            let _ = tx.send(PpCmd::ReprocDone(done));
                        }),
                    ))
                })
                .collect();

            // codec completions come in on their own channel; fold them into
            // the command stream
            let evt_tx = self_tx.clone();
            tokio::spawn(async move {
                while let Some(evt) = codec_rx.recv().await {
                    if evt_tx.send(PpCmd::EncodeEvt(evt)).is_err() {
                        break;
                    }
                }
            });

            PpHandler {
                cfg,
                codec,
                codec_tx,
                queues: q,
                reprocs,
                events: events_tx,
                session: None,
                save: None,
                active: false,
                next_job_id: 1,
                encode_inflight: None,
            }
        });

        let pp = Self {
            cfg_needs_reprocess: needs_reprocess,
            reproc_srcs,
            queues,
            worker,
        };
        (pp, events_rx)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let (done, wait) = oneshot::channel();
        self.worker.send(PpCmd::Start { done })?;
        wait.await
            .map_err(|_| anyhow::anyhow!("postproc start dropped"))
    }

    /// Synchronous stop: when this returns, in-flight jobs are aborted and
    /// every queued payload has been released.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let (done, wait) = oneshot::channel();
        self.worker.send(PpCmd::Stop { done })?;
        wait.await
            .map_err(|_| anyhow::anyhow!("postproc stop dropped"))
    }

    /// Hand a matched super-buffer to the pipeline. Routed to the reprocess
    /// hop or straight to encode per configuration; a stopped pipeline
    /// releases the frame immediately.
    pub fn submit(&self, frame: SuperBuf) -> anyhow::Result<()> {
        let entry = PpEntry { frame, orig: None };
        let res = if self.cfg_needs_reprocess && self.reproc_srcs.contains(&entry.frame.ch_id) {
            self.queues.input_reproc.enqueue(entry)
        } else {
            self.queues.input_encode.enqueue(entry)
        };
        if res.is_err() {
            anyhow::bail!("postproc not running, frame released");
        }
        self.worker.send(PpCmd::DoNextJob)
    }

    /// Raw passthrough: the frame is surfaced as `Event::Raw` without
    /// touching the encoder.
    pub fn submit_raw(&self, frame: SuperBuf) -> anyhow::Result<()> {
        if self.queues.input_raw.enqueue(frame).is_err() {
            anyhow::bail!("postproc not running, frame released");
        }
        self.worker.send(PpCmd::DoNextJob)
    }

    /// Tear the worker down. Call after `stop`.
    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
    }

    #[cfg(test)]
    fn inject(&self, cmd: PpCmd) -> anyhow::Result<()> {
        self.worker.send(cmd)
    }
}

#[cfg(test)]
#[path = "postproc_test.rs"]
mod postproc_test;
