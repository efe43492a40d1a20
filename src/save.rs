use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::postproc::Event;
use crate::worker::{Handler, Worker};

pub enum SaveCmd {
    Save { job_id: u32, data: Bytes },
}

struct SaveHandler {
    dir: PathBuf,
    counter: u32,
    events: mpsc::UnboundedSender<Event>,
}

impl Handler for SaveHandler {
    type Cmd = SaveCmd;

    async fn handle(&mut self, cmd: SaveCmd) {
        let SaveCmd::Save { job_id, data } = cmd;
        let path = self.dir.join(format!("img_{}.jpg", self.counter));
        match tokio::fs::write(&path, &data).await {
            Ok(()) => {
                self.counter += 1;
                log::info!("saved {} ({} bytes)", path.display(), data.len());
                let _ = self.events.send(Event::Saved { path, job_id });
            }
            Err(e) => {
                log::error!("save {} failed: {}", path.display(), e);
                let _ = self.events.send(Event::Error { job_id });
            }
        }
    }
}

/// Burst-mode side-path: writes finished encodes to disk instead of handing
/// the payload back. Stopping discards queued writes; a file is either fully
/// written or absent.
pub struct SaveWorker {
    worker: Worker<SaveCmd>,
}

impl SaveWorker {
    pub fn spawn(dir: PathBuf, events: mpsc::UnboundedSender<Event>) -> Self {
        let worker = Worker::spawn(
            "jpeg-save",
            SaveHandler {
                dir,
                counter: 0,
                events,
            },
        );
        Self { worker }
    }

    pub fn save(&self, job_id: u32, data: Bytes) -> anyhow::Result<()> {
        self.worker.send(SaveCmd::Save { job_id, data })
    }

    pub async fn stop(&self) {
        self.worker.shutdown().await;
    }
}

#[cfg(test)]
#[path = "save_test.rs"]
mod save_test;
