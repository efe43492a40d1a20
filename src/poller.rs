use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;

pub type NotifyFn<E> = Box<dyn FnMut(u32, E) + Send>;

enum MuxCtl<E> {
    Add {
        id: u32,
        rx: mpsc::UnboundedReceiver<E>,
        notify: NotifyFn<E>,
        ack: oneshot::Sender<()>,
    },
    Remove {
        id: u32,
        ack: oneshot::Sender<()>,
    },
}

/// Multiplexes a dynamic set of event sources onto one dispatch task.
///
/// Each registered source is an unbounded receiver plus a per-source notify
/// callback invoked when an event is ready. Registration changes go over a
/// control channel so add/remove never races the dispatch loop; sources can
/// come and go at any time with no fixed cap.
pub struct EventMux<E> {
    name: String,
    ctl: mpsc::UnboundedSender<MuxCtl<E>>,
    cancel: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<E: Send + 'static> EventMux<E> {
    pub fn spawn(name: &str) -> Self {
        let (ctl, mut ctl_rx) = mpsc::unbounded_channel::<MuxCtl<E>>();
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut sources: StreamMap<u32, UnboundedReceiverStream<E>> = StreamMap::new();
            let mut notifies: HashMap<u32, NotifyFn<E>> = HashMap::new();
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        break;
                    }
                    ctl = ctl_rx.recv() => {
                        match ctl {
                            Some(MuxCtl::Add { id, rx, notify, ack }) => {
                                sources.insert(id, UnboundedReceiverStream::new(rx));
                                notifies.insert(id, notify);
                                let _ = ack.send(());
                            }
                            Some(MuxCtl::Remove { id, ack }) => {
                                sources.remove(&id);
                                notifies.remove(&id);
                                let _ = ack.send(());
                            }
                            None => break,
                        }
                    }
                    next = sources.next(), if !sources.is_empty() => {
                        match next {
                            Some((id, event)) => {
                                if let Some(notify) = notifies.get_mut(&id) {
                                    notify(id, event);
                                } else {
                                    log::warn!("{}: event for unregistered source {}", task_name, id);
                                }
                            }
                            // every remaining source hung up
                            None => continue,
                        }
                    }
                }
            }
            log::debug!("event mux {} exited", task_name);
        });

        Self {
            name: name.to_string(),
            ctl,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Register a source; resolves once the dispatch loop has picked it up.
    pub async fn add_source(
        &self,
        id: u32,
        rx: mpsc::UnboundedReceiver<E>,
        notify: NotifyFn<E>,
    ) -> anyhow::Result<()> {
        let (ack, done) = oneshot::channel();
        self.ctl
            .send(MuxCtl::Add { id, rx, notify, ack })
            .map_err(|_| anyhow::anyhow!("event mux {} is gone", self.name))?;
        done.await
            .map_err(|_| anyhow::anyhow!("event mux {} dropped add ack", self.name))
    }

    pub async fn remove_source(&self, id: u32) -> anyhow::Result<()> {
        let (ack, done) = oneshot::channel();
        self.ctl
            .send(MuxCtl::Remove { id, ack })
            .map_err(|_| anyhow::anyhow!("event mux {} is gone", self.name))?;
        done.await
            .map_err(|_| anyhow::anyhow!("event mux {} dropped remove ack", self.name))
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl<E> Drop for EventMux<E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
