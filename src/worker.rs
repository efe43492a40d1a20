use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-stage command handler. One command is processed at a time, in arrival
/// order, on the worker's own task.
pub trait Handler: Send + 'static {
    type Cmd: Send + 'static;

    fn handle(&mut self, cmd: Self::Cmd) -> impl Future<Output = ()> + Send;
}

/// A pipeline stage loop: a spawned task pulling commands from an unbounded
/// channel, gated by a cancellation token.
///
/// `send` is fire-and-forget (data-arrival notifications must not block the
/// producer). Operations that must be known-complete before the caller
/// proceeds put a `oneshot::Sender` inside the command and await it, the same
/// two synchronization levels the rest of the crate uses for `Stop`.
pub struct Worker<C> {
    name: String,
    tx: mpsc::UnboundedSender<C>,
    cancel: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<C: Send + 'static> Worker<C> {
    pub fn spawn<H>(name: &str, handler: H) -> Self
    where
        H: Handler<Cmd = C>,
    {
        Self::spawn_with(name, |_| handler)
    }

    /// Like [`Worker::spawn`], but the handler is built with a clone of its
    /// own command sender, for stages that feed completion events back to
    /// themselves.
    pub fn spawn_with<H, F>(name: &str, build: F) -> Self
    where
        H: Handler<Cmd = C>,
        F: FnOnce(mpsc::UnboundedSender<C>) -> H,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<C>();
        let mut handler = build(tx.clone());
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        break;
                    }
                    cmd = rx.recv() => {
                        match cmd {
                            Some(cmd) => handler.handle(cmd).await,
                            None => break,
                        }
                    }
                }
            }
            log::debug!("worker {} exited", task_name);
        });

        Self {
            name: name.to_string(),
            tx,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clone of the command sender, for callbacks that feed this worker.
    pub fn sender(&self) -> mpsc::UnboundedSender<C> {
        self.tx.clone()
    }

    /// Post a command without waiting for it to be processed.
    pub fn send(&self, cmd: C) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("worker {} is gone", self.name))
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Cancel the loop and join the task.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl<C> Drop for Worker<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    enum TestCmd {
        Add(u64),
        Report(oneshot::Sender<u64>),
    }

    struct Summer {
        total: u64,
    }

    impl Handler for Summer {
        type Cmd = TestCmd;

        async fn handle(&mut self, cmd: TestCmd) {
            match cmd {
                TestCmd::Add(n) => self.total += n,
                TestCmd::Report(tx) => {
                    let _ = tx.send(self.total);
                }
            }
        }
    }

    #[tokio::test]
    async fn commands_run_in_order() -> anyhow::Result<()> {
        let worker = Worker::spawn("summer", Summer { total: 0 });
        for n in 1..=10 {
            worker.send(TestCmd::Add(n))?;
        }
        let (tx, rx) = oneshot::channel();
        worker.send(TestCmd::Report(tx))?;
        assert_eq!(rx.await?, 55);
        worker.shutdown().await;
        assert!(worker.send(TestCmd::Add(1)).is_err());
        Ok(())
    }
}
