use std::collections::VecDeque;
use std::sync::Mutex;

/// Mutex-serialized FIFO shared between pipeline stages.
///
/// Payload release is the payload's `Drop` impl (e.g. `SuperBuf` returns its
/// frames to the stream layer when dropped), so `flush` releases everything
/// still queued. `enqueue` never blocks and `dequeue` on empty returns `None`;
/// consumers pair the queue with a worker wake-up instead of blocking here.
///
/// Once closed, `enqueue` hands the payload back as `Err`: the caller keeps
/// ownership and must release it itself. This is the one result callers have
/// to check to avoid a leak.
pub struct BufQueue<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BufQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        // Poisoning only happens if a holder panicked; queue state is still
        // consistent (every op is a single push/pop), so keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append at the tail. Returns the payload on a closed queue.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let mut q = self.lock();
        if q.closed {
            return Err(item);
        }
        q.items.push_back(item);
        Ok(())
    }

    /// Insert at the head, ahead of everything already queued.
    pub fn enqueue_front(&self, item: T) -> Result<(), T> {
        let mut q = self.lock();
        if q.closed {
            return Err(item);
        }
        q.items.push_front(item);
        Ok(())
    }

    pub fn dequeue(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Remove and return the first item matching the predicate.
    pub fn dequeue_if(&self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let mut q = self.lock();
        let pos = q.items.iter().position(|item| pred(item))?;
        q.items.remove(pos)
    }

    /// Remove and return every item matching the predicate.
    pub fn drain_if(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut q = self.lock();
        let mut matched = Vec::new();
        let mut kept = VecDeque::with_capacity(q.items.len());
        for item in q.items.drain(..) {
            if pred(&item) {
                matched.push(item);
            } else {
                kept.push_back(item);
            }
        }
        q.items = kept;
        matched
    }

    /// Number of queued items matching the predicate.
    pub fn count_if(&self, mut pred: impl FnMut(&T) -> bool) -> usize {
        self.lock().items.iter().filter(|item| pred(item)).count()
    }

    /// Inspect the head without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.lock().items.front())
    }

    /// Drop (release) every remaining payload.
    pub fn flush(&self) {
        self.lock().items.clear();
    }

    /// Flush and reject all future enqueues.
    pub fn close(&self) {
        let mut q = self.lock();
        q.closed = true;
        q.items.clear();
    }

    /// Reopen after a close (pipeline restart).
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for BufQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = BufQueue::new();
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        q.enqueue_front(0).unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.dequeue(), Some(0));
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn dequeue_by_predicate() {
        let q = BufQueue::new();
        for i in 0..5 {
            q.enqueue(i).unwrap();
        }
        assert_eq!(q.dequeue_if(|v| *v == 3), Some(3));
        assert_eq!(q.dequeue_if(|v| *v == 3), None);
        assert_eq!(q.len(), 4);
        assert_eq!(q.drain_if(|v| *v % 2 == 0), vec![0, 2, 4]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn closed_queue_returns_payload() {
        let q = BufQueue::new();
        q.enqueue("a").unwrap();
        q.close();
        assert!(q.is_empty());
        assert_eq!(q.enqueue("b"), Err("b"));
        q.reopen();
        assert!(q.enqueue("c").is_ok());
    }

    #[test]
    fn flush_drops_payloads() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Payload(Arc<AtomicUsize>);
        impl Drop for Payload {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let q = BufQueue::new();
        for _ in 0..3 {
            assert!(q.enqueue(Payload(dropped.clone())).is_ok());
        }
        q.flush();
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }
}
