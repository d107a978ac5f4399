use tokio::sync::mpsc;

/// Message sent to subscribers of a [`crate::concurrency::ConcurrencyLimiter`] whenever a slot is
/// released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityAvailable;

pub(crate) trait Notify: Send + Sync {
    /// Returns `false` once the receiving side has gone away.
    fn notify(&self) -> bool;
}

impl Notify for mpsc::UnboundedSender<CapacityAvailable> {
    fn notify(&self) -> bool {
        match self.send(CapacityAvailable) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("Dropping closed capacity subscriber");
                false
            }
        }
    }
}

/// The set of listeners woken up when capacity frees up.
#[derive(Default)]
pub(crate) struct Listeners {
    inner: Vec<Box<dyn Notify>>,
}

impl Listeners {
    pub(crate) fn enroll(&mut self, notifier: Box<dyn Notify>) {
        self.inner.push(notifier);
    }

    pub(crate) fn notify_all(&mut self) {
        self.inner.retain(|notifier| notifier.notify());
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.inner.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn closed_subscribers_are_pruned() {
        let mut listeners = Listeners::default();
        let (open, mut open_rx) = mpsc::unbounded_channel();
        let (closed, closed_rx) = mpsc::unbounded_channel();
        drop(closed_rx);

        listeners.enroll(Box::new(open));
        listeners.enroll(Box::new(closed));
        listeners.notify_all();

        assert_eq!(listeners.len(), 1);
        assert_eq!(open_rx.try_recv(), Ok(CapacityAvailable));
    }
}
