//! Local Request Scheduler (spec §4.7): a single-priority FIFO serializing
//! user-initiated commands and rekey-timer firings behind one queue. The
//! IKE Session dequeues only while `Idle`; rekey timers enqueue but never
//! preempt the head.

use std::collections::VecDeque;

use crate::network::ike::config::ChildSessionConfig;

/// One queued user command or timer firing.
#[derive(Debug)]
pub enum LocalRequestKind {
    CreateChild { config: ChildSessionConfig },
    DeleteChild { local_spi: u32 },
    RekeyChild { local_spi: u32 },
    RekeyIke,
    DeleteIke,
    Informational { notify_type: u16 },
}

/// A queue entry. `child_spi_tag` lets [`LocalRequestScheduler::cancel_for_spi`]
/// discard stale rekey-timer firings for a Child SA that was rekeyed or
/// deleted before its timer fired (spec §4.7).
#[derive(Debug)]
pub struct LocalRequest {
    pub kind: LocalRequestKind,
    pub child_spi_tag: Option<u32>,
}

impl LocalRequest {
    pub fn for_child(kind: LocalRequestKind, local_spi: u32) -> Self {
        LocalRequest {
            kind,
            child_spi_tag: Some(local_spi),
        }
    }

    pub fn ike_level(kind: LocalRequestKind) -> Self {
        LocalRequest {
            kind,
            child_spi_tag: None,
        }
    }
}

#[derive(Default)]
pub struct LocalRequestScheduler {
    queue: VecDeque<LocalRequest>,
}

impl LocalRequestScheduler {
    pub fn new() -> Self {
        LocalRequestScheduler::default()
    }

    pub fn enqueue(&mut self, request: LocalRequest) {
        self.queue.push_back(request);
    }

    /// Dequeues the head only when the IKE Session reports itself `Idle`;
    /// otherwise the queue is left untouched (spec §4.7 invariant).
    pub fn dequeue_if_idle(&mut self, session_is_idle: bool) -> Option<LocalRequest> {
        if session_is_idle {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Removes any queued item tagged with `local_spi` — used when a Child
    /// SA closes or is rekeyed away before a previously queued rekey-timer
    /// firing (or other command) for it is dequeued.
    pub fn cancel_for_spi(&mut self, local_spi: u32) {
        self.queue.retain(|r| r.child_spi_tag != Some(local_spi));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_not_dequeued_while_not_idle() {
        let mut sched = LocalRequestScheduler::new();
        sched.enqueue(LocalRequest::ike_level(LocalRequestKind::RekeyIke));
        assert!(sched.dequeue_if_idle(false).is_none());
        assert_eq!(sched.len(), 1);
        assert!(sched.dequeue_if_idle(true).is_some());
        assert!(sched.is_empty());
    }

    #[test]
    fn fifo_order_preserved() {
        let mut sched = LocalRequestScheduler::new();
        sched.enqueue(LocalRequest::for_child(LocalRequestKind::DeleteChild { local_spi: 1 }, 1));
        sched.enqueue(LocalRequest::for_child(LocalRequestKind::RekeyChild { local_spi: 2 }, 2));
        let first = sched.dequeue_if_idle(true).unwrap();
        assert!(matches!(first.kind, LocalRequestKind::DeleteChild { local_spi: 1 }));
        let second = sched.dequeue_if_idle(true).unwrap();
        assert!(matches!(second.kind, LocalRequestKind::RekeyChild { local_spi: 2 }));
    }

    #[test]
    fn cancel_for_spi_discards_stale_timer() {
        let mut sched = LocalRequestScheduler::new();
        sched.enqueue(LocalRequest::for_child(LocalRequestKind::RekeyChild { local_spi: 7 }, 7));
        sched.enqueue(LocalRequest::for_child(LocalRequestKind::DeleteChild { local_spi: 9 }, 9));
        sched.cancel_for_spi(7);
        assert_eq!(sched.len(), 1);
        let remaining = sched.dequeue_if_idle(true).unwrap();
        assert_eq!(remaining.child_spi_tag, Some(9));
    }
}
