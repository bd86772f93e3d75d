// Deferred resource release
//
// One pending list per frame slot. A destroy action queued while slot i is
// recording runs when slot i begins its next frame, after that slot's fence
// has been waited on. That is the only point where the GPU is known to be
// done with everything the slot's previous submission referenced.

use parking_lot::Mutex;

pub type ReleaseAction = Box<dyn FnOnce() + Send + 'static>;

struct ReleaseRing {
    lists: Vec<Vec<ReleaseAction>>,
    current: usize,
}

pub struct ReleaseQueue {
    ring: Mutex<ReleaseRing>,
}

impl ReleaseQueue {
    pub fn new(frames_in_flight: usize) -> Self {
        assert!(frames_in_flight > 0, "release queue needs at least one slot");
        Self {
            ring: Mutex::new(ReleaseRing {
                lists: (0..frames_in_flight).map(|_| Vec::new()).collect(),
                current: 0,
            }),
        }
    }

    /// Queue `action` against the slot that is currently recording.
    /// Safe to call from any thread.
    pub fn submit_resource_free<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut ring = self.ring.lock();
        let slot = ring.current;
        ring.lists[slot].push(Box::new(action));
    }

    /// Run everything queued for `slot` and make it the recording slot.
    ///
    /// Called at the start of the slot's frame, after its fence wait. Actions
    /// run without the lock held so they may queue further frees; those land
    /// in this same slot and run N frames from now.
    pub fn execute(&self, slot: usize) {
        let actions = {
            let mut ring = self.ring.lock();
            assert!(slot < ring.lists.len(), "frame slot {} out of range", slot);
            ring.current = slot;
            std::mem::take(&mut ring.lists[slot])
        };

        if !actions.is_empty() {
            log::trace!("Releasing {} deferred resources for slot {}", actions.len(), slot);
        }
        for action in actions {
            action();
        }
    }

    /// Run every pending action regardless of slot. Only valid once the
    /// device is idle.
    pub fn flush_all(&self) {
        let actions: Vec<ReleaseAction> = {
            let mut ring = self.ring.lock();
            ring.lists.iter_mut().flat_map(std::mem::take).collect()
        };

        if !actions.is_empty() {
            log::debug!("Flushing {} deferred resources", actions.len());
        }
        for action in actions {
            action();
        }
    }

    pub fn current_slot(&self) -> usize {
        self.ring.lock().current
    }

    pub fn slot_count(&self) -> usize {
        self.ring.lock().lists.len()
    }

    /// Number of actions waiting across all slots.
    pub fn pending(&self) -> usize {
        self.ring.lock().lists.iter().map(Vec::len).sum()
    }
}

impl Drop for ReleaseQueue {
    fn drop(&mut self) {
        let pending = self.pending();
        if pending > 0 {
            log::warn!("Release queue dropped with {} pending actions, running them now", pending);
            self.flush_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn action_waits_for_its_slot_to_come_around() {
        let queue = ReleaseQueue::new(3);
        let ran = Arc::new(AtomicUsize::new(0));

        queue.execute(0);
        let r = ran.clone();
        queue.submit_resource_free(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        queue.execute(1);
        queue.execute(2);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        queue.execute(0);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn action_queued_during_release_runs_next_cycle() {
        let queue = Arc::new(ReleaseQueue::new(2));
        let ran = Arc::new(AtomicUsize::new(0));

        let q = queue.clone();
        let r = ran.clone();
        queue.submit_resource_free(move || {
            let r2 = r.clone();
            q.submit_resource_free(move || {
                r2.fetch_add(1, Ordering::SeqCst);
            });
        });

        queue.execute(1);
        queue.execute(0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending(), 1);

        queue.execute(1);
        queue.execute(0);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_all_runs_every_slot() {
        let queue = ReleaseQueue::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        for slot in 0..2 {
            queue.execute(slot);
            let r = ran.clone();
            queue.submit_resource_free(move || {
                r.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(queue.pending(), 2);
        queue.flush_all();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic]
    fn zero_slots_is_a_programming_error() {
        let _ = ReleaseQueue::new(0);
    }
}
