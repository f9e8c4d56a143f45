// Deletion queue - deferred, reverse-ordered resource destruction
//
// Vulkan objects have strict creation dependencies (a framebuffer needs
// its image views, a buffer needs the device). Every object registers a
// destroy closure right after it is created; flushing runs them
// newest-first, which is always a valid destruction order.
//
// Only flush once the device is idle.

use anyhow::Result;

type Deleter = Box<dyn FnOnce()>;

/// LIFO list of deferred destructors
#[derive(Default)]
pub struct DeletionQueue {
    name: &'static str,
    deleters: Vec<Deleter>,
}

impl DeletionQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            deleters: Vec::new(),
        }
    }

    /// Register a destroy closure. It runs exactly once, on the next flush.
    pub fn push_deleter<F>(&mut self, deleter: F)
    where
        F: FnOnce() + 'static,
    {
        self.deleters.push(Box::new(deleter));
    }

    /// Run every registered closure in reverse registration order and
    /// empty the queue. Flushing an empty queue does nothing.
    pub fn flush(&mut self) {
        if self.deleters.is_empty() {
            return;
        }

        log::debug!(
            "Flushing deletion queue '{}' ({} objects)",
            self.name,
            self.deleters.len()
        );

        // pop() hands out the newest closure first
        while let Some(deleter) = self.deleters.pop() {
            deleter();
        }
    }

    pub fn len(&self) -> usize {
        self.deleters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deleters.is_empty()
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        if !self.deleters.is_empty() {
            log::warn!(
                "Deletion queue '{}' dropped with {} pending objects, flushing now",
                self.name,
                self.deleters.len()
            );
            self.flush();
        }
    }
}

/// Create `count` objects in order. When one fails, the ones already
/// created are released newest-first before the error is returned.
pub fn create_all<T>(
    count: usize,
    mut create: impl FnMut(usize) -> Result<T>,
    mut release: impl FnMut(T),
) -> Result<Vec<T>> {
    let mut created = Vec::with_capacity(count);
    for i in 0..count {
        match create(i) {
            Ok(object) => created.push(object),
            Err(e) => {
                while let Some(object) = created.pop() {
                    release(object);
                }
                return Err(e);
            }
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording_queue(count: usize) -> (DeletionQueue, Rc<RefCell<Vec<usize>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut queue = DeletionQueue::new("test");
        for i in 0..count {
            let log = log.clone();
            queue.push_deleter(move || log.borrow_mut().push(i));
        }
        (queue, log)
    }

    #[test]
    fn flush_runs_in_reverse_registration_order() {
        let (mut queue, log) = recording_queue(5);
        assert_eq!(queue.len(), 5);

        queue.flush();

        assert_eq!(*log.borrow(), vec![4, 3, 2, 1, 0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn second_flush_runs_nothing() {
        let (mut queue, log) = recording_queue(3);

        queue.flush();
        queue.flush();

        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn deleters_pushed_after_flush_run_on_next_flush_only() {
        let (mut queue, log) = recording_queue(2);
        queue.flush();

        let late = log.clone();
        queue.push_deleter(move || late.borrow_mut().push(99));
        queue.flush();

        assert_eq!(*log.borrow(), vec![1, 0, 99]);
    }

    #[test]
    fn dropping_a_pending_queue_flushes_it() {
        let (queue, log) = recording_queue(2);
        drop(queue);

        assert_eq!(*log.borrow(), vec![1, 0]);
    }

    #[test]
    fn empty_queue_flush_is_noop() {
        let mut queue = DeletionQueue::new("empty");
        queue.flush();
        assert!(queue.is_empty());
    }

    #[test]
    fn create_all_returns_everything_on_success() {
        let mut released = Vec::new();
        let created = create_all(3, |i| Ok(i * 10), |i| released.push(i)).unwrap();

        assert_eq!(created, vec![0, 10, 20]);
        assert!(released.is_empty());
    }

    #[test]
    fn create_all_releases_earlier_objects_when_one_fails() {
        let mut released = Vec::new();
        let result = create_all(
            4,
            |i| {
                anyhow::ensure!(i != 2, "out of device memory");
                Ok(i)
            },
            |i| released.push(i),
        );

        assert!(result.is_err());
        assert_eq!(released, vec![1, 0]);
    }
}
