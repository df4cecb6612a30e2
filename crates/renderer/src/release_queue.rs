//! Frame-delayed destruction.
//!
//! A device object that stops being referenced by the current frame may
//! still be used by command buffers of earlier frames the GPU has not
//! finished. It is queued here instead of destroyed, and every
//! [`DeferredReleaseQueue::process_queue`] call ages the queued entries by one
//! frame. An entry is destroyed once its age reaches the buffering depth.

use forge_rhi::NativeObject;
use tracing::{debug, trace};

/// One queued object and the number of frames it has waited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReleaseEntry<T> {
    pub item: T,
    pub age: u32,
}

/// Insertion-ordered queue of objects waiting for the GPU to let go of them.
///
/// Generic over the payload so other frame-scoped recyclers (uniform blocks)
/// share the aging rule. The renderer's main queue holds [`NativeObject`]s.
#[derive(Debug)]
pub struct DeferredReleaseQueue<T = NativeObject> {
    entries: Vec<ReleaseEntry<T>>,
}

impl<T> Default for DeferredReleaseQueue<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> DeferredReleaseQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item` with age zero.
    pub fn release(&mut self, item: T) {
        self.entries.push(ReleaseEntry { item, age: 0 });
    }

    /// Hand every entry that has waited `depth` frames to `destroy`, then
    /// age the rest by one.
    ///
    /// Called once per frame before any recording. An entry queued during
    /// frame `F` is destroyed at the start of frame `F + depth + 1`, after
    /// the fence of every frame that could have used it has been waited on.
    pub fn process_queue(&mut self, depth: u32, mut destroy: impl FnMut(T)) -> usize {
        let before = self.entries.len();
        let mut kept = Vec::with_capacity(before);
        for mut entry in self.entries.drain(..) {
            if entry.age >= depth {
                destroy(entry.item);
            } else {
                entry.age += 1;
                kept.push(entry);
            }
        }
        self.entries = kept;

        let released = before - self.entries.len();
        if released > 0 {
            trace!("Released {} queued objects, {} pending", released, self.entries.len());
        }
        released
    }

    /// Destroy everything regardless of age. Only valid once the device is idle.
    pub fn flush(&mut self, mut destroy: impl FnMut(T)) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            destroy(entry.item);
        }
        if count > 0 {
            debug!("Flushed {} queued objects", count);
        }
        count
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ReleaseEntry<T>] {
        &self.entries
    }
}

impl DeferredReleaseQueue<NativeObject> {
    /// Queue a device object. Null handles are dropped.
    pub fn release_object(&mut self, object: NativeObject) {
        if !object.is_null() {
            self.release(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use ash::vk::Handle;

    fn buffer(raw: u64) -> NativeObject {
        NativeObject::Buffer(vk::Buffer::from_raw(raw))
    }

    #[test]
    fn test_entry_waits_depth_frames() {
        let mut queue = DeferredReleaseQueue::new();
        queue.release_object(buffer(1));

        let mut destroyed = Vec::new();
        // Frames F+1 and F+2 age the entry; F+3 destroys it.
        assert_eq!(queue.process_queue(2, |o| destroyed.push(o)), 0);
        assert_eq!(queue.process_queue(2, |o| destroyed.push(o)), 0);
        assert!(destroyed.is_empty());
        assert_eq!(queue.process_queue(2, |o| destroyed.push(o)), 1);
        assert_eq!(destroyed, vec![buffer(1)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_interior_removal_keeps_order() {
        let mut queue = DeferredReleaseQueue::new();
        queue.release_object(buffer(1));
        queue.process_queue(3, |_| {});
        queue.release_object(buffer(2));
        queue.process_queue(3, |_| {});
        queue.release_object(buffer(3));

        let mut destroyed = Vec::new();
        queue.process_queue(3, |o| destroyed.push(o));
        queue.process_queue(3, |o| destroyed.push(o));
        assert_eq!(destroyed, vec![buffer(1)]);

        let remaining: Vec<_> = queue.entries().iter().map(|e| e.item).collect();
        assert_eq!(remaining, vec![buffer(2), buffer(3)]);
    }

    #[test]
    fn test_never_destroyed_before_depth() {
        for depth in 1..5u32 {
            let mut queue = DeferredReleaseQueue::new();
            let mut destroyed_at = Vec::new();
            for frame in 0..20u32 {
                queue.process_queue(depth, |o: NativeObject| destroyed_at.push((o, frame)));
                queue.release_object(buffer(frame as u64 + 1));
            }
            for (object, frame) in destroyed_at {
                let (raw, _) = object.raw_handles();
                let enqueued = raw as u32 - 1;
                assert!(frame >= enqueued + depth, "depth {depth}: {enqueued} -> {frame}");
            }
        }
    }

    #[test]
    fn test_null_handles_are_ignored() {
        let mut queue = DeferredReleaseQueue::new();
        queue.release_object(NativeObject::Buffer(vk::Buffer::null()));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_destroys_everything() {
        let mut queue = DeferredReleaseQueue::new();
        queue.release(7u32);
        queue.release(9u32);
        let mut out = Vec::new();
        assert_eq!(queue.flush(|v| out.push(v)), 2);
        assert_eq!(out, vec![7, 9]);
        assert!(queue.is_empty());
    }
}
