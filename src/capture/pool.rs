//! Pooling of captured images
//!
//! The capture task owns one pool per display. Images are handed to the
//! backend for filling and fanned out to encode subscribers as `Arc`
//! clones; a slot whose strong count is back to one is free for reuse.
//! Allocated-but-idle slots are released again once the pool has run below
//! that occupancy for a few seconds, so a burst of slow subscribers does
//! not pin GPU memory forever.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::SharedImage;
use crate::error::Result;

/// Default number of in-flight captured frames per display
pub const DEFAULT_POOL_CAPACITY: usize = 12;

const TRIM_TIMEOUT: Duration = Duration::from_secs(3);

/// Fixed-capacity image pool with idle trimming
pub struct ImagePool {
    /// Front is the most recently used slot, so reuse prefers warm images
    slots: VecDeque<Option<SharedImage>>,
    /// Last time the pool was observed at each occupancy level, indexed by
    /// in-use count
    used_timestamps: Vec<Option<Instant>>,
    trim_timeout: Duration,
}

impl ImagePool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = VecDeque::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            used_timestamps: Vec::new(),
            trim_timeout: TRIM_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_trim_timeout(capacity: usize, trim_timeout: Duration) -> Self {
        let mut pool = Self::new(capacity);
        pool.trim_timeout = trim_timeout;
        pool
    }

    /// Hand out a free image, allocating through `alloc` when every
    /// existing slot is busy. `Ok(None)` means the pool is exhausted and
    /// the caller should retry shortly.
    pub fn pull(&mut self, alloc: &mut dyn FnMut() -> Result<SharedImage>) -> Result<Option<SharedImage>> {
        // Pick the first allocated but unused slot
        let mut found = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Some(img) if Arc::strong_count(img) == 1));

        // Otherwise allocate into the first empty slot
        if found.is_none() {
            if let Some(idx) = self.slots.iter().position(Option::is_none) {
                self.slots[idx] = Some(alloc()?);
                found = Some(idx);
            }
        }

        let Some(idx) = found else {
            return Ok(None);
        };

        // Move the slot to the front to prioritize its reuse
        if idx != 0 {
            let slot = self.slots.remove(idx).flatten();
            self.slots.push_front(slot);
        }

        // Hold the image before trimming so the trim pass sees it in use
        let img = self.slots[0].as_ref().cloned();
        self.trim();

        if let Some(img) = &img {
            if let Ok(mut inner) = img.lock() {
                inner.frame_timestamp = None;
            }
        }
        Ok(img)
    }

    /// Release allocated-but-idle slots above the occupancy the pool has
    /// actually needed within the trim window
    fn trim(&mut self) {
        let mut allocated_count = 0usize;
        let mut used_count = 0usize;
        for slot in &self.slots {
            if let Some(img) = slot {
                allocated_count += 1;
                if Arc::strong_count(img) > 1 {
                    used_count += 1;
                }
            }
        }

        let now = Instant::now();
        if self.used_timestamps.len() <= used_count {
            self.used_timestamps.resize(used_count + 1, None);
        }
        self.used_timestamps[used_count] = Some(now);

        let mut trim_target = used_count;
        for i in used_count..self.used_timestamps.len() {
            if let Some(at) = self.used_timestamps[i] {
                if now.saturating_duration_since(at) < self.trim_timeout {
                    trim_target = i;
                }
            }
        }

        if allocated_count > trim_target {
            let mut to_trim = allocated_count - trim_target;
            // Prioritize trimming the least recently used slots
            for slot in self.slots.iter_mut().rev() {
                if matches!(slot, Some(img) if Arc::strong_count(img) == 1) {
                    *slot = None;
                    to_trim -= 1;
                    if to_trim == 0 {
                        break;
                    }
                }
            }
            self.used_timestamps.truncate(trim_target + 1);
        }
    }

    /// Drop every pooled image, e.g. ahead of a display rebuild where
    /// images still reference backend resources
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.used_timestamps.clear();
    }

    #[cfg(test)]
    fn allocated(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Image;
    use std::sync::Mutex;

    fn alloc() -> Result<SharedImage> {
        Ok(Arc::new(Mutex::new(Image::default())))
    }

    #[test]
    fn test_pull_allocates_up_to_capacity() {
        let mut pool = ImagePool::new(2);
        let a = pool.pull(&mut alloc).unwrap().unwrap();
        let b = pool.pull(&mut alloc).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        // Both slots in flight: the pool is exhausted
        assert!(pool.pull(&mut alloc).unwrap().is_none());
    }

    #[test]
    fn test_free_slot_is_reused() {
        let mut pool = ImagePool::new(2);
        let a = pool.pull(&mut alloc).unwrap().unwrap();
        drop(a);
        let b = pool.pull(&mut alloc).unwrap().unwrap();
        drop(b);
        // Never more than one allocation needed
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_pull_clears_stale_timestamp() {
        let mut pool = ImagePool::new(1);
        let img = pool.pull(&mut alloc).unwrap().unwrap();
        img.lock().unwrap().frame_timestamp = Some(Instant::now());
        drop(img);
        let img = pool.pull(&mut alloc).unwrap().unwrap();
        assert!(img.lock().unwrap().frame_timestamp.is_none());
    }

    #[test]
    fn test_idle_slots_are_trimmed() {
        let mut pool = ImagePool::with_trim_timeout(4, Duration::from_millis(10));

        // Drive occupancy to 3, then drop everything
        let a = pool.pull(&mut alloc).unwrap().unwrap();
        let b = pool.pull(&mut alloc).unwrap().unwrap();
        let c = pool.pull(&mut alloc).unwrap().unwrap();
        assert_eq!(pool.allocated(), 3);
        drop(a);
        drop(b);
        drop(c);

        // After the timeout, a pull at occupancy 1 releases the excess
        std::thread::sleep(Duration::from_millis(20));
        let _held = pool.pull(&mut alloc).unwrap().unwrap();
        assert!(pool.allocated() <= 2);
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut pool = ImagePool::new(3);
        let _a = pool.pull(&mut alloc).unwrap().unwrap();
        pool.clear();
        assert_eq!(pool.allocated(), 0);
    }
}
