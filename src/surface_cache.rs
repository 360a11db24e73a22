// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mapping from Vulkan images to the backend surfaces decoding into them.
//!
//! The backend decodes into its own surfaces, so every image used as a decode target or a
//! reference needs a surface attached to it, and that surface must stay the same for as long as
//! the picture is in the DPB. The cache keeps this mapping for a session, with a bounded number
//! of entries and least-recently-used eviction.
//!
//! The cache never destroys surfaces: every method that drops an entry returns its surface, and
//! the caller destroys it with the backend. Entries can be pinned by pending decode commands,
//! in which case they are never evicted.

use std::sync::Arc;

use thiserror::Error;

use crate::backend::SurfaceId;
use crate::device::ImageId;

/// Minimum number of entries kept by [`SurfaceCache::evict_oldest`].
pub const MIN_KEPT_ENTRIES: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    #[error("all {0} cache entries are in use by pending decodes")]
    AllPinned(usize),
    #[error("surface of {0:?} is in use by pending decodes")]
    Pinned(ImageId),
}

/// Keeps a cache entry from being evicted or dropped while alive.
#[derive(Debug)]
pub struct SurfacePin(#[allow(dead_code)] Arc<()>);

#[derive(Debug)]
struct Entry {
    image: ImageId,
    surface: SurfaceId,
    last_used: u64,
    /// Cloned into every [`SurfacePin`] of the entry.
    pins: Arc<()>,
}

impl Entry {
    fn is_pinned(&self) -> bool {
        Arc::strong_count(&self.pins) > 1
    }
}

#[derive(Debug)]
pub struct SurfaceCache {
    entries: Vec<Entry>,
    capacity: usize,
    /// Logical clock for recency, incremented on every access.
    clock: u64,
}

impl SurfaceCache {
    /// Creates a cache holding up to `capacity` surfaces. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn position(&self, image: ImageId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.image == image)
    }

    /// Returns the surface of `image` and marks it as the most recently used.
    pub fn lookup(&mut self, image: ImageId) -> Option<SurfaceId> {
        let index = self.position(image)?;
        let now = self.tick();
        let entry = &mut self.entries[index];
        entry.last_used = now;

        Some(entry.surface)
    }

    /// Index of the least recently used entry that is not pinned. Ties go to the lowest index.
    fn oldest_unpinned(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_pinned())
            .min_by_key(|&(index, entry)| (entry.last_used, index))
            .map(|(index, _)| index)
    }

    /// Associates `surface` with `image`.
    ///
    /// Returns the surface that must now be destroyed by the caller, if any: the previous
    /// surface of `image`, or the surface of the entry evicted to make room.
    pub fn insert_or_update(
        &mut self,
        image: ImageId,
        surface: SurfaceId,
    ) -> Result<Option<SurfaceId>, CacheError> {
        let now = self.tick();

        if let Some(index) = self.position(image) {
            let entry = &mut self.entries[index];
            if entry.surface != surface && entry.is_pinned() {
                return Err(CacheError::Pinned(image));
            }

            let old = std::mem::replace(&mut entry.surface, surface);
            entry.last_used = now;

            return Ok((old != surface).then_some(old));
        }

        let new_entry = Entry {
            image,
            surface,
            last_used: now,
            pins: Arc::new(()),
        };

        if self.entries.len() < self.capacity {
            self.entries.push(new_entry);
            return Ok(None);
        }

        let victim = self
            .oldest_unpinned()
            .ok_or(CacheError::AllPinned(self.entries.len()))?;
        let evicted = std::mem::replace(&mut self.entries[victim], new_entry);
        log::debug!(
            "evicted surface {:?} of {:?} for {:?}",
            evicted.surface,
            evicted.image,
            image
        );

        Ok(Some(evicted.surface))
    }

    /// Evicts the least recently used entries until only `keep_count` remain, keeping at least
    /// [`MIN_KEPT_ENTRIES`] and every pinned entry. Returns the evicted surfaces.
    pub fn evict_oldest(&mut self, keep_count: usize) -> Vec<SurfaceId> {
        let keep_count = keep_count.max(MIN_KEPT_ENTRIES);
        let mut evicted = Vec::new();

        while self.entries.len() > keep_count {
            let Some(victim) = self.oldest_unpinned() else {
                break;
            };
            evicted.push(self.entries.remove(victim).surface);
        }

        if !evicted.is_empty() {
            log::debug!("evicted {} surfaces, {} left", evicted.len(), self.entries.len());
        }

        evicted
    }

    /// Removes the entry of `image` and returns its surface.
    pub fn remove(&mut self, image: ImageId) -> Result<Option<SurfaceId>, CacheError> {
        let Some(index) = self.position(image) else {
            return Ok(None);
        };

        if self.entries[index].is_pinned() {
            return Err(CacheError::Pinned(image));
        }

        Ok(Some(self.entries.remove(index).surface))
    }

    /// Removes every entry, pinned or not, and returns their surfaces.
    pub fn drain(&mut self) -> Vec<SurfaceId> {
        self.entries.drain(..).map(|entry| entry.surface).collect()
    }

    /// Pins the entry of `image` until the returned token is dropped.
    pub fn pin(&self, image: ImageId) -> Option<SurfacePin> {
        self.position(image)
            .map(|index| SurfacePin(Arc::clone(&self.entries[index].pins)))
    }

    pub fn is_pinned(&self, image: ImageId) -> bool {
        self.position(image)
            .is_some_and(|index| self.entries[index].is_pinned())
    }

    pub fn has_pinned_entries(&self) -> bool {
        self.entries.iter().any(Entry::is_pinned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ImageRegistry;

    fn images(count: usize) -> Vec<ImageId> {
        let mut registry = ImageRegistry::new();
        (0..count).map(|_| registry.register()).collect()
    }

    #[test]
    fn lookup_of_absent_image() {
        let images = images(2);
        let mut cache = SurfaceCache::new(4);
        assert_eq!(cache.lookup(images[0]), None);

        cache.insert_or_update(images[0], SurfaceId(1)).unwrap();
        assert_eq!(cache.lookup(images[0]), Some(SurfaceId(1)));
        assert_eq!(cache.lookup(images[1]), None);
    }

    #[test]
    fn evicts_least_recently_inserted() {
        let images = images(6);
        let mut cache = SurfaceCache::new(4);

        let mut evicted = vec![];
        for (i, &image) in images.iter().enumerate() {
            if let Some(surface) = cache.insert_or_update(image, SurfaceId(i as u32)).unwrap() {
                evicted.push(surface);
            }
            assert!(cache.len() <= cache.capacity());
        }

        assert_eq!(evicted, vec![SurfaceId(0), SurfaceId(1)]);
        assert_eq!(cache.lookup(images[0]), None);
        assert_eq!(cache.lookup(images[5]), Some(SurfaceId(5)));
    }

    #[test]
    fn lookup_refreshes_recency() {
        let images = images(5);
        let mut cache = SurfaceCache::new(4);
        for (i, &image) in images[..4].iter().enumerate() {
            cache.insert_or_update(image, SurfaceId(i as u32)).unwrap();
        }

        cache.lookup(images[0]);
        let evicted = cache.insert_or_update(images[4], SurfaceId(4)).unwrap();

        assert_eq!(evicted, Some(SurfaceId(1)));
        assert_eq!(cache.lookup(images[0]), Some(SurfaceId(0)));
    }

    #[test]
    fn update_replaces_surface() {
        let images = images(1);
        let mut cache = SurfaceCache::new(2);

        assert_eq!(cache.insert_or_update(images[0], SurfaceId(1)), Ok(None));
        assert_eq!(cache.insert_or_update(images[0], SurfaceId(1)), Ok(None));
        assert_eq!(
            cache.insert_or_update(images[0], SurfaceId(2)),
            Ok(Some(SurfaceId(1)))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn pinned_entries_are_not_evicted() {
        let images = images(4);
        let mut cache = SurfaceCache::new(2);
        cache.insert_or_update(images[0], SurfaceId(0)).unwrap();
        cache.insert_or_update(images[1], SurfaceId(1)).unwrap();

        let pin = cache.pin(images[0]).unwrap();
        assert!(cache.is_pinned(images[0]));
        assert_eq!(
            cache.insert_or_update(images[2], SurfaceId(2)),
            Ok(Some(SurfaceId(1)))
        );

        let pin2 = cache.pin(images[2]).unwrap();
        assert_eq!(
            cache.insert_or_update(images[3], SurfaceId(3)),
            Err(CacheError::AllPinned(2))
        );
        assert_eq!(cache.remove(images[0]), Err(CacheError::Pinned(images[0])));

        drop(pin);
        drop(pin2);
        assert!(!cache.has_pinned_entries());
        assert_eq!(
            cache.insert_or_update(images[3], SurfaceId(3)),
            Ok(Some(SurfaceId(0)))
        );
    }

    #[test]
    fn evict_oldest_keeps_minimum() {
        let images = images(8);
        let mut cache = SurfaceCache::new(8);
        for (i, &image) in images.iter().enumerate() {
            cache.insert_or_update(image, SurfaceId(i as u32)).unwrap();
        }

        let _pin = cache.pin(images[1]).unwrap();
        let evicted = cache.evict_oldest(1);

        assert_eq!(evicted, vec![SurfaceId(0), SurfaceId(2), SurfaceId(3), SurfaceId(4), SurfaceId(5)]);
        assert_eq!(cache.len(), MIN_KEPT_ENTRIES);
        assert!(cache.evict_oldest(0).is_empty());
    }

    #[test]
    fn remove_and_drain() {
        let images = images(3);
        let mut cache = SurfaceCache::new(4);
        for (i, &image) in images.iter().enumerate() {
            cache.insert_or_update(image, SurfaceId(i as u32)).unwrap();
        }

        assert_eq!(cache.remove(images[1]), Ok(Some(SurfaceId(1))));
        assert_eq!(cache.remove(images[1]), Ok(None));
        assert_eq!(cache.drain(), vec![SurfaceId(0), SurfaceId(2)]);
        assert!(cache.is_empty());
    }
}
