use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::PixelBuffer;

struct CacheEntry {
    buffer: Arc<PixelBuffer>,
    generation: u64,
}

/// Bounded LRU of decoded pixel buffers keyed by source path.
///
/// Eviction is strict least-recently-accessed on both `get` and `put`.
/// Entries tagged with a generation older than the cache's current
/// generation are invisible to `get` (as if absent) but are not proactively
/// dropped until overwritten or evicted, mirroring the hand-rolled
/// `HashMap` + access-order `VecDeque` shape used elsewhere in this codebase
/// for similar bounded caches.
pub struct PixmapCache {
    entries: HashMap<PathBuf, CacheEntry>,
    access_order: VecDeque<PathBuf>,
    cap_entries: usize,
    cap_bytes: Option<u64>,
    generation: u64,
}

impl PixmapCache {
    pub fn new(cap_entries: usize, cap_bytes: Option<u64>) -> Self {
        PixmapCache {
            entries: HashMap::new(),
            access_order: VecDeque::new(),
            cap_entries: cap_entries.max(1),
            cap_bytes,
            generation: 0,
        }
    }

    /// Returns the cached buffer for `path`, or `None` on a miss or a
    /// generation mismatch. A hit moves `path` to the back of the access
    /// order (most recently used).
    pub fn get(&mut self, path: &Path) -> Option<Arc<PixelBuffer>> {
        let current_generation = self.generation;
        let entry = self.entries.get(path)?;
        if entry.generation != current_generation {
            return None;
        }
        let buffer = entry.buffer.clone();
        self.access_order.retain(|p| p.as_path() != path);
        self.access_order.push_back(path.to_path_buf());
        Some(buffer)
    }

    /// Inserts `buffer` under the current generation, evicting
    /// least-recently-accessed entries as needed to stay within the
    /// configured entry and byte caps.
    pub fn put(&mut self, path: PathBuf, buffer: Arc<PixelBuffer>) {
        if self.entries.contains_key(&path) {
            self.access_order.retain(|p| p != &path);
        }
        self.entries.insert(
            path.clone(),
            CacheEntry {
                buffer,
                generation: self.generation,
            },
        );
        self.access_order.push_back(path);
        self.evict_to_fit();
    }

    pub fn remove(&mut self, path: &Path) {
        self.entries.remove(path);
        self.access_order.retain(|p| p.as_path() != path);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.access_order.clear();
    }

    /// Bumps the cache's generation counter, making all currently-visible
    /// entries invisible to future `get` calls without immediately freeing
    /// them (they remain eligible for normal LRU eviction).
    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn total_bytes(&self) -> u64 {
        self.entries
            .values()
            .map(|entry| entry.buffer.bytes().len() as u64)
            .sum()
    }

    fn evict_to_fit(&mut self) {
        while self.entries.len() > self.cap_entries {
            self.evict_oldest();
        }
        if let Some(cap_bytes) = self.cap_bytes {
            while self.total_bytes() > cap_bytes && !self.access_order.is_empty() {
                self.evict_oldest();
            }
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.access_order.pop_front() {
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_of(len: usize) -> Arc<PixelBuffer> {
        // `PixelBuffer` has no public constructor outside of decode(); tests
        // go through the codec on a tiny in-memory fixture instead of faking
        // one, keeping the cache's tests honest about the real type.
        let width = len as u32;
        let image = image::RgbImage::from_pixel(width.max(1), 1, image::Rgb([1, 2, 3]));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.png");
        image::DynamicImage::ImageRgb8(image)
            .save_with_format(&path, image::ImageFormat::Png)
            .unwrap();
        Arc::new(crate::codec::decode(&path, None, crate::codec::DecodeMode::Full).unwrap())
    }

    #[test]
    fn evicts_least_recently_used_on_overflow() {
        let mut cache = PixmapCache::new(2, None);
        cache.put(PathBuf::from("a"), buffer_of(1));
        cache.put(PathBuf::from("b"), buffer_of(1));
        cache.put(PathBuf::from("c"), buffer_of(1));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&PathBuf::from("a")).is_none());
        assert!(cache.get(&PathBuf::from("b")).is_some());
        assert!(cache.get(&PathBuf::from("c")).is_some());
    }

    #[test]
    fn get_refreshes_access_order() {
        let mut cache = PixmapCache::new(2, None);
        cache.put(PathBuf::from("a"), buffer_of(1));
        cache.put(PathBuf::from("b"), buffer_of(1));
        // Touch "a" so "b" becomes the least recently used.
        cache.get(&PathBuf::from("a"));
        cache.put(PathBuf::from("c"), buffer_of(1));
        assert!(cache.get(&PathBuf::from("a")).is_some());
        assert!(cache.get(&PathBuf::from("b")).is_none());
    }

    #[test]
    fn bump_generation_hides_existing_entries() {
        let mut cache = PixmapCache::new(5, None);
        cache.put(PathBuf::from("a"), buffer_of(1));
        assert!(cache.get(&PathBuf::from("a")).is_some());
        cache.bump_generation();
        assert!(cache.get(&PathBuf::from("a")).is_none());
        // Still counted until evicted/overwritten.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn never_exceeds_entry_cap() {
        let mut cache = PixmapCache::new(3, None);
        for i in 0..10 {
            cache.put(PathBuf::from(format!("p{i}")), buffer_of(1));
            assert!(cache.len() <= 3);
        }
    }
}
