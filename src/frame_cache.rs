use crate::backend::FrameSlice;
use indexmap::IndexMap;
use std::sync::Arc;

/// Recently fetched frames keyed by `(channel, frame)`, least recently
/// used first.
#[derive(Debug, Clone)]
pub struct FrameCache {
    capacity: usize,
    entries: IndexMap<(String, usize), Arc<FrameSlice>>,
}

impl FrameCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: IndexMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&mut self, channel_id: &str, frame_index: usize) -> Option<Arc<FrameSlice>> {
        let key = (channel_id.to_string(), frame_index);
        let slice = self.entries.shift_remove(&key)?;
        self.entries.insert(key, slice.clone());
        Some(slice)
    }

    pub fn insert(&mut self, channel_id: &str, frame_index: usize, slice: Arc<FrameSlice>) {
        if self.capacity == 0 {
            return;
        }
        let key = (channel_id.to_string(), frame_index);
        self.entries.shift_remove(&key);
        while self.entries.len() >= self.capacity {
            self.entries.shift_remove_index(0);
        }
        self.entries.insert(key, slice);
    }
}
