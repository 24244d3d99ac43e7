use std::collections::{HashMap, VecDeque};

use log::trace;

use crate::data::{DataBlock, RequestData};

/// Store offered each block fetched while its capability flag is set.
pub trait ResultCache: Send {
    fn write(&mut self, request: &RequestData, block: &DataBlock);

    fn read(&self, request: &RequestData) -> Option<DataBlock>;
}

/// Bounded in-process cache keyed by signal, source and function arguments.
///
/// The oldest entry is dropped once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    capacity: usize,
    entries: HashMap<String, DataBlock>,
    order: VecDeque<String>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(request: &RequestData) -> String {
        let mut key = format!("{}\u{1f}{}", request.signal, request.source);
        for nv in &request.name_values {
            key.push('\u{1f}');
            key.push_str(&nv.name);
            key.push('=');
            key.push_str(&nv.value);
        }
        key
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ResultCache for MemoryCache {
    fn write(&mut self, request: &RequestData, block: &DataBlock) {
        let key = Self::key(request);
        trace!("caching {}", request.signal);
        if self.entries.insert(key.clone(), block.clone()).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn read(&self, request: &RequestData) -> Option<DataBlock> {
        self.entries.get(&Self::key(request)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{RequestDefaults, Values};

    fn request(signal: &str) -> RequestData {
        RequestData::parse(signal, "12345", &RequestDefaults::default()).unwrap()
    }

    #[test]
    fn oldest_entry_is_evicted() {
        let mut cache = MemoryCache::new(2);
        let block = DataBlock::new(Values::Int(vec![1, 2]));

        cache.write(&request("a"), &block);
        cache.write(&request("b"), &block);
        cache.write(&request("a"), &block);
        assert_eq!(cache.len(), 2);

        cache.write(&request("c"), &block);
        assert_eq!(cache.len(), 2);
        assert!(cache.read(&request("a")).is_none());
        assert_eq!(cache.read(&request("c")), Some(block));
    }
}
