// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::HashMap;
use std::io;

/// Trait that allows for checking if an implementor is dirty. Cached items
/// that are dirty must be written out before they are dropped.
pub trait Cacheable {
    fn dirty(&self) -> bool;
}

/// Capacity bounded map from block index to a cached item.
#[derive(Clone, Debug)]
pub struct CacheMap<T: Cacheable> {
    capacity: usize,
    map: HashMap<u32, T>,
}

impl<T: Cacheable> CacheMap<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = std::cmp::max(capacity, 1);
        CacheMap {
            capacity,
            map: HashMap::with_capacity(capacity),
        }
    }

    pub fn contains_key(&self, key: u32) -> bool {
        self.map.contains_key(&key)
    }

    pub fn get_mut(&mut self, key: u32) -> Option<&mut T> {
        self.map.get_mut(&key)
    }

    pub fn remove(&mut self, key: u32) -> Option<T> {
        self.map.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Inserts `item`, evicting another entry when full. A dirty victim is
    /// handed to `write_callback` first; clean victims are preferred.
    pub fn insert<F>(&mut self, key: u32, item: T, write_callback: F) -> io::Result<()>
    where
        F: FnOnce(u32, T) -> io::Result<()>,
    {
        if !self.map.contains_key(&key) && self.map.len() >= self.capacity {
            let victim = self
                .map
                .iter()
                .find(|(_, v)| !v.dirty())
                .or_else(|| self.map.iter().next())
                .map(|(k, _)| *k);
            if let Some(victim) = victim {
                if let Some(evicted) = self.map.remove(&victim) {
                    if evicted.dirty() {
                        write_callback(victim, evicted)?;
                    }
                }
            }
        }
        self.map.insert(key, item);
        Ok(())
    }
}
