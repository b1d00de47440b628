//! Live window records, indexed by client id and by host handle.

use std::collections::{BTreeMap, HashMap};

use crate::arena::ExportedBuffer;
use crate::host::HostHandle;
use crate::planar::PlaneLayout;
use crate::protocol::Title;

#[derive(Debug)]
pub struct WindowRecord {
    pub id: u8,
    pub handle: HostHandle,
    pub buffer: ExportedBuffer,
    pub layout: PlaneLayout,
    pub title: Title,
}

#[derive(Debug, Default)]
pub struct WindowRegistry {
    by_id: BTreeMap<u8, WindowRecord>,
    by_handle: HashMap<HostHandle, u8>,
}

impl WindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `record`. Hands it back if its id or host handle
    /// is already live.
    pub fn insert(&mut self, record: WindowRecord) -> Result<(), WindowRecord> {
        if self.by_id.contains_key(&record.id) || self.by_handle.contains_key(&record.handle) {
            return Err(record);
        }
        self.by_handle.insert(record.handle, record.id);
        self.by_id.insert(record.id, record);
        Ok(())
    }

    pub fn contains_id(&self, id: u8) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn find_by_id(&self, id: u8) -> Option<&WindowRecord> {
        self.by_id.get(&id)
    }

    pub fn find_by_handle(&self, handle: HostHandle) -> Option<&WindowRecord> {
        self.by_handle.get(&handle).and_then(|id| self.by_id.get(id))
    }

    pub fn remove_by_id(&mut self, id: u8) -> Option<WindowRecord> {
        let record = self.by_id.remove(&id)?;
        self.by_handle.remove(&record.handle);
        Some(record)
    }

    /// Removes every record, lowest id first.
    pub fn drain(&mut self) -> Vec<WindowRecord> {
        self.by_handle.clear();
        std::mem::take(&mut self.by_id).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &WindowRecord> {
        self.by_id.values()
    }
}
