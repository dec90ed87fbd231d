//! Authoritative breakpoint set
//!
//! Pure bookkeeping: the controller performs the probe operations and records
//! the outcome here. Software breakpoints keep the bytes they replaced so memory
//! reads and writes can look through the patch.

use std::collections::BTreeMap;

use crate::target::{Breakpoint, BreakpointKind};

#[derive(Debug, Clone)]
pub struct BreakpointEntry {
    pub breakpoint: Breakpoint,
    /// Bytes replaced by the patch. Empty for hardware breakpoints.
    pub original: Vec<u8>,
    /// Bytes written over `original`. Empty for hardware breakpoints.
    pub patch: Vec<u8>,
}

impl BreakpointEntry {
    fn patched_bytes(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        (0..self.patch.len()).map(move |i| (self.breakpoint.address + i as u64, i))
    }
}

#[derive(Debug)]
pub struct BreakpointRegistry {
    entries: BTreeMap<(u64, BreakpointKind), BreakpointEntry>,
    hardware_slots: usize,
}

impl BreakpointRegistry {
    pub fn new(hardware_slots: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            hardware_slots,
        }
    }

    pub fn hardware_slots(&self) -> usize {
        self.hardware_slots
    }

    pub fn hardware_in_use(&self) -> usize {
        self.entries
            .keys()
            .filter(|(_, kind)| *kind == BreakpointKind::Hardware)
            .count()
    }

    pub fn hardware_slot_available(&self) -> bool {
        self.hardware_in_use() < self.hardware_slots
    }

    pub fn contains(&self, breakpoint: &Breakpoint) -> bool {
        self.entries.contains_key(&breakpoint.key())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert_hardware(&mut self, breakpoint: Breakpoint) {
        self.entries.insert(
            breakpoint.key(),
            BreakpointEntry {
                breakpoint,
                original: Vec::new(),
                patch: Vec::new(),
            },
        );
    }

    pub fn insert_software(&mut self, breakpoint: Breakpoint, original: Vec<u8>, patch: Vec<u8>) {
        self.entries.insert(
            breakpoint.key(),
            BreakpointEntry {
                breakpoint,
                original,
                patch,
            },
        );
    }

    pub fn remove(&mut self, breakpoint: &Breakpoint) -> Option<BreakpointEntry> {
        self.entries.remove(&breakpoint.key())
    }

    /// Restore an entry whose removal could not be applied to the target
    pub fn restore(&mut self, entry: BreakpointEntry) {
        self.entries.insert(entry.breakpoint.key(), entry);
    }

    pub fn software_at(&self, address: u64) -> Option<&BreakpointEntry> {
        self.entries.get(&(address, BreakpointKind::Software))
    }

    pub fn hardware_at(&self, address: u64) -> bool {
        self.entries.contains_key(&(address, BreakpointKind::Hardware))
    }

    pub fn drain(&mut self) -> Vec<BreakpointEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    fn software(&self) -> impl Iterator<Item = &BreakpointEntry> {
        self.entries
            .values()
            .filter(|e| e.breakpoint.kind == BreakpointKind::Software)
    }

    /// Replace patched bytes in `data` (read from `address`) with the original memory contents
    pub fn mask_read(&self, address: u64, data: &mut [u8]) {
        let end = address.saturating_add(data.len() as u64);
        for entry in self.software() {
            for (byte_address, i) in entry.patched_bytes() {
                if (address..end).contains(&byte_address) {
                    data[(byte_address - address) as usize] = entry.original[i];
                }
            }
        }
    }

    /// The bytes to actually write so that `data` lands in memory without
    /// removing any patch it overlaps
    pub fn patched_write(&self, address: u64, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        let end = address.saturating_add(data.len() as u64);
        for entry in self.software() {
            for (byte_address, i) in entry.patched_bytes() {
                if (address..end).contains(&byte_address) {
                    out[(byte_address - address) as usize] = entry.patch[i];
                }
            }
        }
        out
    }

    /// Record a completed write of `data` at `address` in the saved originals
    pub fn record_write(&mut self, address: u64, data: &[u8]) {
        let end = address.saturating_add(data.len() as u64);
        for entry in self.entries.values_mut() {
            for i in 0..entry.patch.len() {
                let byte_address = entry.breakpoint.address + i as u64;
                if (address..end).contains(&byte_address) {
                    entry.original[i] = data[(byte_address - address) as usize];
                }
            }
        }
    }
}
