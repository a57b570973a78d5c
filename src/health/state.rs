//! Endpoint map.
//!
//! # States
//! - In service: `latest_ejection` unset, receives traffic
//! - Ejected: `latest_ejection` set, wrappers report TRANSIENT_FAILURE
//!
//! # State Transitions
//! ```text
//! In service → Ejected: an ejection algorithm flags the endpoint
//!                       and the enforcement draw passes
//! Ejected → In service: the back-off for the current multiplier elapsed,
//!                       the address left the resolver set,
//!                       or a no-op config was installed
//! ```
//!
//! # Design Decisions
//! - Ordered map so every sweep visits endpoints in the same order
//! - Cached ejected count so the ejection cap check is O(1)
//! - Removing an ejected address un-ejects it first, keeping the count exact

use std::collections::{BTreeMap, HashSet};

use tokio::time::Instant;

use crate::health::endpoint::EndpointRecord;
use crate::load_balancer::Address;

/// Every endpoint in the current resolver snapshot, keyed by address.
#[derive(Debug, Default)]
pub struct EndpointSet {
    records: BTreeMap<String, EndpointRecord>,
    ejected: usize,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.records.contains_key(addr)
    }

    pub fn get(&self, addr: &str) -> Option<&EndpointRecord> {
        self.records.get(addr)
    }

    pub(crate) fn get_mut(&mut self, addr: &str) -> Option<&mut EndpointRecord> {
        self.records.get_mut(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EndpointRecord)> {
        self.records.iter()
    }

    pub fn ejected_count(&self) -> usize {
        self.ejected
    }

    /// Make the map match the resolver addresses. Existing records are kept.
    ///
    /// Returns the newly inserted addresses.
    pub(crate) fn sync_addresses(&mut self, addresses: &[Address]) -> Vec<String> {
        let wanted: HashSet<&str> = addresses.iter().map(|a| a.addr.as_str()).collect();

        let stale: Vec<String> = self
            .records
            .keys()
            .filter(|addr| !wanted.contains(addr.as_str()))
            .cloned()
            .collect();
        for addr in stale {
            if let Some(mut record) = self.records.remove(&addr) {
                if record.is_ejected() {
                    record.uneject();
                    self.ejected -= 1;
                }
                record.detach_all();
                tracing::debug!(address = %addr, "Endpoint removed");
            }
        }

        let mut added = Vec::new();
        for addr in addresses {
            if !self.records.contains_key(&addr.addr) {
                self.records.insert(addr.addr.clone(), EndpointRecord::new());
                added.push(addr.addr.clone());
            }
        }
        added
    }

    /// Eject an endpoint. Already-ejected endpoints are left untouched.
    pub(crate) fn eject(&mut self, addr: &str, now: Instant) -> bool {
        match self.records.get_mut(addr) {
            Some(record) if !record.is_ejected() => {
                record.eject(now);
                self.ejected += 1;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn uneject(&mut self, addr: &str) -> bool {
        match self.records.get_mut(addr) {
            Some(record) if record.is_ejected() => {
                record.uneject();
                self.ejected -= 1;
                true
            }
            _ => false,
        }
    }

    /// True when ejecting one more endpoint is no longer allowed.
    ///
    /// The check is `ejected / total * 100 >= max_percent` and runs before
    /// each ejection, so with a non-zero cap at least one ejection can happen.
    pub fn ejection_cap_reached(&self, max_ejection_percent: u32) -> bool {
        if self.records.is_empty() {
            return true;
        }
        self.ejected as f64 / self.records.len() as f64 * 100.0 >= f64::from(max_ejection_percent)
    }

    pub(crate) fn swap_counters(&self) {
        for record in self.records.values() {
            record.call_counter().swap();
        }
    }

    pub(crate) fn clear_counters(&self) {
        for record in self.records.values() {
            record.call_counter().clear();
        }
    }

    /// Un-eject everything and zero every multiplier.
    ///
    /// Returns the addresses that were ejected.
    pub(crate) fn reset_ejections(&mut self) -> Vec<String> {
        let mut unejected = Vec::new();
        for (addr, record) in self.records.iter_mut() {
            if record.is_ejected() {
                record.uneject();
                unejected.push(addr.clone());
            }
            record.reset_multiplier();
        }
        self.ejected = 0;
        unejected
    }

    pub(crate) fn clear(&mut self) {
        for record in self.records.values_mut() {
            record.detach_all();
        }
        self.records.clear();
        self.ejected = 0;
    }
}
