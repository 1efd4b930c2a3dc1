// SPDX-License-Identifier: MIT OR Apache-2.0

//! Slave catalog and the optional startup scan
//!
//! Pure metadata: the catalog never gates RTU traffic, and nothing in
//! it is persisted by the gateway itself.

use std::{
    collections::BTreeMap,
    ops::RangeInclusive,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    arbiter::Handle,
    frame::{Address, Request},
    slave::{Slave, SlaveId},
};

/// Metadata about one known bus unit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SlaveEntry {
    pub unit: SlaveId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Registry of known units, keyed by unit id.
///
/// Reads outnumber writes by far (writes only happen on scan hits), so
/// a plain read/write lock is all the synchronization needed.
#[derive(Debug, Default)]
pub struct SlaveCatalog {
    entries: RwLock<BTreeMap<SlaveId, SlaveEntry>>,
}

impl SlaveCatalog {
    #[must_use]
    pub fn new(seed: impl IntoIterator<Item = SlaveEntry>) -> Self {
        let entries = seed
            .into_iter()
            .map(|entry| (entry.unit, entry))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, unit: SlaveId) -> bool {
        self.read().contains_key(&unit)
    }

    #[must_use]
    pub fn get(&self, unit: SlaveId) -> Option<SlaveEntry> {
        self.read().get(&unit).cloned()
    }

    /// All entries in unit order.
    #[must_use]
    pub fn list(&self) -> Vec<SlaveEntry> {
        self.read().values().cloned().collect()
    }

    /// Record a unit discovered by the scanner. Existing entries keep
    /// their configured name. Returns whether the entry is new.
    pub fn record_discovered(&self, unit: SlaveId) -> bool {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&unit) {
            return false;
        }
        entries.insert(
            unit,
            SlaveEntry {
                unit,
                name: format!("slave-{unit}"),
                description: String::new(),
            },
        );
        true
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<SlaveId, SlaveEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Register probed on each candidate unit.
const PROBE_ADDRESS: Address = 0;

/// Scan probes use a shorter timeout than regular traffic; a sweep over
/// an empty range of 32 units should not take half a minute.
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Probe every unit in the range with a one-register read and record
/// the ones that answer.
///
/// A Modbus exception still proves a device is present and listening;
/// only transport-level silence or corruption counts as absent. Errors
/// are expected for absent units and swallowed.
pub async fn scan(
    handle: &Handle,
    catalog: &SlaveCatalog,
    units: RangeInclusive<SlaveId>,
) -> Vec<SlaveId> {
    let mut found = Vec::new();
    for unit in units {
        let slave = Slave(unit);
        if !slave.is_single_device() {
            continue;
        }
        match handle
            .call_with_timeout(
                slave,
                Request::ReadHoldingRegisters(PROBE_ADDRESS, 1),
                Some(PROBE_TIMEOUT),
            )
            .await
        {
            Ok(_) => {
                if catalog.record_discovered(unit) {
                    log::info!("scan: discovered unit {unit}");
                }
                found.push(unit);
            }
            Err(err) => {
                log::trace!("scan: unit {unit}: {err}");
            }
        }
    }
    log::info!("scan: {} unit(s) responded", found.len());
    found
}
