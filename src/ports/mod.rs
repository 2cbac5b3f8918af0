//! Port allocation for preview containers.
//!
//! Ports come from a fixed contiguous range (5000-5999 by default). The
//! containers table is the only source of truth for occupancy: a port is in
//! use when a `running` record holds it, or when the OS reports it bound and
//! probing is enabled. Allocation reads occupancy and inserts the reserving
//! record in one `BEGIN IMMEDIATE` transaction, so concurrent allocators
//! (threads or processes) never hand out the same port.

mod probe;

pub use probe::{NoProbe, PortProbe, TcpProbe};

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::PortSettings;
use crate::db::DbHandle;
use crate::errors::PortError;
use crate::models::{ContainerRecord, PortMap, SlotRequest};

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, PortError> {
        if start == 0 || start > end {
            return Err(PortError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }
}

/// Assign a port to every slot, or fail without assigning any.
///
/// Preferred ports are honoured first when they are in range and free. The
/// remaining slots, in name order, each take the lowest free port at or above
/// the range start. A port is free when it is not in `in_use`, not already
/// assigned by this call and not reported bound by `probe`.
pub fn plan_ports(
    range: PortRange,
    in_use: &HashSet<u16>,
    slots: &SlotRequest,
    probe: &dyn PortProbe,
) -> Result<PortMap, PortError> {
    if slots.keys().any(|name| name.trim().is_empty()) {
        return Err(PortError::EmptySlotName);
    }

    let mut taken = in_use.clone();
    let mut assigned = PortMap::new();

    for (name, preferred) in slots {
        if let Some(port) = *preferred
            && range.contains(port)
            && !taken.contains(&port)
            && !probe.is_bound(port)
        {
            taken.insert(port);
            assigned.insert(name.clone(), port);
        }
    }

    let mut candidates = range.start..=range.end;
    for name in slots.keys() {
        if assigned.contains_key(name) {
            continue;
        }
        let port = candidates
            .by_ref()
            .find(|p| !taken.contains(p) && !probe.is_bound(*p));
        match port {
            Some(port) => {
                taken.insert(port);
                assigned.insert(name.clone(), port);
            }
            None => {
                let available = (range.start..=range.end)
                    .filter(|p| !in_use.contains(p) && !probe.is_bound(*p))
                    .count();
                return Err(PortError::PortRangeExhausted {
                    requested: slots.len(),
                    available,
                    start: range.start,
                    end: range.end,
                });
            }
        }
    }

    Ok(assigned)
}

#[derive(Clone)]
pub struct PortAllocator {
    db: DbHandle,
    range: PortRange,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(db: DbHandle, settings: &PortSettings) -> Result<Self, PortError> {
        let range = PortRange::new(settings.range_start, settings.range_end)?;
        let probe: Arc<dyn PortProbe> = if settings.probe {
            Arc::new(TcpProbe)
        } else {
            Arc::new(NoProbe)
        };
        Ok(Self { db, range, probe })
    }

    pub fn with_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Reserve ports for `slots` by inserting a running ContainerRecord for
    /// `work_dir`. The record is the reservation; release it with
    /// [`release`](Self::release).
    #[instrument(skip(self, slots), fields(work_dir = %work_dir.display(), slots = slots.len()))]
    pub async fn allocate(
        &self,
        project_id: i64,
        work_dir: &Path,
        slots: SlotRequest,
    ) -> Result<ContainerRecord, PortError> {
        let range = self.range;
        let probe = self.probe.clone();
        let work_dir = work_dir.display().to_string();

        let record = self
            .db
            .call(move |db| {
                Ok(db.reserve_ports(project_id, &work_dir, |in_use| {
                    plan_ports(range, in_use, &slots, probe.as_ref())
                }))
            })
            .await
            .map_err(PortError::Store)?;

        match &record {
            Ok(r) => info!(record = r.id, ports = ?r.ports, "ports reserved"),
            Err(e) => warn!(error = %e, "port allocation failed"),
        }
        record
    }

    /// Mark the reserving record stopped. Releasing twice is a no-op.
    pub async fn release(&self, record_id: i64) -> Result<Option<ContainerRecord>, PortError> {
        self.db
            .call(move |db| db.mark_container_stopped(record_id))
            .await
            .map_err(PortError::Store)
    }

    /// Ports currently held by running records.
    pub async fn in_use(&self) -> Result<HashSet<u16>, PortError> {
        self.db
            .call(|db| db.running_ports())
            .await
            .map_err(PortError::Store)
    }
}
