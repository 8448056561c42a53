use bytes::Bytes;
use sycamore_frame::{DeviceRoutingTable, DrtEntry, FrameError, FrameKind, ReadState};
use tracing::debug;

/// Lifecycle of the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrtState {
    /// No table, and none is being received.
    ReadInit,
    /// A discovery frame header is expected or being collected.
    ReadSize,
    /// A discovery payload is arriving.
    ReadData { received: usize, expected: usize },
    /// A validated table is installed.
    Ready,
}

/// Slot changes a newly installed table implies.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Slots whose device disappeared or changed identity.
    pub removed: Vec<u8>,
    /// Entries that need a fresh device.
    pub added: Vec<DrtEntry>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Identifies one discovery request, so a stale writer cannot clear a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryRequest(u64);

/// Owns the current routing table and the discovery request flag.
///
/// At most one table is installed at a time. Replacing it releases the
/// previous one exactly once.
#[derive(Debug)]
pub struct DrtManager {
    state: DrtState,
    table: Option<DeviceRoutingTable>,
    waiting: Option<DiscoveryRequest>,
    issued: u64,
    max_devices: usize,
}

impl DrtManager {
    pub fn new(max_devices: usize) -> Self {
        Self {
            state: DrtState::ReadInit,
            table: None,
            waiting: None,
            issued: 0,
            max_devices,
        }
    }

    pub fn state(&self) -> DrtState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.table.is_some()
    }

    /// A discovery request is outstanding.
    pub fn is_waiting(&self) -> bool {
        self.waiting.is_some()
    }

    pub fn table(&self) -> Option<&DeviceRoutingTable> {
        self.table.as_ref()
    }

    /// Byte length of the installed table, zero when none.
    pub fn size_of_drt(&self) -> usize {
        self.table.as_ref().map_or(0, |table| table.raw().len())
    }

    /// Claim the right to send a discovery request.
    ///
    /// Returns `None` while an earlier request is still unanswered.
    pub fn request(&mut self) -> Option<DiscoveryRequest> {
        if self.waiting.is_some() {
            debug!("discovery request already outstanding");
            return None;
        }
        self.issued += 1;
        let request = DiscoveryRequest(self.issued);
        self.waiting = Some(request);
        Some(request)
    }

    /// Forget `request` because its write never went out.
    ///
    /// Does nothing if a newer request has replaced it.
    pub fn clear_waiting(&mut self, request: DiscoveryRequest) {
        if self.waiting == Some(request) {
            self.waiting = None;
        } else {
            debug!(?request, "stale discovery request left in place");
        }
    }

    /// Track reassembly progress of an incoming discovery frame.
    ///
    /// A replacement arriving while a table is installed leaves the state
    /// at [`DrtState::Ready`]; the old table stays usable until the new one
    /// validates.
    pub fn observe(&mut self, read: ReadState) {
        if self.table.is_some() {
            return;
        }
        self.state = match read {
            ReadState::ReadingHeader { .. } if self.waiting.is_some() => DrtState::ReadSize,
            ReadState::ReadingPayload { header, received }
                if header.kind == FrameKind::Discovery =>
            {
                DrtState::ReadData {
                    received,
                    expected: header.length as usize,
                }
            }
            _ => DrtState::ReadInit,
        };
    }

    /// Validate and install a discovery payload.
    ///
    /// On success the discovery request flag is cleared and the slot
    /// changes relative to the previous table are returned. On failure the
    /// previous table, if any, stays installed.
    pub fn install(&mut self, payload: Bytes) -> Result<Reconciliation, FrameError> {
        let table = match DeviceRoutingTable::parse(payload, self.max_devices) {
            Ok(table) => table,
            Err(err) => {
                if self.table.is_none() {
                    self.state = DrtState::ReadInit;
                }
                return Err(err);
            }
        };

        let plan = reconcile(self.table.as_ref(), &table);
        debug!(
            devices = table.device_count(),
            removed = plan.removed.len(),
            added = plan.added.len(),
            "installing routing table"
        );
        self.table = Some(table);
        self.waiting = None;
        self.state = DrtState::Ready;
        Ok(plan)
    }

    /// Drop the installed table and any outstanding request.
    pub fn invalidate(&mut self) -> Option<DeviceRoutingTable> {
        self.state = DrtState::ReadInit;
        self.waiting = None;
        self.table.take()
    }
}

fn reconcile(old: Option<&DeviceRoutingTable>, new: &DeviceRoutingTable) -> Reconciliation {
    let old_entries = old.map_or(&[][..], DeviceRoutingTable::entries);

    Reconciliation {
        removed: old_entries
            .iter()
            .filter(|entry| !same_device(entry, new.entry(entry.slot)))
            .map(|entry| entry.slot)
            .collect(),
        added: new
            .entries()
            .iter()
            .filter(|entry| !same_device(entry, old_entries.get(entry.slot as usize)))
            .copied()
            .collect(),
    }
}

fn same_device(entry: &DrtEntry, other: Option<&DrtEntry>) -> bool {
    other.is_some_and(|other| entry.same_identity(other))
}

#[cfg(test)]
mod tests {
    use sycamore_frame::Header;

    use super::*;

    fn entry(device_id: u16) -> DrtEntry {
        DrtEntry {
            slot: 0,
            device_id,
            sub_id: 0,
            flags: 0,
            address: 0,
            size: 0,
        }
    }

    fn table(ids: &[u16]) -> Bytes {
        DeviceRoutingTable::new(ids.iter().map(|id| entry(*id))).encode()
    }

    #[test]
    fn first_install_adds_every_slot() {
        let mut drt = DrtManager::new(16);
        assert_eq!(drt.state(), DrtState::ReadInit);

        let plan = drt.install(table(&[1, 2])).unwrap();
        assert!(plan.removed.is_empty());
        assert_eq!(plan.added.iter().map(|e| e.slot).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(drt.state(), DrtState::Ready);
        assert_eq!(drt.size_of_drt(), 96);
    }

    #[test]
    fn request_is_suppressed_until_answered() {
        let mut drt = DrtManager::new(16);
        assert!(drt.request().is_some());
        assert!(drt.request().is_none());
        assert!(drt.is_waiting());

        drt.install(table(&[1])).unwrap();
        assert!(!drt.is_waiting());
        assert!(drt.request().is_some());
    }

    #[test]
    fn stale_request_cannot_clear_newer_one() {
        let mut drt = DrtManager::new(16);
        let first = drt.request().unwrap();
        drt.invalidate();
        let second = drt.request().unwrap();
        assert_ne!(first, second);

        drt.clear_waiting(first);
        assert!(drt.is_waiting());
        assert!(drt.request().is_none());

        drt.clear_waiting(second);
        assert!(!drt.is_waiting());
    }

    #[test]
    fn replacement_reports_only_changed_slots() {
        let mut drt = DrtManager::new(16);
        drt.install(table(&[1, 2, 3])).unwrap();

        let plan = drt.install(table(&[1, 9])).unwrap();
        assert_eq!(plan.removed, vec![1, 2]);
        assert_eq!(plan.added.len(), 1);
        assert_eq!(plan.added[0].slot, 1);
        assert_eq!(plan.added[0].device_id, 9);
    }

    #[test]
    fn identical_replacement_is_a_no_op() {
        let mut drt = DrtManager::new(16);
        drt.install(table(&[4, 5])).unwrap();
        assert!(drt.install(table(&[4, 5])).unwrap().is_empty());
    }

    #[test]
    fn invalid_table_keeps_previous() {
        let mut drt = DrtManager::new(16);
        drt.install(table(&[1])).unwrap();

        assert!(drt.install(Bytes::from_static(&[0; 4])).is_err());
        assert_eq!(drt.state(), DrtState::Ready);
        assert_eq!(drt.table().map(|t| t.device_count()), Some(1));
    }

    #[test]
    fn invalid_first_table_returns_to_init() {
        let mut drt = DrtManager::new(1);
        assert!(drt.request().is_some());
        assert!(matches!(
            drt.install(table(&[1, 2])),
            Err(FrameError::TooManyDevices { count: 2, max: 1 })
        ));
        assert_eq!(drt.state(), DrtState::ReadInit);
        assert!(drt.is_waiting());
    }

    #[test]
    fn invalidate_releases_table_once() {
        let mut drt = DrtManager::new(16);
        drt.request();
        drt.install(table(&[1])).unwrap();

        assert!(drt.invalidate().is_some());
        assert!(drt.invalidate().is_none());
        assert_eq!(drt.state(), DrtState::ReadInit);
        assert!(!drt.is_waiting());
        assert_eq!(drt.size_of_drt(), 0);
    }

    #[test]
    fn observe_tracks_discovery_progress() {
        let mut drt = DrtManager::new(16);
        drt.request();

        drt.observe(ReadState::ReadingHeader { collected: 1 });
        assert_eq!(drt.state(), DrtState::ReadSize);

        let header = Header {
            kind: FrameKind::Discovery,
            slot: 0,
            length: 64,
        };
        drt.observe(ReadState::ReadingPayload {
            header,
            received: 10,
        });
        assert_eq!(
            drt.state(),
            DrtState::ReadData {
                received: 10,
                expected: 64
            }
        );

        drt.observe(ReadState::Idle);
        assert_eq!(drt.state(), DrtState::ReadInit);
    }

    #[test]
    fn observe_leaves_ready_alone() {
        let mut drt = DrtManager::new(16);
        drt.install(table(&[1])).unwrap();

        let header = Header {
            kind: FrameKind::Discovery,
            slot: 0,
            length: 64,
        };
        drt.observe(ReadState::ReadingPayload {
            header,
            received: 3,
        });
        assert_eq!(drt.state(), DrtState::Ready);
    }
}
