use std::sync::Arc;

use crate::device::VirtualDevice;
use crate::error::{BusError, Result};

/// Fixed-capacity slot table of bound virtual devices.
///
/// An empty slot is the "no such device" answer for every lookup.
#[derive(Debug)]
pub struct DeviceRegistry {
    slots: Vec<Option<Arc<VirtualDevice>>>,
}

impl DeviceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind `device` to its slot. Occupied slots are never overwritten.
    pub fn bind(&mut self, device: Arc<VirtualDevice>) -> Result<()> {
        let slot = device.slot();
        let entry = self.slot_mut(slot)?;
        if entry.is_some() {
            return Err(BusError::SlotOccupied(slot));
        }
        *entry = Some(device);
        Ok(())
    }

    /// The device bound to `slot`.
    pub fn lookup(&self, slot: u8) -> Result<Arc<VirtualDevice>> {
        let capacity = self.capacity();
        self.slots
            .get(slot as usize)
            .ok_or(BusError::SlotOutOfRange {
                slot: slot as usize,
                capacity,
            })?
            .clone()
            .ok_or(BusError::NotFound(slot))
    }

    /// Clear `slot`, returning whatever was bound there.
    pub fn unbind(&mut self, slot: u8) -> Option<Arc<VirtualDevice>> {
        self.slots.get_mut(slot as usize).and_then(Option::take)
    }

    /// Clear every slot, returning the devices in slot order.
    pub fn unbind_all(&mut self) -> Vec<Arc<VirtualDevice>> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    /// Bound devices in slot order.
    pub fn devices(&self) -> Vec<Arc<VirtualDevice>> {
        self.slots.iter().flatten().cloned().collect()
    }

    fn slot_mut(&mut self, slot: u8) -> Result<&mut Option<Arc<VirtualDevice>>> {
        let capacity = self.capacity();
        self.slots
            .get_mut(slot as usize)
            .ok_or(BusError::SlotOutOfRange {
                slot: slot as usize,
                capacity,
            })
    }
}
