//! Device Routing Table payload schema.
//!
//! A discovery frame from the remote carries the table as big-endian words:
//!
//! ```text
//! header (32B): version u16 | magic u16 (0xC594) | device_count u32 | reserved (24B)
//! entry  (32B): device_id u16 | sub_id u16 | flags u32 | address u32 | size u32 | reserved (16B)
//! ```
//!
//! Entry `n` describes slot `n`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Size of the table header.
pub const DRT_HEADER_SIZE: usize = 32;

/// Size of one device entry.
pub const DRT_ENTRY_SIZE: usize = 32;

/// Slot identities are one byte on the wire.
pub const MAX_DRT_ENTRIES: usize = 256;

/// Identification word in every table header.
pub const DRT_MAGIC: u16 = 0xC594;

/// Table layout version produced by [`DeviceRoutingTable::encode`].
pub const DRT_VERSION: u16 = 1;

/// Entry flag: the device sits on the memory bus rather than the peripheral bus.
pub const FLAG_MEMORY_DEVICE: u32 = 0x0000_0001;

/// One device slot announced by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrtEntry {
    pub slot: u8,
    pub device_id: u16,
    pub sub_id: u16,
    pub flags: u32,
    pub address: u32,
    pub size: u32,
}

impl DrtEntry {
    /// Returns true if the device is on the memory bus.
    pub fn is_memory_device(&self) -> bool {
        self.flags & FLAG_MEMORY_DEVICE != 0
    }

    /// Returns true if both entries describe the same kind of device.
    pub fn same_identity(&self, other: &DrtEntry) -> bool {
        self.device_id == other.device_id && self.sub_id == other.sub_id
    }

    fn decode(slot: u8, src: &[u8]) -> Self {
        Self {
            slot,
            device_id: be_u16(src, 0),
            sub_id: be_u16(src, 2),
            flags: be_u32(src, 4),
            address: be_u32(src, 8),
            size: be_u32(src, 12),
        }
    }
}

/// A parsed routing table together with the raw bytes it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRoutingTable {
    version: u16,
    entries: Vec<DrtEntry>,
    raw: Bytes,
}

impl DeviceRoutingTable {
    /// Parse a discovery payload, rejecting tables with more than `max_devices` entries.
    ///
    /// `max_devices` is capped at [`MAX_DRT_ENTRIES`].
    pub fn parse(raw: Bytes, max_devices: usize) -> Result<Self> {
        let max_devices = max_devices.min(MAX_DRT_ENTRIES);
        if raw.len() < DRT_HEADER_SIZE {
            return Err(FrameError::DrtTruncated {
                len: raw.len(),
                min: DRT_HEADER_SIZE,
            });
        }

        let magic = be_u16(&raw, 2);
        if magic != DRT_MAGIC {
            return Err(FrameError::DrtMagic { found: magic });
        }

        let count = be_u32(&raw, 4) as usize;
        if count > max_devices {
            return Err(FrameError::TooManyDevices {
                count,
                max: max_devices,
            });
        }

        let expected = DRT_HEADER_SIZE + count * DRT_ENTRY_SIZE;
        if raw.len() != expected {
            return Err(FrameError::DrtLength {
                expected,
                actual: raw.len(),
            });
        }

        let entries = raw[DRT_HEADER_SIZE..]
            .chunks_exact(DRT_ENTRY_SIZE)
            .zip(0..=u8::MAX)
            .map(|(chunk, slot)| DrtEntry::decode(slot, chunk))
            .collect();

        Ok(Self {
            version: be_u16(&raw, 0),
            entries,
            raw,
        })
    }

    /// Build a table from entries; slots are reassigned by position.
    ///
    /// Entries past [`MAX_DRT_ENTRIES`] have no slot and are dropped.
    pub fn new(entries: impl IntoIterator<Item = DrtEntry>) -> Self {
        let entries: Vec<DrtEntry> = (0..=u8::MAX)
            .zip(entries)
            .map(|(slot, entry)| DrtEntry { slot, ..entry })
            .collect();
        let raw = encode_entries(DRT_VERSION, &entries);
        Self {
            version: DRT_VERSION,
            entries,
            raw,
        }
    }

    /// Wire encoding of this table.
    pub fn encode(&self) -> Bytes {
        self.raw.clone()
    }

    /// Table layout version reported by the remote.
    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn entries(&self) -> &[DrtEntry] {
        &self.entries
    }

    /// Entry for `slot`, if the table lists it.
    pub fn entry(&self, slot: u8) -> Option<&DrtEntry> {
        self.entries.get(slot as usize)
    }

    pub fn device_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if `slot` exists and is a memory-bus device.
    pub fn is_memory_device(&self, slot: u8) -> bool {
        self.entry(slot).is_some_and(DrtEntry::is_memory_device)
    }

    /// Sum of the sizes of all memory-bus devices.
    pub fn total_memory_size(&self) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.is_memory_device())
            .map(|entry| u64::from(entry.size))
            .sum()
    }

    /// Raw payload bytes as received.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

fn encode_entries(version: u16, entries: &[DrtEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(DRT_HEADER_SIZE + entries.len() * DRT_ENTRY_SIZE);
    buf.put_u16(version);
    buf.put_u16(DRT_MAGIC);
    buf.put_u32(entries.len() as u32);
    buf.put_bytes(0, DRT_HEADER_SIZE - 8);
    for entry in entries {
        buf.put_u16(entry.device_id);
        buf.put_u16(entry.sub_id);
        buf.put_u32(entry.flags);
        buf.put_u32(entry.address);
        buf.put_u32(entry.size);
        buf.put_bytes(0, DRT_ENTRY_SIZE - 16);
    }
    buf.freeze()
}

fn be_u16(src: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([src[at], src[at + 1]])
}

fn be_u32(src: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}
