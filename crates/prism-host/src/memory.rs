//! Device memory arena.

use std::collections::BTreeMap;

use bytemuck::Pod;
use prism_gpu::{BufferId, DevicePtr, GpuError, RawBuffer, Result};

/// First address handed out. Keeps small integers from aliasing real memory.
pub const BASE_ADDRESS: u64 = 0x1000;

/// Alignment of every allocation's base address.
pub const ALLOCATION_ALIGNMENT: u64 = 256;

#[derive(Debug)]
struct Allocation {
    id: BufferId,
    label: String,
    bytes: Vec<u8>,
}

/// Host memory addressed like device memory.
///
/// Addresses come from a bump pointer and are never reused, so a stale
/// pointer into freed memory fails with [`GpuError::OutOfBounds`] instead of
/// aliasing a newer allocation.
#[derive(Debug)]
pub struct HostMemory {
    allocations: BTreeMap<u64, Allocation>,
    next_address: u64,
    next_id: u64,
    bytes_allocated: u64,
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMemory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            allocations: BTreeMap::new(),
            next_address: BASE_ADDRESS,
            next_id: 1,
            bytes_allocated: 0,
        }
    }

    /// Reserve `bytes` of zeroed memory.
    pub fn alloc(&mut self, bytes: u64, label: &str) -> Result<RawBuffer> {
        let len = usize::try_from(bytes)
            .map_err(|_| GpuError::AllocationFailed(format!("{bytes} bytes for '{label}'")))?;

        let address = self.next_address;
        let span = align_up(bytes.max(1), ALLOCATION_ALIGNMENT);
        self.next_address = address
            .checked_add(span)
            .ok_or_else(|| GpuError::AllocationFailed("address space exhausted".to_string()))?;

        let id = BufferId(self.next_id);
        self.next_id += 1;

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(len)
            .map_err(|e| GpuError::AllocationFailed(format!("'{label}': {e}")))?;
        storage.resize(len, 0);

        self.allocations.insert(
            address,
            Allocation {
                id,
                label: label.to_string(),
                bytes: storage,
            },
        );
        self.bytes_allocated += bytes;

        Ok(RawBuffer {
            id,
            ptr: DevicePtr(address),
            size: bytes,
        })
    }

    /// Release an allocation.
    pub fn free(&mut self, buffer: RawBuffer) -> Result<()> {
        match self.allocations.get(&buffer.ptr.as_u64()) {
            Some(allocation) if allocation.id == buffer.id => {}
            _ => return Err(GpuError::InvalidHandle(format!("buffer {:?}", buffer.id))),
        }
        if let Some(allocation) = self.allocations.remove(&buffer.ptr.as_u64()) {
            tracing::trace!("Freed '{}' at {}", allocation.label, buffer.ptr);
            self.bytes_allocated -= allocation.bytes.len() as u64;
        }
        Ok(())
    }

    /// Whether `buffer` is a live allocation of this arena.
    #[must_use]
    pub fn is_live(&self, buffer: &RawBuffer) -> bool {
        self.allocations
            .get(&buffer.ptr.as_u64())
            .is_some_and(|allocation| allocation.id == buffer.id)
    }

    /// Number of live allocations.
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Total bytes held by live allocations.
    #[must_use]
    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated
    }

    /// Borrow `len` bytes starting at `address`.
    pub fn slice(&self, address: DevicePtr, len: usize) -> Result<&[u8]> {
        let (base, allocation) = self.locate(address, len)?;
        let start = (address.as_u64() - base) as usize;
        Ok(&allocation.bytes[start..start + len])
    }

    /// Mutably borrow `len` bytes starting at `address`.
    pub fn slice_mut(&mut self, address: DevicePtr, len: usize) -> Result<&mut [u8]> {
        let (base, _) = self.locate(address, len)?;
        let start = (address.as_u64() - base) as usize;
        let allocation = self
            .allocations
            .get_mut(&base)
            .ok_or(GpuError::OutOfBounds {
                address: address.as_u64(),
                len,
            })?;
        Ok(&mut allocation.bytes[start..start + len])
    }

    pub fn write(&mut self, dst: DevicePtr, data: &[u8]) -> Result<()> {
        self.slice_mut(dst, data.len())?.copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, src: DevicePtr, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self.slice(src, out.len())?);
        Ok(())
    }

    /// Read one plain value at a possibly unaligned address.
    pub fn read_pod<T: Pod>(&self, src: DevicePtr) -> Result<T> {
        let bytes = self.slice(src, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Copy the element at `index` of a packed `T` array.
    pub fn read_element<T: Pod>(&self, base: DevicePtr, index: u64) -> Result<T> {
        let stride = std::mem::size_of::<T>() as u64;
        self.read_pod(base.offset(index * stride))
    }

    /// Allocation containing `[address, address + len)` and its base.
    fn locate(&self, address: DevicePtr, len: usize) -> Result<(u64, &Allocation)> {
        let out_of_bounds = || GpuError::OutOfBounds {
            address: address.as_u64(),
            len,
        };
        let (&base, allocation) = self
            .allocations
            .range(..=address.as_u64())
            .next_back()
            .ok_or_else(out_of_bounds)?;

        let end = (address.as_u64() - base)
            .checked_add(len as u64)
            .ok_or_else(out_of_bounds)?;
        if end > allocation.bytes.len() as u64 {
            return Err(out_of_bounds());
        }
        Ok((base, allocation))
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two).
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}
