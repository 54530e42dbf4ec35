use parking_lot::RwLock;

use crate::{
    api::RegionKind,
    error::{FabricLibError, Result},
};

/// A fixed-capacity, zero-initialized host memory region.
///
/// The region never grows. Every access is bounds-checked against the
/// capacity chosen at registration time.
pub struct HostRegion {
    kind: RegionKind,
    data: RwLock<Box<[u8]>>,
}

impl HostRegion {
    pub fn zeroed(kind: RegionKind, len: usize) -> Self {
        Self { kind, data: RwLock::new(vec![0u8; len].into_boxed_slice()) }
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, capacity: usize, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(FabricLibError::OutOfBounds {
                kind: self.kind,
                offset,
                len,
                capacity,
            }),
        }
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        self.check(data.len(), offset, bytes.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<()> {
        let mut data = self.data.write();
        self.check(data.len(), offset, len)?;
        data[offset..offset + len].fill(value);
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.with_slice(offset, len, |bytes| bytes.to_vec())
    }

    /// Run `f` over a borrowed view of `[offset, offset + len)`.
    pub fn with_slice<R>(
        &self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let data = self.data.read();
        self.check(data.len(), offset, len)?;
        Ok(f(&data[offset..offset + len]))
    }

    /// Run `f` over a mutable view of `[offset, offset + len)`. Transfers
    /// into the region wait until `f` returns.
    pub fn with_slice_mut<R>(
        &self,
        offset: usize,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let mut data = self.data.write();
        self.check(data.len(), offset, len)?;
        Ok(f(&mut data[offset..offset + len]))
    }

    pub fn read_i32(&self, offset: usize) -> Result<i32> {
        self.with_slice(offset, 4, |bytes| {
            i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        })
    }
}

impl std::fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegion")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish()
    }
}
