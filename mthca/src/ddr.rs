//! Capacity allocator for the adapter's on-board (DDR) memory.
//!
//! The allocator carves named table areas out of the DDR extent according
//! to the computed profile. It keeps per-allocation accounting so that
//! every allocation is freed exactly once: a free that does not match an
//! outstanding allocation is an error, and outstanding allocations are
//! observable for leak checks at teardown.

use crate::error::{Error, Result};

/// One named byte-size request from the profile's DDR vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdrRequest {
    /// Hardware table name, e.g. `"qpc"`.
    pub name: &'static str,
    /// Requested size in bytes.
    pub size: u64,
    /// Required alignment in bytes, a power of two.
    pub align: u64,
}

/// A satisfied DDR request: the table's base address and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdrSlice {
    /// Hardware table name carried over from the request.
    pub name: &'static str,
    /// Base bus address of the area.
    pub addr: u64,
    /// Length of the area in bytes.
    pub len: u64,
}

/// Snapshot of allocator occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DdrQuery {
    /// Total managed bytes (excluding reserved areas).
    pub total: u64,
    /// Free bytes.
    pub free: u64,
    /// Largest single free chunk in bytes.
    pub largest_chunk: u64,
}

/// Region allocator over the on-board memory extent.
///
/// First-fit over a sorted free list with coalescing on free. Reserved
/// areas (the firmware's own footprint) are carved out up front and never
/// returned.
#[derive(Debug)]
pub struct DdrAllocator {
    total: u64,
    /// Sorted, non-adjacent `(addr, len)` free extents.
    free_list: Vec<(u64, u64)>,
    /// Outstanding `(addr, len)` allocations, for per-entry accounting.
    allocated: Vec<(u64, u64)>,
}

impl DdrAllocator {
    /// Create an allocator over `[base, base + size)`.
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            total: size,
            free_list: if size > 0 { vec![(base, size)] } else { Vec::new() },
            allocated: Vec::new(),
        }
    }

    /// Reserve `[base, base + len)` out of the free space.
    ///
    /// Reserved areas are not tracked as allocations and cannot be freed.
    ///
    /// # Errors
    /// `InvalidArgument` if the range is not wholly free.
    pub fn reserve(&mut self, base: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = base
            .checked_add(len)
            .ok_or(Error::InvalidArgument("reserve range overflows"))?;
        let idx = self
            .free_list
            .iter()
            .position(|&(a, l)| a <= base && end <= a + l)
            .ok_or(Error::InvalidArgument("reserve range not free"))?;
        let (chunk_addr, chunk_len) = self.free_list.remove(idx);
        if chunk_addr < base {
            self.free_list.insert(idx, (chunk_addr, base - chunk_addr));
        }
        let chunk_end = chunk_addr + chunk_len;
        if end < chunk_end {
            let pos = self
                .free_list
                .iter()
                .position(|&(a, _)| a > end)
                .unwrap_or(self.free_list.len());
            self.free_list.insert(pos, (end, chunk_end - end));
        }
        self.total -= len;
        Ok(())
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// # Errors
    /// `InvalidArgument` on a zero size or non-power-of-two alignment,
    /// `ResourceExhausted` when no free chunk fits.
    pub fn alloc(&mut self, size: u64, align: u64) -> Result<u64> {
        if size == 0 {
            return Err(Error::InvalidArgument("zero-size allocation"));
        }
        if align == 0 || !align.is_power_of_two() {
            return Err(Error::InvalidArgument("alignment not a power of two"));
        }
        for idx in 0..self.free_list.len() {
            let (addr, len) = self.free_list[idx];
            let aligned = (addr + align - 1) & !(align - 1);
            let pad = aligned - addr;
            if pad + size > len {
                continue;
            }
            self.free_list.remove(idx);
            // Leading pad and tail go back on the free list.
            if pad > 0 {
                self.free_list.insert(idx, (addr, pad));
            }
            let tail = len - pad - size;
            if tail > 0 {
                let pos = self
                    .free_list
                    .iter()
                    .position(|&(a, _)| a > aligned)
                    .unwrap_or(self.free_list.len());
                self.free_list.insert(pos, (aligned + size, tail));
            }
            self.allocated.push((aligned, size));
            return Ok(aligned);
        }
        Err(Error::ResourceExhausted)
    }

    /// Satisfy a whole request vector, all-or-nothing.
    ///
    /// On failure every allocation already made for the vector is freed
    /// again before the error is returned.
    ///
    /// # Errors
    /// As [`alloc`](DdrAllocator::alloc), for the first request that fails.
    pub fn alloc_vector(&mut self, requests: &[DdrRequest]) -> Result<Vec<DdrSlice>> {
        let mut slices = Vec::with_capacity(requests.len());
        for req in requests {
            match self.alloc(req.size, req.align) {
                Ok(addr) => slices.push(DdrSlice {
                    name: req.name,
                    addr,
                    len: req.size,
                }),
                Err(e) => {
                    for s in slices.iter().rev() {
                        // Just allocated above, so the free cannot fail.
                        let _ = self.free(s.addr, s.len);
                    }
                    return Err(e);
                }
            }
        }
        Ok(slices)
    }

    /// Free an allocation made by [`alloc`](DdrAllocator::alloc).
    ///
    /// # Errors
    /// `InvalidArgument` if `(addr, len)` does not match an outstanding
    /// allocation exactly (double free, bad address, or bad length).
    pub fn free(&mut self, addr: u64, len: u64) -> Result<()> {
        let idx = self
            .allocated
            .iter()
            .position(|&(a, l)| a == addr && l == len)
            .ok_or(Error::InvalidArgument("free does not match an allocation"))?;
        self.allocated.swap_remove(idx);
        let pos = self
            .free_list
            .iter()
            .position(|&(a, _)| a > addr)
            .unwrap_or(self.free_list.len());
        self.free_list.insert(pos, (addr, len));
        // Coalesce with the right neighbor, then the left.
        if pos + 1 < self.free_list.len() {
            let (next_addr, next_len) = self.free_list[pos + 1];
            if addr + len == next_addr {
                self.free_list[pos].1 += next_len;
                self.free_list.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (prev_addr, prev_len) = self.free_list[pos - 1];
            if prev_addr + prev_len == self.free_list[pos].0 {
                self.free_list[pos - 1].1 += self.free_list[pos].1;
                self.free_list.remove(pos);
            }
        }
        Ok(())
    }

    /// Occupancy snapshot.
    pub fn query(&self) -> DdrQuery {
        let free = self.free_list.iter().map(|&(_, l)| l).sum();
        let largest_chunk = self.free_list.iter().map(|&(_, l)| l).max().unwrap_or(0);
        DdrQuery {
            total: self.total,
            free,
            largest_chunk,
        }
    }

    /// Number of outstanding allocations. Zero after a clean teardown.
    pub fn outstanding(&self) -> usize {
        self.allocated.len()
    }
}
