//! A deterministic in-memory platform.
//!
//! [`SimPlatform`] stands in for the PCI configuration space of an AGP
//! master/target pair, the contiguous allocator that backs the GART, and the
//! page allocator that backs committed memory. Faults can be injected into
//! every allocator, and [`scribble`](SimPlatform::scribble) corrupts GART
//! memory behind the table's back.

use crate::entry::CacheType;
use crate::platform::{ContiguousAlloc, ContiguousBlock, PageAlloc};
use agp_memory_addresses::{PAGE_SIZE, PageFrameNumber, PhysicalAddress};
use agp_registers::rate::{RATE_1X, RATE_2X, RATE_4X};
use agp_registers::{
    AgpBus, AgpCapability, AgpCommand, AgpStatus, ApertureSize, BusError, ExtendedTargetRegister,
};
use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ptr::{self, NonNull};

const CONFIG_SPACE: usize = 256;
const APERTURE_BASE: u32 = 0xE000_0000;
const FIRST_BLOCK: u64 = 0x1000_0000;
const FIRST_PFN: u64 = 0x8_0000;

/// A write that reached the simulated hardware.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigWrite {
    Config { offset: u16, len: usize, value: u32 },
    Extended { reg: ExtendedTargetRegister, value: u32 },
    TargetCommand(AgpCommand),
    MasterCommand(AgpCommand),
}

struct Block {
    virt: NonNull<u8>,
    layout: Layout,
}

pub struct SimPlatform {
    config: [u8; CONFIG_SPACE],
    target: AgpCapability,
    master: AgpCapability,
    extended: Option<[u32; 4]>,
    writes: Vec<ConfigWrite>,
    write_budget: Option<usize>,

    blocks: BTreeMap<u64, Block>,
    next_phys: u64,
    contiguous_calls: usize,
    fail_contiguous_call: Option<usize>,
    fail_contiguous_above: Option<usize>,

    next_pfn: u64,
    free_pfns: Vec<PageFrameNumber>,
    outstanding_pages: usize,
    page_budget: Option<usize>,
}

// Safety: the blocks are owned allocations, only reachable through `&mut self`
// or through the `ContiguousBlock` handles handed out, which are `Send`.
unsafe impl Send for SimPlatform {}

impl SimPlatform {
    fn with_capabilities(target: AgpCapability, master: AgpCapability) -> Self {
        Self {
            config: [0; CONFIG_SPACE],
            target,
            master,
            extended: None,
            writes: Vec::new(),
            write_budget: None,
            blocks: BTreeMap::new(),
            next_phys: FIRST_BLOCK,
            contiguous_calls: 0,
            fail_contiguous_call: None,
            fail_contiguous_above: None,
            next_pfn: FIRST_PFN,
            free_pfns: Vec::new(),
            outstanding_pages: 0,
            page_budget: None,
        }
    }

    const fn agp2_status() -> AgpStatus {
        AgpStatus::new()
            .with_rate(RATE_1X | RATE_2X | RATE_4X)
            .with_side_band_addressing(true)
            .with_calibration_cycle(2)
            .with_async_request_size(1)
            .with_request_queue_depth_maximum(0x1F)
    }

    /// An Intel 440 target with a 16 MiB aperture at `0xE000_0000`.
    #[must_use]
    pub fn intel440() -> Self {
        let status = Self::agp2_status();
        let mut sim = Self::with_capabilities(
            AgpCapability::new(status, AgpCommand::new()),
            AgpCapability::new(status.with_request_queue_depth_maximum(0x0F), AgpCommand::new()),
        );
        // 32-bit prefetchable memory BAR.
        sim.poke(0x10, &(APERTURE_BASE | 0x8).to_le_bytes());
        sim.set_aperture_size(ApertureSize::Mb16);
        sim
    }

    /// An AGP 3.5 target in AGP 3.0 signalling with a 16 MiB aperture,
    /// advertising 64-bit GART entries if `gart64`.
    #[must_use]
    pub fn agp35(gart64: bool) -> Self {
        let status = Self::agp2_status()
            .with_agp3_mode(true)
            .with_rate(0b011)
            .with_fast_write(true)
            .with_ita_coherent(true)
            .with_gart64(gart64);
        let mut sim = Self::with_capabilities(
            AgpCapability::new(status, AgpCommand::new()),
            AgpCapability::new(status.with_ita_coherent(false), AgpCommand::new()),
        );
        // 64-bit prefetchable memory BAR.
        sim.poke(0x10, &(APERTURE_BASE | 0xC).to_le_bytes());
        sim.extended = Some([0; 4]);
        sim.set_aperture_size(ApertureSize::Mb16);
        sim
    }

    /// Program the aperture size register the way firmware would.
    ///
    /// # Panics
    /// If the size has no Intel 440 encoding on a 440 platform.
    pub fn set_aperture_size(&mut self, size: ApertureSize) {
        match &mut self.extended {
            Some(regs) => regs[1] = u32::from(size.to_agp3()),
            None => {
                let Some(raw) = size.to_i440() else {
                    panic!("{size:?} aperture not supported by the 440");
                };
                self.config[0xB4] = raw;
            }
        }
    }

    fn poke(&mut self, offset: usize, bytes: &[u8]) {
        self.config[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub const fn target_mut(&mut self) -> &mut AgpCapability {
        &mut self.target
    }

    pub const fn master_mut(&mut self) -> &mut AgpCapability {
        &mut self.master
    }

    /// Every write since construction or the last [`clear_writes`](Self::clear_writes).
    #[must_use]
    pub fn writes(&self) -> &[ConfigWrite] {
        &self.writes
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    /// Accept at most `writes` more configuration space writes, then reject
    /// them with [`BusError::Rejected`]; `None` lifts the limit.
    pub const fn set_write_budget(&mut self, writes: Option<usize>) {
        self.write_budget = writes;
    }

    /// Fail the `n`-th (1-based) contiguous allocation from now on.
    pub fn fail_contiguous_call(&mut self, n: usize) {
        self.fail_contiguous_call = Some(self.contiguous_calls + n);
    }

    /// Fail every contiguous allocation larger than `bytes`.
    pub const fn fail_contiguous_above(&mut self, bytes: usize) {
        self.fail_contiguous_above = Some(bytes);
    }

    /// Hand out the next contiguous blocks starting at `phys`.
    pub const fn place_blocks_at(&mut self, phys: PhysicalAddress) {
        self.next_phys = phys.as_u64();
    }

    /// Grant at most `pages` more pages in total; `None` lifts the limit.
    pub const fn set_page_budget(&mut self, pages: Option<usize>) {
        self.page_budget = pages;
    }

    #[must_use]
    pub fn contiguous_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Pages handed out and not yet returned.
    #[must_use]
    pub const fn outstanding_pages(&self) -> usize {
        self.outstanding_pages
    }

    /// Overwrite contiguous memory at `phys` without going through any table.
    ///
    /// # Panics
    /// If `phys..phys + bytes.len()` is not inside one live block.
    pub fn scribble(&mut self, phys: PhysicalAddress, bytes: &[u8]) {
        let at = phys.as_u64();
        let Some((&start, block)) = self.blocks.range(..=at).next_back() else {
            panic!("scribble at {phys} outside any block");
        };
        let offset = usize::try_from(at - start).unwrap_or(usize::MAX);
        assert!(
            offset.saturating_add(bytes.len()) <= block.layout.size(),
            "scribble runs past the end of the block"
        );
        // Safety: bounds checked above, the block is live.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), block.virt.as_ptr().add(offset), bytes.len());
        }
    }

    fn check_range(offset: u16, len: usize) -> Result<usize, BusError> {
        let start = usize::from(offset);
        if start + len > CONFIG_SPACE {
            return Err(BusError::OutOfRange { offset, len });
        }
        Ok(start)
    }
}

impl Drop for SimPlatform {
    fn drop(&mut self) {
        for block in core::mem::take(&mut self.blocks).into_values() {
            // Safety: allocated with this layout and never freed.
            unsafe { dealloc(block.virt.as_ptr(), block.layout) };
        }
    }
}

impl AgpBus for SimPlatform {
    fn read_target_config(&mut self, offset: u16, buf: &mut [u8]) -> Result<(), BusError> {
        let start = Self::check_range(offset, buf.len())?;
        buf.copy_from_slice(&self.config[start..start + buf.len()]);
        Ok(())
    }

    fn write_target_config(&mut self, offset: u16, buf: &[u8]) -> Result<(), BusError> {
        let start = Self::check_range(offset, buf.len())?;
        if let Some(budget) = &mut self.write_budget {
            if *budget == 0 {
                return Err(BusError::Rejected);
            }
            *budget -= 1;
        }
        self.config[start..start + buf.len()].copy_from_slice(buf);
        let mut value = [0u8; 4];
        let n = buf.len().min(4);
        value[..n].copy_from_slice(&buf[..n]);
        self.writes.push(ConfigWrite::Config {
            offset,
            len: buf.len(),
            value: u32::from_le_bytes(value),
        });
        Ok(())
    }

    fn target_capability(&mut self) -> Result<AgpCapability, BusError> {
        Ok(self.target)
    }

    fn master_capability(&mut self) -> Result<AgpCapability, BusError> {
        Ok(self.master)
    }

    fn set_target_capability(&mut self, cap: &AgpCapability) -> Result<(), BusError> {
        self.target.command = cap.command;
        self.writes.push(ConfigWrite::TargetCommand(cap.command));
        Ok(())
    }

    fn set_master_capability(&mut self, cap: &AgpCapability) -> Result<(), BusError> {
        self.master.command = cap.command;
        self.writes.push(ConfigWrite::MasterCommand(cap.command));
        Ok(())
    }

    fn extended_target(&mut self, reg: ExtendedTargetRegister) -> Result<u32, BusError> {
        let regs = self.extended.ok_or(BusError::NoCapability)?;
        Ok(regs[extended_index(reg)])
    }

    fn set_extended_target(
        &mut self,
        reg: ExtendedTargetRegister,
        value: u32,
    ) -> Result<(), BusError> {
        let regs = self.extended.as_mut().ok_or(BusError::NoCapability)?;
        regs[extended_index(reg)] = value;
        self.writes.push(ConfigWrite::Extended { reg, value });
        Ok(())
    }
}

const fn extended_index(reg: ExtendedTargetRegister) -> usize {
    match reg {
        ExtendedTargetRegister::Control => 0,
        ExtendedTargetRegister::ApertureSize => 1,
        ExtendedTargetRegister::GartLow => 2,
        ExtendedTargetRegister::GartHigh => 3,
    }
}

// Safety: blocks are zeroed, page aligned, exclusively owned by the handle
// until freed, and their simulated physical ranges never overlap.
unsafe impl ContiguousAlloc for SimPlatform {
    fn allocate_contiguous(&mut self, bytes: usize, _cache: CacheType) -> Option<ContiguousBlock> {
        self.contiguous_calls += 1;
        if self.fail_contiguous_call == Some(self.contiguous_calls) {
            return None;
        }
        if self.fail_contiguous_above.is_some_and(|limit| bytes > limit) {
            return None;
        }

        let page = usize::try_from(PAGE_SIZE).ok()?;
        let len = bytes.checked_next_multiple_of(page)?;
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, page).ok()?;
        // Safety: the layout has a non-zero size.
        let virt = NonNull::new(unsafe { alloc_zeroed(layout) })?;

        let phys = self.next_phys;
        self.next_phys += len as u64;
        self.blocks.insert(phys, Block { virt, layout });

        // Safety: see the impl-level comment.
        Some(unsafe { ContiguousBlock::new(virt, PhysicalAddress::new(phys), len) })
    }

    unsafe fn free_contiguous(&mut self, block: ContiguousBlock) {
        let owned = self.blocks.remove(&block.phys().as_u64());
        debug_assert!(owned.is_some(), "freeing a block this platform never handed out");
        if let Some(owned) = owned {
            debug_assert_eq!(owned.virt, block.virt());
            // Safety: allocated by us with this layout.
            unsafe { dealloc(owned.virt.as_ptr(), owned.layout) };
        }
    }
}

impl PageAlloc for SimPlatform {
    fn allocate_pages(&mut self, count: usize) -> Vec<PageFrameNumber> {
        let grant = self.page_budget.map_or(count, |budget| budget.min(count));
        if let Some(budget) = &mut self.page_budget {
            *budget -= grant;
        }

        let mut pages = Vec::with_capacity(grant);
        for _ in 0..grant {
            let page = if let Some(page) = self.free_pfns.pop() {
                page
            } else {
                let page = PageFrameNumber::new(self.next_pfn);
                self.next_pfn += 1;
                page
            };
            pages.push(page);
        }
        self.outstanding_pages += grant;
        pages
    }

    fn free_pages(&mut self, pages: &[PageFrameNumber]) {
        debug_assert!(pages.len() <= self.outstanding_pages);
        self.outstanding_pages = self.outstanding_pages.saturating_sub(pages.len());
        if let Some(budget) = &mut self.page_budget {
            *budget += pages.len();
        }
        self.free_pfns.extend_from_slice(pages);
    }
}
