//! Guard regions at both ends of the GART.
//!
//! Guard entries never satisfy [`GartEntry::is_free`], so the allocator can
//! not hand them out and a DMA engine running off either end of a valid
//! range hits a guard slot instead of somebody else's pages.

use crate::entry::{EntryState, GartEntry, PteFormat};
use crate::table::GartTable;
use crate::verifier::VerifierState;

/// Mark the outer quarter of the table on each end as guard.
///
/// Returns the number of guard entries at each end.
pub(crate) fn install<F: PteFormat>(table: &mut GartTable<F>, verifier: &VerifierState) -> usize {
    let len = table.len();
    let quarter = len / 4;
    let guard = GartEntry::unmapped(EntryState::Guard, verifier);
    for offset in 0..quarter {
        table.store(offset, guard, verifier);
        table.store(len - 1 - offset, guard, verifier);
    }
    quarter
}

#[cfg(test)]
mod tests {
    use crate::entry::{CacheType, EntryState, Gart32Pte};
    use crate::sim::SimPlatform;
    use crate::table::GartTable;
    use crate::verifier::{VerifierFlags, VerifierState};
    use agp_memory_addresses::{PageFrameNumber, PhysicalAddress};

    #[test]
    fn guard_borders_are_never_allocated() {
        let mut sim = SimPlatform::intel440();
        let mut v = VerifierState::disabled();
        v.arm(VerifierFlags::new().with_guard(true), PageFrameNumber::new(0x42))
            .unwrap();
        let mut t = GartTable::<Gart32Pte>::create(&mut sim, 4 * 1024 * 1024, u64::MAX, &mut v)
            .unwrap();

        let counts = t.counts();
        assert_eq!(counts.guard, 512);
        assert_eq!(counts.free, 512);
        assert_eq!(t.entry(255).state, EntryState::Guard);
        assert_eq!(t.entry(256).state, EntryState::Free);
        assert_eq!(t.entry(767).state, EntryState::Free);
        assert_eq!(t.entry(768).state, EntryState::Guard);

        let base = PhysicalAddress::new(0xE000_0000);
        let uc = t.reserve(16, CacheType::Uncached, base, &v).unwrap();
        let wc = t.reserve(16, CacheType::WriteCombined, base, &v).unwrap();
        assert_eq!(uc.start(), 768 - 16);
        assert_eq!(wc.start(), 256);
        assert_eq!(
            t.reserve(1024, CacheType::Uncached, base, &v).err(),
            Some(crate::GartError::InsufficientResources)
        );
        unsafe { t.destroy(&mut sim) };
    }
}
