use agp_gart::sim::SimPlatform;
use agp_gart::{Aperture, ApertureRange, CacheType, EntryState, GartError, Intel440};
use agp_memory_addresses::{PageFrameNumber, PhysicalAddress};

const APERTURE: PhysicalAddress = PhysicalAddress::new(0xE000_0000);

fn aperture() -> Aperture<Intel440, SimPlatform> {
    let mut aperture = Aperture::new(Intel440, SimPlatform::intel440());
    let info = aperture.initialize().unwrap();
    assert_eq!(info.base, APERTURE);
    assert_eq!(info.pages(), 4096);
    aperture
}

fn assert_conserved(aperture: &Aperture<Intel440, SimPlatform>) {
    let counts = aperture.counts();
    assert_eq!(counts.total(), aperture.table().unwrap().len());
}

#[test]
fn packs_uncached_high_and_write_combined_low() {
    let mut aperture = aperture();

    let uc = aperture.reserve(100, CacheType::Uncached).unwrap();
    assert_eq!(uc.start(), 3996);
    assert_eq!(uc.memory_base(), Some(APERTURE.add_pages(3996)));

    let wc = aperture.reserve(50, CacheType::WriteCombined).unwrap();
    assert_eq!(wc.start(), 0);
    assert_eq!(wc.memory_base(), Some(APERTURE));

    let table = aperture.table().unwrap();
    assert_eq!(table.len(), 4096);
    let counts = aperture.counts();
    assert_eq!((counts.reserved, counts.free), (150, 3946));
}

#[test]
fn mapped_pages_read_back_in_order() {
    let mut aperture = aperture();
    let range = aperture.reserve(10, CacheType::WriteCombined).unwrap();
    let pages: Vec<_> = (0x1234..0x123E).map(PageFrameNumber::new).collect();

    let base = aperture.map_pages(&range, &pages, 0).unwrap();
    assert_eq!(base, APERTURE);
    assert_eq!(aperture.get_mapped_pages(&range, 10, 0).unwrap(), pages);
    assert_eq!(aperture.get_mapped_pages(&range, 4, 3).unwrap(), pages[3..7]);
    assert_conserved(&aperture);
}

#[test]
fn oversized_reservation_leaves_table_alone() {
    let mut aperture = aperture();
    let _held = aperture.reserve(100, CacheType::Uncached).unwrap();
    let before = aperture.counts();

    assert_eq!(
        aperture.reserve(4097, CacheType::Uncached).err(),
        Some(GartError::InsufficientResources)
    );
    assert_eq!(
        aperture.reserve(4000, CacheType::WriteCombined).err(),
        Some(GartError::InsufficientResources)
    );
    assert_eq!(aperture.counts(), before);
    assert_conserved(&aperture);
}

#[test]
fn oversized_first_reservation_creates_no_table() {
    let mut aperture = aperture();
    assert_eq!(
        aperture.reserve(5000, CacheType::WriteCombined).err(),
        Some(GartError::InsufficientResources)
    );
    assert!(aperture.table().is_none());
    assert_eq!(aperture.platform().contiguous_blocks(), 0);
}

#[test]
fn reservations_never_overlap() {
    let mut aperture = aperture();
    let mut ranges: Vec<ApertureRange> = Vec::new();
    let sizes = [7, 1, 33, 128, 2, 64, 5, 300, 17, 9];

    for (i, &pages) in sizes.iter().cycle().take(40).enumerate() {
        let cache = if i % 3 == 0 {
            CacheType::Uncached
        } else {
            CacheType::WriteCombined
        };
        ranges.push(aperture.reserve(pages, cache).unwrap());

        // Drop every fourth range again to fragment the table.
        if i % 4 == 3 {
            let mut range = ranges.swap_remove(i / 2 % ranges.len());
            aperture.release(&mut range);
        }
        assert_conserved(&aperture);
    }

    for (i, a) in ranges.iter().enumerate() {
        for b in &ranges[i + 1..] {
            let disjoint = a.indices().end <= b.start() || b.indices().end <= a.start();
            assert!(disjoint, "{a:?} overlaps {b:?}");
        }
    }
}

#[test]
fn successive_reservations_move_monotonically() {
    let mut aperture = aperture();

    let uc: Vec<_> = (0..5)
        .map(|_| aperture.reserve(10, CacheType::Uncached).unwrap().start())
        .collect();
    assert_eq!(uc, [4086, 4076, 4066, 4056, 4046]);

    let wc: Vec<_> = (0..5)
        .map(|_| aperture.reserve(10, CacheType::WriteCombined).unwrap().start())
        .collect();
    assert_eq!(wc, [0, 10, 20, 30, 40]);
}

#[test]
fn release_restores_free_entries() {
    let mut aperture = aperture();
    let mut range = aperture.reserve(25, CacheType::WriteCombined).unwrap();
    aperture.release(&mut range);

    assert!(!range.is_live());
    assert_eq!(range.memory_base(), None);
    let table = aperture.table().unwrap();
    assert!(range.indices().all(|i| table.entry(i).state == EntryState::Free));
    assert_eq!(aperture.counts().free, 4096);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "already released")]
fn second_release_is_a_programming_error() {
    let mut aperture = aperture();
    let mut range = aperture.reserve(4, CacheType::Uncached).unwrap();
    aperture.release(&mut range);
    aperture.release(&mut range);
}

#[test]
fn unmap_returns_entries_to_their_reservation() {
    let mut aperture = aperture();
    let range = aperture.reserve(6, CacheType::Uncached).unwrap();
    let pages: Vec<_> = (1..=3).map(PageFrameNumber::new).collect();
    aperture.map_pages(&range, &pages, 1).unwrap();

    // Unmapping the whole range is fine even though half of it is unmapped.
    aperture.unmap_pages(&range, 6, 0).unwrap();
    let table = aperture.table().unwrap();
    assert!(range.indices().all(|i| table.entry(i).state == EntryState::ReservedUncached));
    assert_eq!(
        aperture.get_mapped_pages(&range, 1, 1).err(),
        Some(GartError::InvalidParameter)
    );
}

#[test]
fn free_run_guides_incremental_mapping() {
    let mut aperture = aperture();
    let range = aperture.reserve(12, CacheType::WriteCombined).unwrap();
    aperture
        .map_pages(&range, &[PageFrameNumber::new(9); 4], 4)
        .unwrap();

    let first = aperture.find_free_run(&range, 12, 0);
    assert_eq!((first.offset, first.len), (0, 4));
    let second = aperture.find_free_run(&range, 12, 4);
    assert_eq!((second.offset, second.len), (8, 4));
    let none = aperture.find_free_run(&range, 4, 4);
    assert_eq!(none.len, 0);
}
