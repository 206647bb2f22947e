use agp_gart::sim::{ConfigWrite, SimPlatform};
use agp_gart::{
    Agp35, Aperture, CacheType, Gart35Pte, Gart64Pte, GartError, Intel440, SpecialTargetFlags,
};
use agp_memory_addresses::{PageFrameNumber, PhysicalAddress};
use agp_registers::{AgpBus, AgpCtrl440, ApertureSize, ExtendedTargetRegister, NbxCfg};

fn intel440(flags: SpecialTargetFlags) -> Aperture<Intel440, SimPlatform> {
    let mut aperture =
        Aperture::new(Intel440, SimPlatform::intel440()).with_special_target(flags);
    aperture.initialize().unwrap();
    aperture
}

fn hardware_enabled(aperture: &mut Aperture<Intel440, SimPlatform>) -> bool {
    aperture.platform_mut().load::<NbxCfg>().unwrap().aperture_enable()
}

fn gtlb_enabled(aperture: &mut Aperture<Intel440, SimPlatform>) -> bool {
    aperture.platform_mut().load::<AgpCtrl440>().unwrap().gtlb_enable()
}

#[test]
fn query_lists_smaller_sizes() {
    let mut aperture = intel440(SpecialTargetFlags::new());
    let info = aperture.query_aperture().unwrap();
    assert_eq!(info.base, PhysicalAddress::new(0xE000_0000));
    assert_eq!(info.size, ApertureSize::Mb16);
    assert_eq!(
        info.alternatives,
        [ApertureSize::Mb16, ApertureSize::Mb8, ApertureSize::Mb4]
    );
}

#[test]
fn set_aperture_moves_and_resizes() {
    let mut aperture = intel440(SpecialTargetFlags::new());
    aperture
        .set_aperture(PhysicalAddress::new(0xD000_0000), 2048)
        .unwrap();

    let info = aperture.query_aperture().unwrap();
    assert_eq!(info.base, PhysicalAddress::new(0xD000_0000));
    assert_eq!(info.size, ApertureSize::Mb8);
    assert_eq!(aperture.base(), info.base);
    assert_eq!(aperture.size(), Some(ApertureSize::Mb8));
}

#[test]
fn set_aperture_rejects_bad_requests() {
    let mut aperture = intel440(SpecialTargetFlags::new());
    let base = PhysicalAddress::new(0xE000_0000);

    assert_eq!(aperture.set_aperture(base, 3000), Err(GartError::InvalidParameter));
    // 512 MiB is beyond the 440.
    assert_eq!(aperture.set_aperture(base, 131_072), Err(GartError::InvalidParameter));
    assert_eq!(
        aperture.set_aperture(PhysicalAddress::new(0xE080_0000), 4096),
        Err(GartError::InvalidParameter)
    );
    assert_eq!(aperture.size(), Some(ApertureSize::Mb16));
}

#[test]
fn existing_table_pins_the_size() {
    let mut aperture = intel440(SpecialTargetFlags::new());
    let _range = aperture.reserve(4, CacheType::Uncached).unwrap();
    let table_base = aperture.table().unwrap().physical_base();

    assert_eq!(
        aperture.set_aperture(PhysicalAddress::new(0xD000_0000), 2048),
        Err(GartError::InvalidDeviceState)
    );

    aperture.platform_mut().clear_writes();
    aperture
        .set_aperture(PhysicalAddress::new(0xD000_0000), 4096)
        .unwrap();
    let attbase = ConfigWrite::Config {
        offset: 0xB8,
        len: 4,
        value: u32::try_from(table_base.as_u64()).unwrap(),
    };
    assert!(aperture.platform().writes().contains(&attbase));
}

#[test]
fn reserve_needs_a_known_aperture() {
    let mut aperture = Aperture::new(Intel440, SimPlatform::intel440());
    assert_eq!(
        aperture.reserve(1, CacheType::Uncached).err(),
        Some(GartError::InvalidDeviceState)
    );
}

#[test]
fn first_map_turns_the_aperture_on() {
    let mut aperture = intel440(SpecialTargetFlags::new());
    let range = aperture.reserve(2, CacheType::WriteCombined).unwrap();
    assert!(!aperture.is_enabled());
    assert!(!hardware_enabled(&mut aperture));

    aperture.map_pages(&range, &[PageFrameNumber::new(1)], 0).unwrap();
    assert!(aperture.is_enabled());
    assert!(hardware_enabled(&mut aperture));
    assert!(gtlb_enabled(&mut aperture));

    aperture.disable_aperture().unwrap();
    assert!(!aperture.is_enabled());
    assert!(!hardware_enabled(&mut aperture));
    assert!(aperture.table().is_none());
    assert_eq!(aperture.platform().contiguous_blocks(), 0);
}

#[test]
fn sticky_aperture_enable() {
    let mut aperture = intel440(SpecialTargetFlags::new().with_no_aperture_disable(true));
    let range = aperture.reserve(2, CacheType::WriteCombined).unwrap();
    aperture.map_pages(&range, &[PageFrameNumber::new(1)], 0).unwrap();

    aperture.disable_aperture().unwrap();
    assert!(aperture.is_enabled());
    assert!(hardware_enabled(&mut aperture));
    assert!(aperture.table().is_none());
}

#[test]
fn gtlb_stays_off_when_asked() {
    let mut aperture = intel440(SpecialTargetFlags::new().with_via_disable_gtlb(true));
    assert!(!gtlb_enabled(&mut aperture));

    let range = aperture.reserve(2, CacheType::Uncached).unwrap();
    aperture.map_pages(&range, &[PageFrameNumber::new(1)], 0).unwrap();
    aperture.unmap_pages(&range, 1, 0).unwrap();
    assert!(!gtlb_enabled(&mut aperture));
}

#[test]
fn coherent_memory_needs_target_support() {
    let mut aperture = intel440(SpecialTargetFlags::new());
    assert_eq!(
        aperture.reserve(1, CacheType::Coherent).err(),
        Some(GartError::NotSupported)
    );

    let mut agp35 = Aperture::new(Agp35::<Gart35Pte>::default(), SimPlatform::agp35(false));
    agp35.initialize().unwrap();
    let range = agp35.reserve(1, CacheType::Coherent).unwrap();
    assert_eq!(range.cache_type(), CacheType::Coherent);
}

#[test]
fn agp35_rejects_agp2_targets() {
    let mut aperture = Aperture::new(Agp35::<Gart35Pte>::default(), SimPlatform::intel440());
    assert_eq!(aperture.initialize().err(), Some(GartError::NotSupported));
}

#[test]
fn intel440_rejects_agp3_targets() {
    let mut aperture = Aperture::new(Intel440, SimPlatform::agp35(false));
    assert_eq!(aperture.initialize().err(), Some(GartError::NotSupported));
}

#[test]
fn gart64_needs_target_support() {
    let mut aperture = Aperture::new(Agp35::<Gart64Pte>::default(), SimPlatform::agp35(false));
    assert_eq!(aperture.initialize().err(), Some(GartError::NotSupported));

    let mut aperture = Aperture::new(Agp35::<Gart64Pte>::default(), SimPlatform::agp35(true));
    aperture.initialize().unwrap();
    assert!(aperture.platform_mut().target_mut().command.gart64());

    aperture.platform_mut().clear_writes();
    let _range = aperture.reserve(1, CacheType::WriteCombined).unwrap();
    let table = aperture.table().unwrap();
    assert_eq!(table.len(), 4096);
    let (low, high) = table.physical_base().split_u32();
    let writes = aperture.platform().writes();
    assert!(writes.contains(&ConfigWrite::Extended {
        reg: ExtendedTargetRegister::GartLow,
        value: low
    }));
    assert!(writes.contains(&ConfigWrite::Extended {
        reg: ExtendedTargetRegister::GartHigh,
        value: high
    }));
}

#[test]
fn table_out_of_chipset_reach_is_refused() {
    let mut aperture = intel440(SpecialTargetFlags::new());
    aperture
        .platform_mut()
        .place_blocks_at(PhysicalAddress::new(0xFFFF_F000));
    assert_eq!(
        aperture.reserve(1, CacheType::Uncached).err(),
        Some(GartError::InsufficientResources)
    );
    assert!(aperture.table().is_none());
    assert_eq!(aperture.platform().contiguous_blocks(), 0);
}

#[test]
fn ranges_die_with_their_table() {
    let mut aperture = intel440(SpecialTargetFlags::new());
    let mut old = aperture.reserve(100, CacheType::Uncached).unwrap();
    assert_eq!(old.start(), 3996);

    aperture.disable_aperture().unwrap();
    aperture
        .set_aperture(PhysicalAddress::new(0xE000_0000), 1024)
        .unwrap();
    let current = aperture.reserve(1, CacheType::Uncached).unwrap();
    assert_eq!(aperture.table().unwrap().len(), 1024);

    let page = [PageFrameNumber::new(1)];
    assert_eq!(aperture.map_pages(&old, &page, 0), Err(GartError::InvalidParameter));
    assert_eq!(aperture.unmap_pages(&old, 1, 0), Err(GartError::InvalidParameter));
    assert_eq!(aperture.get_mapped_pages(&old, 1, 0), Err(GartError::InvalidParameter));
    assert_eq!(aperture.find_free_run(&old, 100, 0).len, 0);

    aperture.release(&mut old);
    assert!(!old.is_live());
    assert_eq!(aperture.counts().reserved, 1);
    assert_eq!(aperture.map_pages(&current, &page, 0).unwrap(), current.memory_base().unwrap());
}

#[test]
fn same_sized_table_does_not_adopt_old_ranges() {
    let mut aperture = intel440(SpecialTargetFlags::new());
    let old = aperture.reserve(8, CacheType::WriteCombined).unwrap();

    aperture.disable_aperture().unwrap();
    let fresh = aperture.reserve(8, CacheType::WriteCombined).unwrap();
    assert_eq!(fresh.start(), old.start());

    let pages: Vec<_> = (0x10..0x18).map(PageFrameNumber::new).collect();
    assert_eq!(aperture.map_pages(&old, &pages, 0), Err(GartError::InvalidParameter));
    assert_eq!(aperture.find_free_run(&old, 8, 0).len, 0);
    assert_eq!(aperture.counts().mapped, 0);

    aperture.map_pages(&fresh, &pages, 0).unwrap();
    assert_eq!(aperture.get_mapped_pages(&fresh, 8, 0).unwrap(), pages);
}

#[test]
fn releasing_after_disable_only_retires_the_range() {
    let mut aperture = intel440(SpecialTargetFlags::new());
    let mut range = aperture.reserve(4, CacheType::Uncached).unwrap();
    aperture.disable_aperture().unwrap();

    aperture.release(&mut range);
    assert!(!range.is_live());
    assert!(aperture.table().is_none());
}
