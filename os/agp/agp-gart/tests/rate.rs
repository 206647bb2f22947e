use agp_gart::sim::{ConfigWrite, SimPlatform};
use agp_gart::{Agp35, Aperture, CacheType, GartError, Intel440, SpecialTargetFlags};
use agp_registers::AgpCommand;

fn command_writes(sim: &SimPlatform) -> Vec<ConfigWrite> {
    sim.writes()
        .iter()
        .copied()
        .filter(|w| matches!(w, ConfigWrite::TargetCommand(_) | ConfigWrite::MasterCommand(_)))
        .collect()
}

fn enabled(write: &ConfigWrite) -> bool {
    match write {
        ConfigWrite::TargetCommand(c) | ConfigWrite::MasterCommand(c) => c.agp_enable(),
        _ => false,
    }
}

fn target_command(aperture: &mut Aperture<Intel440, SimPlatform>) -> AgpCommand {
    aperture.platform_mut().target_mut().command
}

fn master_command(aperture: &mut Aperture<Intel440, SimPlatform>) -> AgpCommand {
    aperture.platform_mut().master_mut().command
}

#[test]
fn initialize_picks_the_fastest_common_rate() {
    let mut aperture = Aperture::new(Intel440, SimPlatform::intel440());
    aperture.initialize().unwrap();

    let target = target_command(&mut aperture);
    let master = master_command(&mut aperture);
    assert_eq!((target.rate(), master.rate()), (4, 4));
    assert!(target.agp_enable() && master.agp_enable());
    assert!(target.sba_enable() && master.sba_enable());
    assert!(!target.fast_write_enable());
    // Master queue depth follows the target, calibration is the minimum.
    assert_eq!(master.request_queue_depth(), 0x1F);
    assert_eq!(master.async_request_size(), 1);
    assert_eq!(target.calibration_cycle(), 2);
}

#[test]
fn forced_rate_at_startup() {
    let mut aperture = Aperture::new(Intel440, SimPlatform::intel440())
        .with_special_target(SpecialTargetFlags::new().with_set_rate(2));
    aperture.initialize().unwrap();
    assert_eq!(target_command(&mut aperture).rate(), 2);
}

#[test]
fn quirks_mask_rates_and_sideband() {
    let mut aperture = Aperture::new(Intel440, SimPlatform::intel440())
        .with_special_target(SpecialTargetFlags::new().with_no_4x(true).with_no_sba(true));
    aperture.initialize().unwrap();

    let target = target_command(&mut aperture);
    assert_eq!(target.rate(), 2);
    assert!(!target.sba_enable());
}

#[test]
fn devices_are_disabled_before_reprogramming() {
    let mut aperture = Aperture::new(Intel440, SimPlatform::intel440());
    aperture.initialize().unwrap();
    aperture.platform_mut().clear_writes();

    aperture.set_rate(2).unwrap();
    let writes = command_writes(aperture.platform());
    assert_eq!(writes.len(), 4);
    assert!(matches!(writes[0], ConfigWrite::TargetCommand(c) if !c.agp_enable()));
    assert!(matches!(writes[1], ConfigWrite::MasterCommand(c) if !c.agp_enable()));
    assert!(matches!(writes[2], ConfigWrite::TargetCommand(c) if c.agp_enable() && c.rate() == 2));
    assert!(matches!(writes[3], ConfigWrite::MasterCommand(c) if c.agp_enable() && c.rate() == 2));
}

#[test]
fn reverse_init_programs_the_master_first() {
    let mut aperture = Aperture::new(Intel440, SimPlatform::intel440())
        .with_special_target(SpecialTargetFlags::new().with_reverse_init(true));
    aperture.initialize().unwrap();
    aperture.platform_mut().clear_writes();

    aperture.set_rate(1).unwrap();
    let writes = command_writes(aperture.platform());
    assert!(matches!(writes[0], ConfigWrite::TargetCommand(_)));
    assert!(matches!(writes[1], ConfigWrite::MasterCommand(_)));
    assert!(matches!(writes[2], ConfigWrite::MasterCommand(c) if c.rate() == 1));
    assert!(matches!(writes[3], ConfigWrite::TargetCommand(c) if c.rate() == 1));
}

#[test]
fn via_patch_swaps_encodings() {
    let mut aperture = Aperture::new(Intel440, SimPlatform::intel440())
        .with_special_target(SpecialTargetFlags::new().with_via_agp2_rate_patch(true));
    aperture.initialize().unwrap();
    assert_eq!(target_command(&mut aperture).rate(), 1);
    assert_eq!(master_command(&mut aperture).rate(), 4);

    aperture.set_rate(2).unwrap();
    assert_eq!(target_command(&mut aperture).rate(), 4);
    assert_eq!(master_command(&mut aperture).rate(), 1);
}

#[test]
fn unsupported_rate_leaves_hardware_alone() {
    let mut aperture = Aperture::new(Intel440, SimPlatform::intel440());
    aperture.initialize().unwrap();
    aperture.platform_mut().clear_writes();

    assert_eq!(aperture.set_rate(8), Err(GartError::InvalidParameter));
    assert!(aperture.platform().writes().is_empty());

    assert_eq!(
        aperture.special_target(SpecialTargetFlags::new().with_set_rate(8)),
        Err(GartError::InvalidParameter)
    );
    assert_eq!(aperture.special().set_rate(), 0);
}

#[test]
fn special_target_records_the_rate() {
    let mut aperture = Aperture::new(Intel440, SimPlatform::intel440());
    aperture.initialize().unwrap();
    aperture
        .special_target(SpecialTargetFlags::new().with_set_rate(1).with_no_fast_write(true))
        .unwrap();
    assert_eq!(aperture.special().set_rate(), 1);
    assert!(aperture.special().no_fast_write());
    assert_eq!(target_command(&mut aperture).rate(), 1);
}

#[test]
fn rate_zero_refused_while_reserved() {
    let mut aperture = Aperture::new(Intel440, SimPlatform::intel440());
    aperture.initialize().unwrap();
    let mut range = aperture.reserve(4, CacheType::Uncached).unwrap();

    assert_eq!(aperture.set_rate(0), Err(GartError::InvalidDeviceState));
    assert!(target_command(&mut aperture).agp_enable());

    aperture.release(&mut range);
    aperture.platform_mut().clear_writes();
    aperture.set_rate(0).unwrap();

    assert!(aperture.table().is_none());
    assert_eq!(aperture.platform().contiguous_blocks(), 0);
    assert!(!aperture.is_enabled());
    let writes = command_writes(aperture.platform());
    assert!(!writes.is_empty());
    assert!(!writes.iter().any(enabled));
}

#[test]
fn agp3_targets_run_at_8x() {
    let mut aperture = Aperture::new(Agp35::<agp_gart::Gart35Pte>::default(), SimPlatform::agp35(false));
    aperture.initialize().unwrap();

    let target = aperture.platform_mut().target_mut().command;
    // 8X is register value 2 in AGP 3.0 signalling.
    assert_eq!(target.rate(), 2);
    assert!(target.fast_write_enable());
    assert!(!target.gart64());

    assert_eq!(aperture.set_rate(2), Err(GartError::InvalidParameter));
    aperture.set_rate(4).unwrap();
    assert_eq!(aperture.platform_mut().target_mut().command.rate(), 1);
}

#[test]
fn agp3_no_8x_quirk() {
    let mut aperture = Aperture::new(Agp35::<agp_gart::Gart35Pte>::default(), SimPlatform::agp35(false))
        .with_special_target(SpecialTargetFlags::new().with_no_8x(true));
    aperture.initialize().unwrap();
    assert_eq!(aperture.platform_mut().target_mut().command.rate(), 1);
}
