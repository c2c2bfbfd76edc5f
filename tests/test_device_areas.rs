mod common;
use common::*;

use koolnova_bms_tools::device::Error;
use koolnova_bms_tools::registers::{AreaId, ClimMode, FanMode};

#[tokio::test]
async fn declaring_a_registered_area_yields_its_values() {
    setup();
    let mut bank = base_bank();
    prime_area(&mut bank, AreaSpec {
        id: 1,
        enabled: true,
        fan: FanMode::Low,
        clim: ClimMode::Hot,
        order_temp: 21.0,
        real_temp: 19.5,
    });
    let simulator = simulator_with(bank).await;
    let device = device_for(&simulator).await;

    let area = device.declare_area("Living", 1).await.unwrap();
    assert_eq!(area.name, "Living");
    assert_eq!(area.id, AreaId::new(1).unwrap());
    assert!(area.enabled);
    assert_eq!(area.fan_mode, FanMode::Low);
    assert_eq!(area.clim_mode, ClimMode::Hot);
    assert_eq!(area.order_temp, 21.0);
    assert_eq!(area.real_temp, 19.5);
}

#[tokio::test]
async fn declaring_an_unregistered_area_fails() {
    setup();
    let simulator = simulator_with(base_bank()).await;
    let device = device_for(&simulator).await;

    let result = device.declare_area("Nowhere", 5).await;
    assert!(matches!(result, Err(Error::AreaNotRegistered(_))), "{result:?}");
    assert!(device.areas().is_empty());
}

#[tokio::test]
async fn out_of_range_area_ids_are_rejected_without_a_read() {
    setup();
    let simulator = simulator_with(base_bank()).await;
    let device = device_for(&simulator).await;

    for id in [0, 17, 255] {
        let result = device.declare_area("Invalid", id).await;
        assert!(matches!(result, Err(Error::InvalidAreaId(_))), "{result:?}");
    }
}

#[tokio::test]
async fn duplicate_declaration_is_rejected_and_keeps_one_area() {
    setup();
    let mut bank = base_bank();
    prime_area(&mut bank, AreaSpec {
        id: 3,
        enabled: true,
        fan: FanMode::Auto,
        clim: ClimMode::Cold,
        order_temp: 23.0,
        real_temp: 22.0,
    });
    let simulator = simulator_with(bank).await;
    let device = device_for(&simulator).await;

    device.declare_area("Kitchen", 3).await.unwrap();
    let result = device.declare_area("Kitchen again", 3).await;
    assert!(matches!(result, Err(Error::DuplicateArea(_))), "{result:?}");

    let areas = device.areas();
    assert_eq!(areas.len(), 1);
    assert_eq!(areas[0].name, "Kitchen");
}

#[tokio::test]
async fn refresh_picks_up_external_register_changes() {
    setup();
    let mut bank = base_bank();
    prime_area(&mut bank, AreaSpec {
        id: 1,
        enabled: true,
        fan: FanMode::Low,
        clim: ClimMode::Hot,
        order_temp: 21.0,
        real_temp: 19.5,
    });
    let simulator = simulator_with(bank).await;
    let device = device_for(&simulator).await;
    device.declare_area("Living", 1).await.unwrap();

    // Somebody turns the thermostat up behind our back.
    let id = AreaId::new(1).unwrap();
    poke(&simulator, id.real_temp_register(), 2 * 24);
    let snapshot = device.refresh_all().await.unwrap();
    assert_eq!(snapshot.areas[&id].real_temp, 24.0);
    assert_eq!(device.area(1).unwrap().real_temp, 24.0);
}

#[tokio::test]
async fn refresh_skips_but_keeps_areas_that_lost_their_registered_flag() {
    setup();
    let mut bank = base_bank();
    prime_area(&mut bank, AreaSpec {
        id: 2,
        enabled: true,
        fan: FanMode::Medium,
        clim: ClimMode::Cold,
        order_temp: 20.0,
        real_temp: 25.0,
    });
    let simulator = simulator_with(bank).await;
    let device = device_for(&simulator).await;
    device.declare_area("Bedroom", 2).await.unwrap();

    let id = AreaId::new(2).unwrap();
    poke(&simulator, id.state_register(), 0);
    poke(&simulator, id.real_temp_register(), 0xFFFF);
    let snapshot = device.refresh_all().await.unwrap();

    // The stale values stay; the declaration is never dropped implicitly.
    let area = &snapshot.areas[&id];
    assert_eq!(area.real_temp, 25.0);
    assert_eq!(area.name, "Bedroom");
}

#[tokio::test]
async fn end_to_end_fan_change_survives_a_refresh() {
    setup();
    let mut bank = base_bank();
    prime_area(&mut bank, AreaSpec {
        id: 1,
        enabled: true,
        fan: FanMode::Low,
        clim: ClimMode::Hot,
        order_temp: 21.0,
        real_temp: 19.5,
    });
    let simulator = simulator_with(bank).await;
    let device = device_for(&simulator).await;
    device.declare_area("Living", 1).await.unwrap();

    device.set_area_fan_mode(1, FanMode::High).await.unwrap();
    let snapshot = device.refresh_all().await.unwrap();
    let area = &snapshot.areas[&AreaId::new(1).unwrap()];
    assert_eq!(area.fan_mode, FanMode::High);
    assert_eq!(area.clim_mode, ClimMode::Hot);
    assert_eq!(area.order_temp, 21.0);
}

#[tokio::test]
async fn switching_the_area_off_keeps_the_mode_bits_and_blocks_fan_writes() {
    setup();
    let mut bank = base_bank();
    prime_area(&mut bank, AreaSpec {
        id: 1,
        enabled: true,
        fan: FanMode::Low,
        clim: ClimMode::Hot,
        order_temp: 21.0,
        real_temp: 19.5,
    });
    let simulator = simulator_with(bank).await;
    let device = device_for(&simulator).await;
    device.declare_area("Living", 1).await.unwrap();

    let id = AreaId::new(1).unwrap();
    let modes_before = register(&simulator, id.modes_register());
    device.set_area_clim_mode(1, None).await.unwrap();

    assert_eq!(register(&simulator, id.state_register()), 0b10);
    assert_eq!(register(&simulator, id.modes_register()), modes_before);
    assert!(!device.area(1).unwrap().enabled);

    let result = device.set_area_fan_mode(1, FanMode::High).await;
    assert!(matches!(result, Err(Error::AreaOff(_))), "{result:?}");
    assert_eq!(register(&simulator, id.modes_register()), modes_before);
}

#[tokio::test]
async fn setting_a_clim_mode_on_an_off_area_turns_it_on_first() {
    setup();
    let mut bank = base_bank();
    prime_area(&mut bank, AreaSpec {
        id: 4,
        enabled: false,
        fan: FanMode::Auto,
        clim: ClimMode::Cold,
        order_temp: 20.0,
        real_temp: 21.5,
    });
    let simulator = simulator_with(bank).await;
    let device = device_for(&simulator).await;
    device.declare_area("Office", 4).await.unwrap();

    device.set_area_clim_mode(4, Some(ClimMode::HeatingFloor)).await.unwrap();

    let id = AreaId::new(4).unwrap();
    assert_eq!(register(&simulator, id.state_register()), 0b11);
    let modes = register(&simulator, id.modes_register());
    assert_eq!(modes & 0x0F, ClimMode::HeatingFloor as u16);
    assert_eq!(modes >> 4, FanMode::Auto as u16);
    let area = device.area(4).unwrap();
    assert!(area.enabled);
    assert_eq!(area.clim_mode, ClimMode::HeatingFloor);
}

#[tokio::test]
async fn wizard_surface_reports_system_and_registration_status() {
    setup();
    let mut bank = base_bank();
    prime_area(&mut bank, AreaSpec {
        id: 7,
        enabled: false,
        fan: FanMode::Off,
        clim: ClimMode::Cold,
        order_temp: 19.0,
        real_temp: 18.0,
    });
    let simulator = simulator_with(bank).await;
    let device = device_for(&simulator).await;

    assert_eq!(
        device.system_status().await.unwrap(),
        koolnova_bms_tools::registers::SysState::Off
    );
    assert!(device.area_registered(7).await.unwrap());
    assert!(!device.area_registered(8).await.unwrap());
}
