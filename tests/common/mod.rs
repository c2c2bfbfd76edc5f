#![allow(dead_code)] // not every test binary uses every helper

use clap::Parser as _;
use koolnova_bms_tools::connection::Connection;
use koolnova_bms_tools::device::Device;
use koolnova_bms_tools::registers::{
    self, AreaId, ClimMode, Efficiency, EngineId, FanMode, FlowState, GlobalMode, SysState,
};
use koolnova_bms_tools::simulator::{Bank, Simulator};

pub const DEVICE_ID: u8 = 49;

pub fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A bank whose system registers and engine banks decode cleanly; all area
/// slots start out unregistered.
pub fn base_bank() -> Bank {
    let mut bank = [0; registers::REGISTER_SPACE_LEN as usize];
    for id in EngineId::all() {
        bank[id.throughput_register() as usize] = 4;
        bank[id.order_temp_register() as usize] = registers::encode_temperature(22.0);
        bank[id.flow_state_register() as usize] = FlowState::Auto as u16;
    }
    bank[registers::REG_MODBUS_ADDRESS as usize] = u16::from(DEVICE_ID);
    bank[registers::REG_EFFICIENCY as usize] = Efficiency::Med as u16;
    bank[registers::REG_SYS_STATE as usize] = SysState::Off as u16;
    bank[registers::REG_GLOBAL_MODE as usize] = GlobalMode::Cold as u16;
    bank
}

pub struct AreaSpec {
    pub id: u8,
    pub enabled: bool,
    pub fan: FanMode,
    pub clim: ClimMode,
    pub order_temp: f32,
    pub real_temp: f32,
}

pub fn prime_area(bank: &mut Bank, spec: AreaSpec) {
    let id = AreaId::new(spec.id).expect("test areas have valid ids");
    bank[id.state_register() as usize] =
        registers::AREA_REGISTERED_BIT | u16::from(spec.enabled);
    bank[id.modes_register() as usize] = (spec.fan as u16) << 4 | spec.clim as u16;
    bank[id.order_temp_register() as usize] = registers::encode_temperature(spec.order_temp);
    bank[id.real_temp_register() as usize] = registers::encode_temperature(spec.real_temp);
}

pub async fn simulator_with(bank: Bank) -> Simulator {
    Simulator::bind("127.0.0.1:0", DEVICE_ID, bank).await.expect("could not bind the simulator")
}

pub fn connection_to(simulator: &Simulator) -> Connection {
    let address = simulator.local_addr().to_string();
    let args = koolnova_bms_tools::connection::Args::parse_from([
        "test",
        "--tcp",
        &address,
        "--frame-delay",
        "1ms",
        "--timeout",
        "5s",
    ]);
    Connection::new(args)
}

pub async fn device_for(simulator: &Simulator) -> Device {
    Device::connect(connection_to(simulator)).await.expect("could not connect to the simulator")
}

pub fn register(simulator: &Simulator, address: u16) -> u16 {
    let bank = simulator.bank();
    let bank = bank.lock().unwrap();
    bank[usize::from(address)]
}

pub fn poke(simulator: &Simulator, address: u16, value: u16) {
    let bank = simulator.bank();
    let mut bank = bank.lock().unwrap();
    bank[usize::from(address)] = value;
}
