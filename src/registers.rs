/// Number of climate areas addressable by a single controller.
pub const AREA_COUNT: u8 = 16;
/// Number of air-handling engines (AC1..AC4).
pub const ENGINE_COUNT: u8 = 4;

/// Each area occupies four consecutive registers starting at the bank base.
pub const AREA_BANK_START: u16 = 0;
pub const REGS_PER_AREA: u16 = 4;
pub const AREA_BANK_LEN: u16 = AREA_COUNT as u16 * REGS_PER_AREA;

/// Offsets within an area block.
pub const AREA_REG_STATE: u16 = 0;
pub const AREA_REG_MODES: u16 = 1;
pub const AREA_REG_ORDER_TEMP: u16 = 2;
pub const AREA_REG_REAL_TEMP: u16 = 3;

/// Engine banks are parallel arrays indexed by `engine id - 1`.
pub const REG_ENGINE_THROUGHPUT: u16 = 64;
pub const REG_ENGINE_ORDER_TEMP: u16 = 68;
pub const REG_ENGINE_FLOW_STATE: u16 = 72;

/// Reserved communication settings. Read back verbatim, never interpreted.
pub const REG_COMMUNICATION: u16 = 76;
pub const REG_MODBUS_ADDRESS: u16 = 77;
pub const REG_EFFICIENCY: u16 = 78;
pub const REG_CONTROLLER_ID: u16 = 79;
pub const REG_SYS_STATE: u16 = 80;
pub const REG_GLOBAL_MODE: u16 = 81;

/// One past the last meaningful register.
pub const REGISTER_SPACE_LEN: u16 = 82;

pub const MIN_ORDER_TEMP: f32 = 15.0;
pub const MAX_ORDER_TEMP: f32 = 35.0;
pub const MIN_ENGINE_ORDER_TEMP: f32 = 15.0;
pub const MAX_ENGINE_ORDER_TEMP: f32 = 30.0;
pub const MAX_THROUGHPUT: u16 = 15;

/// A climate area identifier as printed on the controller (1-based).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct AreaId(u8);

impl AreaId {
    pub fn new(id: u8) -> Option<Self> {
        (1..=AREA_COUNT).contains(&id).then_some(Self(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// First register of this area's four-register block.
    pub fn base_register(self) -> u16 {
        AREA_BANK_START + REGS_PER_AREA * (u16::from(self.0) - 1)
    }

    pub fn state_register(self) -> u16 {
        self.base_register() + AREA_REG_STATE
    }

    pub fn modes_register(self) -> u16 {
        self.base_register() + AREA_REG_MODES
    }

    pub fn order_temp_register(self) -> u16 {
        self.base_register() + AREA_REG_ORDER_TEMP
    }

    pub fn real_temp_register(self) -> u16 {
        self.base_register() + AREA_REG_REAL_TEMP
    }

    pub fn all() -> impl Iterator<Item = AreaId> {
        (1..=AREA_COUNT).map(AreaId)
    }
}

impl std::fmt::Display for AreaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An air-handling engine identifier (1-based, AC1..AC4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct EngineId(u8);

impl EngineId {
    pub fn new(id: u8) -> Option<Self> {
        (1..=ENGINE_COUNT).contains(&id).then_some(Self(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn throughput_register(self) -> u16 {
        REG_ENGINE_THROUGHPUT + u16::from(self.0) - 1
    }

    pub fn order_temp_register(self) -> u16 {
        REG_ENGINE_ORDER_TEMP + u16::from(self.0) - 1
    }

    pub fn flow_state_register(self) -> u16 {
        REG_ENGINE_FLOW_STATE + u16::from(self.0) - 1
    }

    pub fn all() -> impl Iterator<Item = EngineId> {
        (1..=ENGINE_COUNT).map(EngineId)
    }
}

impl std::fmt::Display for EngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// The wire codes below are the literal values from the A52102 Modbus control
// register documentation. They are irregular (climate modes skip 3), so every
// mapping is an explicit discriminant, never an array position.

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[derive(num_derive::FromPrimitive, strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum FanMode {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Auto = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[derive(num_derive::FromPrimitive, strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ClimMode {
    Cold = 1,
    Hot = 2,
    HeatingFloor = 4,
    RefreshingFloor = 5,
    HeatingFloor2 = 6,
}

/// Engine flow programming as exposed in the flow-state bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[derive(num_derive::FromPrimitive, strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum FlowState {
    ManualMin = 1,
    ManualMed = 2,
    ManualHigh = 3,
    Auto = 4,
}

/// Trade-off between energy efficiency and how fast set temperatures are
/// reached. Higher values favour efficiency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[derive(num_derive::FromPrimitive, strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Efficiency {
    Lower = 1,
    Low = 2,
    Med = 3,
    High = 4,
    Higher = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[derive(num_derive::FromPrimitive, strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SysState {
    Off = 0,
    On = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[derive(num_derive::FromPrimitive, strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum GlobalMode {
    Cold = 1,
    Heat = 2,
    HeatingFloor = 4,
    RefreshingFloor = 5,
    HeatingFloor2 = 6,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("register {register} holds {value:#06x} which is not a valid {field}")]
    UnknownEnumValue { register: u16, value: u16, field: &'static str },
    #[error("register {register} reports engine throughput {value}, above the maximum of {}", MAX_THROUGHPUT)]
    ThroughputOutOfRange { register: u16, value: u16 },
}

fn decode_enum<T: num_traits::FromPrimitive>(
    register: u16,
    value: u16,
    field: &'static str,
) -> Result<T, DecodeError> {
    T::from_u16(value).ok_or(DecodeError::UnknownEnumValue { register, value, field })
}

pub fn decode_fan_mode(register: u16, value: u16) -> Result<FanMode, DecodeError> {
    decode_enum(register, value, "fan mode")
}

pub fn decode_clim_mode(register: u16, value: u16) -> Result<ClimMode, DecodeError> {
    decode_enum(register, value, "climate mode")
}

pub fn decode_flow_state(register: u16, value: u16) -> Result<FlowState, DecodeError> {
    decode_enum(register, value, "flow state")
}

pub fn decode_efficiency(value: u16) -> Result<Efficiency, DecodeError> {
    decode_enum(REG_EFFICIENCY, value, "efficiency")
}

pub fn decode_sys_state(value: u16) -> Result<SysState, DecodeError> {
    decode_enum(REG_SYS_STATE, value, "system state")
}

pub fn decode_global_mode(value: u16) -> Result<GlobalMode, DecodeError> {
    decode_enum(REG_GLOBAL_MODE, value, "global mode")
}

pub fn decode_throughput(register: u16, value: u16) -> Result<u8, DecodeError> {
    if value > MAX_THROUGHPUT {
        return Err(DecodeError::ThroughputOutOfRange { register, value });
    }
    Ok(value as u8)
}

/// Temperatures are stored as `°C * 2`, giving 0.5 °C resolution.
pub fn decode_temperature(raw: u16) -> f32 {
    f32::from(raw) / 2.0
}

pub fn encode_temperature(celsius: f32) -> u16 {
    (celsius * 2.0) as u16
}

pub const AREA_ENABLED_BIT: u16 = 1 << 0;
pub const AREA_REGISTERED_BIT: u16 = 1 << 1;

pub fn area_enabled(state_word: u16) -> bool {
    state_word & AREA_ENABLED_BIT != 0
}

pub fn area_registered(state_word: u16) -> bool {
    state_word & AREA_REGISTERED_BIT != 0
}

/// Replace the enabled bit in a freshly read state word, preserving the
/// registered bit (and anything else the controller keeps in there).
pub fn merge_enabled_bit(state_word: u16, enabled: bool) -> u16 {
    state_word & !AREA_ENABLED_BIT | u16::from(enabled)
}

/// Replace the fan nibble (bits 4..=7) in a freshly read modes word.
pub fn merge_fan_nibble(modes_word: u16, fan: FanMode) -> u16 {
    modes_word & !0xF0 | (fan as u16) << 4
}

/// Replace the climate nibble (bits 0..=3) in a freshly read modes word.
pub fn merge_clim_nibble(modes_word: u16, clim: ClimMode) -> u16 {
    modes_word & !0x0F | clim as u16
}

pub fn fan_mode_of(modes_word: u16, register: u16) -> Result<FanMode, DecodeError> {
    decode_fan_mode(register, (modes_word & 0xF0) >> 4)
}

pub fn clim_mode_of(modes_word: u16, register: u16) -> Result<ClimMode, DecodeError> {
    decode_clim_mode(register, modes_word & 0x0F)
}

/// Decoded contents of one area's four-register block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AreaBlock {
    pub enabled: bool,
    pub fan_mode: FanMode,
    pub clim_mode: ClimMode,
    pub order_temp: f32,
    pub real_temp: f32,
}

/// Decode a four-register area block.
///
/// Returns `Ok(None)` when the controller reports the slot unregistered. The
/// registered bit is consulted before anything else: an unregistered block may
/// hold leftover garbage in the remaining registers and must not produce
/// decode errors for it.
pub fn decode_area_block(id: AreaId, words: &[u16; 4]) -> Result<Option<AreaBlock>, DecodeError> {
    let state = words[AREA_REG_STATE as usize];
    if !area_registered(state) {
        return Ok(None);
    }
    let modes = words[AREA_REG_MODES as usize];
    let modes_register = id.modes_register();
    Ok(Some(AreaBlock {
        enabled: area_enabled(state),
        fan_mode: fan_mode_of(modes, modes_register)?,
        clim_mode: clim_mode_of(modes, modes_register)?,
        order_temp: decode_temperature(words[AREA_REG_ORDER_TEMP as usize]),
        real_temp: decode_temperature(words[AREA_REG_REAL_TEMP as usize]),
    }))
}

#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Mode(u8);

impl serde::Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl Mode {
    pub const R: Self = Self(1 << 0);
    pub const W: Self = Self(1 << 1);
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0 & Self::R.0 == 0 { "-" } else { "R" })?;
        f.write_str(if self.0 & Self::W.0 == 0 { "-" } else { "W" })?;
        Ok(())
    }
}

/// A row of the register map as shown by the `registers` command.
#[derive(serde::Serialize)]
pub struct RegisterSchema {
    pub address: u16,
    pub name: String,
    pub mode: Mode,
    pub description: &'static str,
}

impl RegisterSchema {
    pub fn all_registers() -> impl Iterator<Item = Self> {
        let areas = AreaId::all().flat_map(|id| {
            [
                RegisterSchema {
                    address: id.state_register(),
                    name: format!("AREA_{id}_STATE"),
                    mode: Mode::RW,
                    description: "bit 0: area enabled, bit 1: area registered on the controller",
                },
                RegisterSchema {
                    address: id.modes_register(),
                    name: format!("AREA_{id}_MODES"),
                    mode: Mode::RW,
                    description: "high nibble: fan mode, low nibble: climate mode",
                },
                RegisterSchema {
                    address: id.order_temp_register(),
                    name: format!("AREA_{id}_ORDER_TEMP"),
                    mode: Mode::RW,
                    description: "target temperature in half-degrees C, 15.0 to 35.0",
                },
                RegisterSchema {
                    address: id.real_temp_register(),
                    name: format!("AREA_{id}_REAL_TEMP"),
                    mode: Mode::R,
                    description: "measured temperature in half-degrees C",
                },
            ]
        });
        let engines = EngineId::all().flat_map(|id| {
            [
                RegisterSchema {
                    address: id.throughput_register(),
                    name: format!("ENGINE_{id}_THROUGHPUT"),
                    mode: Mode::R,
                    description: "air throughput, 0 (stopped) to 15 (maximum)",
                },
                RegisterSchema {
                    address: id.order_temp_register(),
                    name: format!("ENGINE_{id}_ORDER_TEMP"),
                    mode: Mode::R,
                    description: "engine target temperature in half-degrees C, 15.0 to 30.0",
                },
                RegisterSchema {
                    address: id.flow_state_register(),
                    name: format!("ENGINE_{id}_FLOW_STATE"),
                    mode: Mode::RW,
                    description: "flow programming: manual-min/med/high or auto",
                },
            ]
        });
        let system = [
            RegisterSchema {
                address: REG_COMMUNICATION,
                name: "COMMUNICATION".to_string(),
                mode: Mode::R,
                description: "communication settings, reserved",
            },
            RegisterSchema {
                address: REG_MODBUS_ADDRESS,
                name: "MODBUS_ADDRESS".to_string(),
                mode: Mode::R,
                description: "configured modbus device address (1-127)",
            },
            RegisterSchema {
                address: REG_EFFICIENCY,
                name: "EFFICIENCY".to_string(),
                mode: Mode::RW,
                description: "efficiency/speed balance, 1 (fastest) to 5 (most efficient)",
            },
            RegisterSchema {
                address: REG_CONTROLLER_ID,
                name: "CONTROLLER_ID".to_string(),
                mode: Mode::R,
                description: "climate controller identifier, reserved",
            },
            RegisterSchema {
                address: REG_SYS_STATE,
                name: "SYS_STATE".to_string(),
                mode: Mode::RW,
                description: "0: system off, 1: system on",
            },
            RegisterSchema {
                address: REG_GLOBAL_MODE,
                name: "GLOBAL_MODE".to_string(),
                mode: Mode::RW,
                description: "system-wide operating mode",
            },
        ];
        let mut all: Vec<_> = areas.chain(engines).chain(system).collect();
        all.sort_by_key(|r| r.address);
        all.into_iter()
    }

    pub fn is_match(&self, pattern: &str) -> bool {
        let pattern = pattern.to_uppercase();
        if self.name.contains(&pattern) {
            return true;
        }
        if self.description.to_uppercase().contains(&pattern) {
            return true;
        }
        if self.address.to_string().contains(&pattern) {
            return true;
        }
        return false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator as _;

    #[test]
    fn wire_codes_are_the_documented_ones() {
        assert_eq!(FanMode::Off as u16, 0);
        assert_eq!(FanMode::Auto as u16, 4);
        assert_eq!(ClimMode::Cold as u16, 1);
        assert_eq!(ClimMode::Hot as u16, 2);
        assert_eq!(ClimMode::HeatingFloor as u16, 4);
        assert_eq!(ClimMode::RefreshingFloor as u16, 5);
        assert_eq!(ClimMode::HeatingFloor2 as u16, 6);
        assert_eq!(FlowState::ManualMin as u16, 1);
        assert_eq!(FlowState::Auto as u16, 4);
        assert_eq!(Efficiency::Lower as u16, 1);
        assert_eq!(Efficiency::Higher as u16, 5);
        assert_eq!(GlobalMode::Cold as u16, 1);
        assert_eq!(GlobalMode::HeatingFloor as u16, 4);
    }

    #[test]
    fn clim_mode_code_3_is_a_hole() {
        assert_eq!(
            decode_clim_mode(1, 3),
            Err(DecodeError::UnknownEnumValue { register: 1, value: 3, field: "climate mode" }),
        );
    }

    #[test]
    fn unknown_codes_do_not_decode() {
        assert!(decode_fan_mode(1, 5).is_err());
        assert!(decode_sys_state(2).is_err());
        assert!(decode_global_mode(3).is_err());
        assert!(decode_efficiency(0).is_err());
        assert!(decode_flow_state(72, 0).is_err());
        assert!(decode_throughput(64, 16).is_err());
        assert_eq!(decode_throughput(64, 15), Ok(15));
    }

    #[test]
    fn nibble_merges_preserve_the_other_nibble() {
        for fan in FanMode::iter() {
            for clim in ClimMode::iter() {
                let word = (fan as u16) << 4 | clim as u16;
                for new_fan in FanMode::iter() {
                    let merged = merge_fan_nibble(word, new_fan);
                    assert_eq!(clim_mode_of(merged, 1), Ok(clim));
                    assert_eq!(fan_mode_of(merged, 1), Ok(new_fan));
                }
                for new_clim in ClimMode::iter() {
                    let merged = merge_clim_nibble(word, new_clim);
                    assert_eq!(fan_mode_of(merged, 1), Ok(fan));
                    assert_eq!(clim_mode_of(merged, 1), Ok(new_clim));
                }
            }
        }
    }

    #[test]
    fn enabled_bit_merge_preserves_registered() {
        assert_eq!(merge_enabled_bit(0b10, true), 0b11);
        assert_eq!(merge_enabled_bit(0b11, false), 0b10);
        assert_eq!(merge_enabled_bit(0b00, true), 0b01);
    }

    #[test]
    fn temperatures_use_half_degree_steps() {
        assert_eq!(decode_temperature(39), 19.5);
        assert_eq!(decode_temperature(42), 21.0);
        assert_eq!(encode_temperature(21.0), 42);
        assert_eq!(encode_temperature(19.5), 39);
        // Values that are not representable truncate towards zero.
        assert_eq!(encode_temperature(20.3), 40);
    }

    #[test]
    fn unregistered_area_block_is_not_present() {
        // Garbage in the remaining registers must not matter.
        let words = [0b00, 0xFFFF, 0xFFFF, 0xFFFF];
        let id = AreaId::new(1).unwrap();
        assert_eq!(decode_area_block(id, &words), Ok(None));
    }

    #[test]
    fn registered_area_block_decodes() {
        let id = AreaId::new(1).unwrap();
        let words = [0b11, (FanMode::Low as u16) << 4 | ClimMode::Hot as u16, 42, 39];
        let block = decode_area_block(id, &words).unwrap().unwrap();
        assert_eq!(
            block,
            AreaBlock {
                enabled: true,
                fan_mode: FanMode::Low,
                clim_mode: ClimMode::Hot,
                order_temp: 21.0,
                real_temp: 19.5,
            },
        );

        // Registered but switched off is distinct from not present.
        let words = [0b10, (FanMode::Low as u16) << 4 | ClimMode::Hot as u16, 42, 39];
        let block = decode_area_block(id, &words).unwrap().unwrap();
        assert!(!block.enabled);
    }

    #[test]
    fn area_register_addressing() {
        let first = AreaId::new(1).unwrap();
        let last = AreaId::new(16).unwrap();
        assert_eq!(first.base_register(), 0);
        assert_eq!(first.real_temp_register(), 3);
        assert_eq!(last.base_register(), 60);
        assert_eq!(last.real_temp_register(), 63);
        assert_eq!(AreaId::new(0), None);
        assert_eq!(AreaId::new(17), None);
    }

    #[test]
    fn engine_register_addressing() {
        let ac1 = EngineId::new(1).unwrap();
        let ac4 = EngineId::new(4).unwrap();
        assert_eq!(ac1.throughput_register(), 64);
        assert_eq!(ac4.throughput_register(), 67);
        assert_eq!(ac1.order_temp_register(), 68);
        assert_eq!(ac4.flow_state_register(), 75);
        assert_eq!(EngineId::new(0), None);
        assert_eq!(EngineId::new(5), None);
    }

    #[test]
    fn register_schema_covers_the_whole_space() {
        let addresses: Vec<u16> = RegisterSchema::all_registers().map(|r| r.address).collect();
        let expected: Vec<u16> = (0..REGISTER_SPACE_LEN).collect();
        assert_eq!(addresses, expected);
    }
}
