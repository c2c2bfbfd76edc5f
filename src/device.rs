use crate::connection::{self, Connection};
use crate::registers::{
    self, AreaId, ClimMode, DecodeError, Efficiency, EngineId, FanMode, FlowState, GlobalMode,
    SysState,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The link is down (or was never brought up). Fatal to the calling
    /// sequence; establish the connection first.
    #[error("modbus link is not connected")]
    NotConnected,
    /// A register operation failed on the wire. Recoverable: the cache keeps
    /// its previous contents and the next refresh will converge.
    #[error("register operation failed")]
    Transport(#[source] connection::Error),
    #[error("could not decode controller state")]
    Decode(#[from] DecodeError),
    #[error("area id {0} is outside of the 1 to {count} range", count = registers::AREA_COUNT)]
    InvalidAreaId(u8),
    #[error("engine id {0} is outside of the 1 to {count} range", count = registers::ENGINE_COUNT)]
    InvalidEngineId(u8),
    #[error("the controller reports area {0} as not registered")]
    AreaNotRegistered(AreaId),
    #[error("area {0} is already declared")]
    DuplicateArea(AreaId),
    #[error("area {0} has not been declared")]
    AreaNotDeclared(AreaId),
    #[error("target temperature {value} is outside of the {min} to {max} range")]
    ValueOutOfRange { value: f32, min: f32, max: f32 },
    #[error("area {0} is off, fan mode can only be changed while it is running")]
    AreaOff(AreaId),
}

impl From<connection::Error> for Error {
    fn from(error: connection::Error) -> Self {
        match error {
            connection::Error::NotConnected => Error::NotConnected,
            other => Error::Transport(other),
        }
    }
}

/// One declared climate area and its last known register contents.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Area {
    pub name: String,
    pub id: AreaId,
    pub enabled: bool,
    pub fan_mode: FanMode,
    pub clim_mode: ClimMode,
    pub order_temp: f32,
    pub real_temp: f32,
}

impl Area {
    fn absorb(&mut self, block: registers::AreaBlock) {
        self.enabled = block.enabled;
        self.fan_mode = block.fan_mode;
        self.clim_mode = block.clim_mode;
        self.order_temp = block.order_temp;
        self.real_temp = block.real_temp;
    }
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct Engine {
    pub id: EngineId,
    pub throughput: u8,
    pub flow_state: FlowState,
    pub order_temp: f32,
}

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct System {
    pub sys_state: SysState,
    pub global_mode: GlobalMode,
    pub efficiency: Efficiency,
}

/// A full copy of the cached controller state, as handed out to subscribers.
#[derive(Clone, Debug, serde::Serialize)]
pub struct Snapshot {
    pub system: System,
    pub engines: Vec<Engine>,
    pub areas: BTreeMap<AreaId, Area>,
}

#[derive(Debug)]
struct Cache {
    system: System,
    engines: Vec<Engine>,
    areas: BTreeMap<AreaId, Area>,
}

/// The single owner of the controller state.
///
/// All writes to system, engine and area registers go through the operations
/// here; the cache is only ever updated once the controller confirmed a
/// write, so it never runs ahead of the hardware. Reads of the cache are
/// cheap and synchronous.
///
/// The operations themselves are not serialized against each other beyond
/// the register-level lock in [`Connection`]: a refresh racing a mutation is
/// fine frame-wise, and the cache ends up with whichever operation completed
/// last.
#[derive(Debug)]
pub struct Device {
    connection: Connection,
    cache: Mutex<Cache>,
}

const SYSTEM_BANK_START: u16 = registers::REG_ENGINE_THROUGHPUT;
const SYSTEM_BANK_LEN: u16 = registers::REGISTER_SPACE_LEN - SYSTEM_BANK_START;

impl Device {
    /// Establish the link and populate the cache with one full read of the
    /// system registers and all four engines.
    ///
    /// A connection failure here is fatal to device bring-up and is reported
    /// without internal retries.
    pub async fn connect(connection: Connection) -> Result<Device, Error> {
        connection.connect().await?;
        let words = connection.read(SYSTEM_BANK_START, SYSTEM_BANK_LEN).await?;
        let (engines, system) = decode_system_bank(&words)?;
        Ok(Device {
            connection,
            cache: Mutex::new(Cache { system, engines, areas: BTreeMap::new() }),
        })
    }

    pub fn connected(&self) -> bool {
        self.connection.connected()
    }

    /// Tear the link down. Pending cache contents stay readable.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-read the system registers and engine banks into the cache.
    pub async fn update(&self) -> Result<(), Error> {
        let words = self.connection.read(SYSTEM_BANK_START, SYSTEM_BANK_LEN).await?;
        let (engines, system) = decode_system_bank(&words)?;
        let mut cache = self.cache();
        cache.system = system;
        cache.engines = engines;
        Ok(())
    }

    /// Start managing an area the operator declared.
    ///
    /// The area must be registered on the controller; its initial cached
    /// state is whatever the controller reports at declaration time.
    pub async fn declare_area(&self, name: &str, id: u8) -> Result<Area, Error> {
        let id = AreaId::new(id).ok_or(Error::InvalidAreaId(id))?;
        if self.cache().areas.contains_key(&id) {
            return Err(Error::DuplicateArea(id));
        }
        let words = self.connection.read(id.base_register(), registers::REGS_PER_AREA).await?;
        let words: [u16; 4] = words.try_into().map_err(|_| {
            Error::Transport(connection::Error::UnexpectedResponse)
        })?;
        let block = registers::decode_area_block(id, &words)?
            .ok_or(Error::AreaNotRegistered(id))?;
        let area = Area {
            name: name.to_string(),
            id,
            enabled: block.enabled,
            fan_mode: block.fan_mode,
            clim_mode: block.clim_mode,
            order_temp: block.order_temp,
            real_temp: block.real_temp,
        };
        let mut cache = self.cache();
        // Re-check: a concurrent declaration may have won the race while the
        // register block was being read.
        if cache.areas.contains_key(&id) {
            return Err(Error::DuplicateArea(id));
        }
        debug!(message = "declared area", id = id.get(), name);
        cache.areas.insert(id, area.clone());
        Ok(area)
    }

    /// Refresh the whole cache: the full area bank in one read, the engine
    /// banks and system registers in another.
    ///
    /// Declared areas whose registered flag went away are skipped for this
    /// poll (and logged); a declared area is never dropped from the cache
    /// implicitly.
    pub async fn refresh_all(&self) -> Result<Snapshot, Error> {
        let area_words =
            self.connection.read(registers::AREA_BANK_START, registers::AREA_BANK_LEN).await?;
        let system_words = self.connection.read(SYSTEM_BANK_START, SYSTEM_BANK_LEN).await?;
        let (engines, system) = decode_system_bank(&system_words)?;

        let mut blocks = BTreeMap::new();
        {
            // Only the declared areas get decoded: undeclared slots may hold
            // garbage and are none of our business.
            let cache = self.cache();
            for (id, chunk) in AreaId::all().zip(area_words.chunks_exact(4)) {
                if !cache.areas.contains_key(&id) {
                    continue;
                }
                let words: &[u16; 4] = chunk.try_into().expect("chunks_exact yields 4 words");
                blocks.insert(id, registers::decode_area_block(id, words)?);
            }
        }

        let mut cache = self.cache();
        cache.system = system;
        cache.engines = engines;
        for (id, area) in cache.areas.iter_mut() {
            match blocks.get(id) {
                Some(Some(block)) => area.absorb(*block),
                Some(None) => {
                    warn!(message = "declared area no longer registered, skipping", id = id.get());
                }
                // Area declared while the refresh was in flight; it was
                // populated from its own register read already.
                None => {}
            }
        }
        Ok(snapshot_of(&cache))
    }

    /// A copy of the current cache contents without touching the wire.
    pub fn snapshot(&self) -> Snapshot {
        snapshot_of(&self.cache())
    }

    pub fn system(&self) -> System {
        self.cache().system
    }

    pub fn areas(&self) -> Vec<Area> {
        self.cache().areas.values().cloned().collect()
    }

    pub fn area(&self, id: u8) -> Result<Area, Error> {
        let id = AreaId::new(id).ok_or(Error::InvalidAreaId(id))?;
        self.cache().areas.get(&id).cloned().ok_or(Error::AreaNotDeclared(id))
    }

    pub fn engine(&self, id: u8) -> Result<Engine, Error> {
        let id = EngineId::new(id).ok_or(Error::InvalidEngineId(id))?;
        let cache = self.cache();
        let engine = cache.engines.iter().find(|e| e.id == id);
        Ok(*engine.expect("engines are populated at connect time"))
    }

    /// Read the system state register directly, bypassing the cache.
    ///
    /// This is what the setup wizard calls to validate its input before any
    /// area is declared.
    pub async fn system_status(&self) -> Result<SysState, Error> {
        let words = self.connection.read(registers::REG_SYS_STATE, 1).await?;
        let raw = words.first().copied().unwrap_or_default();
        Ok(registers::decode_sys_state(raw)?)
    }

    /// Whether the controller reports the given area slot as provisioned.
    /// Wizard surface; does not require (nor perform) a declaration.
    pub async fn area_registered(&self, id: u8) -> Result<bool, Error> {
        let id = AreaId::new(id).ok_or(Error::InvalidAreaId(id))?;
        let words = self.connection.read(id.state_register(), 1).await?;
        let raw = words.first().copied().unwrap_or_default();
        Ok(registers::area_registered(raw))
    }

    fn declared(&self, id: u8) -> Result<(AreaId, Area), Error> {
        let id = AreaId::new(id).ok_or(Error::InvalidAreaId(id))?;
        let area = self.cache().areas.get(&id).cloned().ok_or(Error::AreaNotDeclared(id))?;
        Ok((id, area))
    }

    /// Set the target temperature of a declared area.
    ///
    /// On success the cache holds exactly `value` rather than a re-read: the
    /// register stores half-degrees, so the write is lossless for any value
    /// the validation lets through.
    pub async fn set_area_target_temp(&self, id: u8, value: f32) -> Result<(), Error> {
        let (id, _) = self.declared(id)?;
        if !(registers::MIN_ORDER_TEMP..=registers::MAX_ORDER_TEMP).contains(&value) {
            return Err(Error::ValueOutOfRange {
                value,
                min: registers::MIN_ORDER_TEMP,
                max: registers::MAX_ORDER_TEMP,
            });
        }
        let raw = registers::encode_temperature(value);
        self.connection.write(id.order_temp_register(), raw).await?;
        if let Some(area) = self.cache().areas.get_mut(&id) {
            area.order_temp = value;
        }
        Ok(())
    }

    pub async fn set_area_on(&self, id: u8) -> Result<(), Error> {
        let (id, _) = self.declared(id)?;
        self.set_area_enabled(id, true).await
    }

    pub async fn set_area_off(&self, id: u8) -> Result<(), Error> {
        let (id, _) = self.declared(id)?;
        self.set_area_enabled(id, false).await
    }

    async fn set_area_enabled(&self, id: AreaId, enabled: bool) -> Result<(), Error> {
        self.connection
            .read_modify_write(id.state_register(), |word| {
                registers::merge_enabled_bit(word, enabled)
            })
            .await?;
        if let Some(area) = self.cache().areas.get_mut(&id) {
            area.enabled = enabled;
        }
        Ok(())
    }

    /// Change the climate mode of a declared area; `None` switches it off.
    ///
    /// Switching modes on an area that is off first enables it with a
    /// separate state-register write. The two writes are not atomic: if the
    /// mode write fails the area is left on with its previous mode, which the
    /// next refresh reports truthfully.
    pub async fn set_area_clim_mode(&self, id: u8, mode: Option<ClimMode>) -> Result<(), Error> {
        let (id, area) = self.declared(id)?;
        let Some(mode) = mode else {
            debug!(message = "switching area off", id = id.get());
            return self.set_area_enabled(id, false).await;
        };
        if !area.enabled {
            debug!(message = "switching area on", id = id.get());
            self.set_area_enabled(id, true).await?;
        }
        let written = self
            .connection
            .read_modify_write(id.modes_register(), |word| {
                registers::merge_clim_nibble(word, mode)
            })
            .await?;
        if let Some(area) = self.cache().areas.get_mut(&id) {
            area.clim_mode = mode;
            // The write carried the freshly read fan nibble along; keep the
            // cache aligned with what actually hit the register.
            match registers::fan_mode_of(written, id.modes_register()) {
                Ok(fan) => area.fan_mode = fan,
                Err(error) => warn!(
                    message = "written fan nibble does not decode",
                    error = &error as &dyn std::error::Error,
                ),
            }
        }
        Ok(())
    }

    /// Change the fan mode of a declared area.
    ///
    /// Refused outright while the area is off: fan speed is meaningless with
    /// the unit not running, and the controller would acknowledge the write
    /// anyway.
    pub async fn set_area_fan_mode(&self, id: u8, mode: FanMode) -> Result<(), Error> {
        let (id, area) = self.declared(id)?;
        if !area.enabled {
            return Err(Error::AreaOff(id));
        }
        let written = self
            .connection
            .read_modify_write(id.modes_register(), |word| {
                registers::merge_fan_nibble(word, mode)
            })
            .await?;
        if let Some(area) = self.cache().areas.get_mut(&id) {
            area.fan_mode = mode;
            match registers::clim_mode_of(written, id.modes_register()) {
                Ok(clim) => area.clim_mode = clim,
                Err(error) => warn!(
                    message = "written climate nibble does not decode",
                    error = &error as &dyn std::error::Error,
                ),
            }
        }
        Ok(())
    }

    pub async fn set_system_state(&self, state: SysState) -> Result<(), Error> {
        self.connection.write(registers::REG_SYS_STATE, state as u16).await?;
        self.cache().system.sys_state = state;
        Ok(())
    }

    pub async fn set_global_mode(&self, mode: GlobalMode) -> Result<(), Error> {
        self.connection.write(registers::REG_GLOBAL_MODE, mode as u16).await?;
        self.cache().system.global_mode = mode;
        Ok(())
    }

    pub async fn set_efficiency(&self, efficiency: Efficiency) -> Result<(), Error> {
        self.connection.write(registers::REG_EFFICIENCY, efficiency as u16).await?;
        self.cache().system.efficiency = efficiency;
        Ok(())
    }

    pub async fn set_engine_state(&self, id: u8, state: FlowState) -> Result<(), Error> {
        let id = EngineId::new(id).ok_or(Error::InvalidEngineId(id))?;
        self.connection.write(id.flow_state_register(), state as u16).await?;
        let mut cache = self.cache();
        if let Some(engine) = cache.engines.iter_mut().find(|e| e.id == id) {
            engine.flow_state = state;
        }
        Ok(())
    }
}

fn snapshot_of(cache: &Cache) -> Snapshot {
    Snapshot {
        system: cache.system,
        engines: cache.engines.clone(),
        areas: cache.areas.clone(),
    }
}

fn decode_system_bank(words: &[u16]) -> Result<(Vec<Engine>, System), Error> {
    let reg = |address: u16| -> Result<u16, Error> {
        words
            .get(usize::from(address - SYSTEM_BANK_START))
            .copied()
            .ok_or(Error::Transport(connection::Error::UnexpectedResponse))
    };
    let mut engines = Vec::with_capacity(usize::from(registers::ENGINE_COUNT));
    for id in EngineId::all() {
        engines.push(Engine {
            id,
            throughput: registers::decode_throughput(
                id.throughput_register(),
                reg(id.throughput_register())?,
            )?,
            order_temp: registers::decode_temperature(reg(id.order_temp_register())?),
            flow_state: registers::decode_flow_state(
                id.flow_state_register(),
                reg(id.flow_state_register())?,
            )?,
        });
    }
    let system = System {
        sys_state: registers::decode_sys_state(reg(registers::REG_SYS_STATE)?)?,
        global_mode: registers::decode_global_mode(reg(registers::REG_GLOBAL_MODE)?)?,
        efficiency: registers::decode_efficiency(reg(registers::REG_EFFICIENCY)?)?,
    };
    Ok((engines, system))
}
