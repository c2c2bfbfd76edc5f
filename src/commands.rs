pub mod registers {
    use std::path::PathBuf;

    use crate::registers::RegisterSchema;

    #[derive(clap::ValueEnum, Clone, Debug)]
    pub enum Format {
        Table,
        Json,
    }

    /// Search and output the controller's register map.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
        format: Format,
        filter: Option<String>,
        #[arg(long, short = 'o')]
        file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not open the specified output file at {1:?}")]
        OpenOutputFile(#[source] std::io::Error, PathBuf),
        #[error("could not write data to the output file at {1:?}")]
        WriteFile(#[source] std::io::Error, PathBuf),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
        #[error("could not serialize registers to JSON")]
        SerializeJson(#[source] serde_json::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        use std::io::Write as _;
        let mut output_writer: Box<dyn std::io::Write> = match &args.file {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };

        let matching = RegisterSchema::all_registers().filter(|register| {
            args.filter.as_ref().is_none_or(|pattern| register.is_match(pattern))
        });
        let data = match args.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table
                    .set_header(vec!["Address", "Name", "Mode", "Description"])
                    .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                for register in matching {
                    table.add_row(vec![
                        register.address.to_string(),
                        register.name.to_string(),
                        register.mode.to_string(),
                        register.description.to_string(),
                    ]);
                }
                table.to_string().into_bytes()
            }
            Format::Json => {
                let value = matching.collect::<Vec<_>>();
                serde_json::to_vec(&value).map_err(Error::SerializeJson)?
            }
        };
        output_writer.write_all(&data).map_err(|e| match args.file {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p),
        })?;
        Ok(())
    }
}

pub mod status {
    use crate::connection::{self, Connection};
    use crate::device::{self, Device};

    #[derive(clap::ValueEnum, Clone, Debug)]
    pub enum Format {
        Table,
        Json,
    }

    /// Connect to the controller and report the system and engine state.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[arg(long, short='f', value_enum, default_value_t = Format::Table)]
        format: Format,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not query the controller")]
        Device(#[from] device::Error),
        #[error("could not serialize the state to JSON")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        use std::io::Write as _;
        let device = Device::connect(Connection::new(args.connection)).await?;
        let snapshot = device.snapshot();
        let mut stdout = std::io::stdout().lock();
        match args.format {
            Format::Table => {
                let mut table = comfy_table::Table::new();
                table
                    .set_header(vec!["Field", "Value"])
                    .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                table.add_row(vec!["system-state".to_string(), snapshot.system.sys_state.to_string()]);
                table.add_row(vec!["global-mode".to_string(), snapshot.system.global_mode.to_string()]);
                table.add_row(vec!["efficiency".to_string(), snapshot.system.efficiency.to_string()]);
                for engine in &snapshot.engines {
                    let id = engine.id;
                    table.add_row(vec![
                        format!("engine-{id}-flow-state"),
                        engine.flow_state.to_string(),
                    ]);
                    table.add_row(vec![
                        format!("engine-{id}-throughput"),
                        engine.throughput.to_string(),
                    ]);
                    table.add_row(vec![
                        format!("engine-{id}-order-temp"),
                        engine.order_temp.to_string(),
                    ]);
                }
                writeln!(stdout, "{table}").map_err(Error::WriteStdout)?;
            }
            Format::Json => {
                serde_json::to_writer(&mut stdout, &snapshot).map_err(Error::SerializeJson)?;
                writeln!(stdout).map_err(Error::WriteStdout)?;
            }
        }
        device.disconnect().await;
        Ok(())
    }
}

pub mod area {
    use crate::connection::{self, Connection};
    use crate::device::{self, Device};

    /// Query one area by its id, as the setup wizard would.
    ///
    /// Succeeds only if the controller reports the area as registered.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[arg(long, short='f', value_enum, default_value_t = super::status::Format::Table)]
        format: super::status::Format,
        /// The area id, 1 to 16.
        id: u8,
        /// A name to attach to the area in the output.
        #[arg(long, default_value = "probe")]
        name: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not query the controller")]
        Device(#[from] device::Error),
        #[error("could not serialize the area to JSON")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        use std::io::Write as _;
        let device = Device::connect(Connection::new(args.connection)).await?;
        let area = device.declare_area(&args.name, args.id).await?;
        let mut stdout = std::io::stdout().lock();
        match args.format {
            super::status::Format::Table => {
                let mut table = comfy_table::Table::new();
                table
                    .set_header(vec!["Field", "Value"])
                    .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                table.add_row(vec!["id".to_string(), area.id.to_string()]);
                table.add_row(vec!["name".to_string(), area.name.clone()]);
                table.add_row(vec!["enabled".to_string(), area.enabled.to_string()]);
                table.add_row(vec!["fan-mode".to_string(), area.fan_mode.to_string()]);
                table.add_row(vec!["clim-mode".to_string(), area.clim_mode.to_string()]);
                table.add_row(vec!["order-temp".to_string(), area.order_temp.to_string()]);
                table.add_row(vec!["real-temp".to_string(), area.real_temp.to_string()]);
                writeln!(stdout, "{table}").map_err(Error::WriteStdout)?;
            }
            super::status::Format::Json => {
                serde_json::to_writer(&mut stdout, &area).map_err(Error::SerializeJson)?;
                writeln!(stdout).map_err(Error::WriteStdout)?;
            }
        }
        device.disconnect().await;
        Ok(())
    }
}

pub mod set {
    use crate::connection::{self, Connection};
    use crate::device::{self, Device};
    use crate::registers::{ClimMode, Efficiency, FanMode, FlowState, GlobalMode, SysState};

    /// Write one controller setting and exit.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[command(subcommand)]
        what: What,
    }

    #[derive(clap::Subcommand, Clone)]
    pub enum What {
        /// Turn the whole system on or off.
        SystemState { state: SysState },
        /// Change the system-wide operating mode.
        GlobalMode { mode: GlobalMode },
        /// Change the efficiency/speed balance.
        Efficiency { efficiency: Efficiency },
        /// Change the flow programming of one engine (1 to 4).
        EngineFlow { engine: u8, state: FlowState },
        /// Change the target temperature of an area (15.0 to 35.0).
        AreaTemp { area: u8, temp: f32 },
        /// Change the climate mode of an area; `off` switches the area off.
        AreaClim { area: u8, mode: ClimSetting },
        /// Change the fan mode of an area. Only valid while the area is on.
        AreaFan { area: u8, mode: FanMode },
    }

    #[derive(Clone, Debug)]
    pub enum ClimSetting {
        Off,
        Mode(ClimMode),
    }

    impl std::str::FromStr for ClimSetting {
        type Err = strum::ParseError;
        fn from_str(input: &str) -> Result<Self, Self::Err> {
            if input.eq_ignore_ascii_case("off") {
                Ok(ClimSetting::Off)
            } else {
                Ok(ClimSetting::Mode(input.parse()?))
            }
        }
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not apply the setting")]
        Device(#[from] device::Error),
        #[error("could not serialize the resulting state")]
        SerializeJson(#[source] serde_json::Error),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let device = Device::connect(Connection::new(args.connection)).await?;
        let result = apply(&device, args.what).await;
        device.disconnect().await;
        result
    }

    async fn apply(device: &Device, what: What) -> Result<(), Error> {
        let resulting_state = match what {
            What::SystemState { state } => {
                device.set_system_state(state).await?;
                serde_json::to_value(device.system())
            }
            What::GlobalMode { mode } => {
                device.set_global_mode(mode).await?;
                serde_json::to_value(device.system())
            }
            What::Efficiency { efficiency } => {
                device.set_efficiency(efficiency).await?;
                serde_json::to_value(device.system())
            }
            What::EngineFlow { engine, state } => {
                device.set_engine_state(engine, state).await?;
                serde_json::to_value(device.engine(engine)?)
            }
            What::AreaTemp { area, temp } => {
                device.declare_area("cli", area).await?;
                device.set_area_target_temp(area, temp).await?;
                serde_json::to_value(device.area(area)?)
            }
            What::AreaClim { area, mode } => {
                device.declare_area("cli", area).await?;
                let mode = match mode {
                    ClimSetting::Off => None,
                    ClimSetting::Mode(mode) => Some(mode),
                };
                device.set_area_clim_mode(area, mode).await?;
                serde_json::to_value(device.area(area)?)
            }
            What::AreaFan { area, mode } => {
                device.declare_area("cli", area).await?;
                device.set_area_fan_mode(area, mode).await?;
                serde_json::to_value(device.area(area)?)
            }
        };
        let resulting_state = resulting_state.map_err(Error::SerializeJson)?;
        println!("{resulting_state}");
        Ok(())
    }
}

pub mod monitor {
    use crate::connection::{self, Connection};
    use crate::coordinator::Coordinator;
    use crate::device::{self, Device, Snapshot};
    use futures::StreamExt as _;
    use std::sync::Arc;
    use tokio_stream::wrappers::BroadcastStream;
    use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
    use tracing::warn;

    /// Poll the controller periodically and print one snapshot per line.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// Areas to declare and watch, as `id` or `id:name`.
        #[arg(long = "area", value_parser = parse_area_spec)]
        areas: Vec<(u8, String)>,
        /// How often to poll the controller for a full refresh.
        #[arg(long, default_value = "30s")]
        refresh_period: humantime::Duration,
        /// Stop after this many snapshots.
        #[arg(long)]
        limit: Option<usize>,
    }

    fn parse_area_spec(input: &str) -> Result<(u8, String), String> {
        let (id, name) = match input.split_once(':') {
            Some((id, name)) => (id, name.to_string()),
            None => (input, format!("area {input}")),
        };
        let id = id.parse::<u8>().map_err(|e| format!("invalid area id `{id}`: {e}"))?;
        Ok((id, name))
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set the monitor up")]
        Device(#[from] device::Error),
        #[error("could not serialize the snapshot")]
        SerializeJson(#[source] serde_json::Error),
        #[error("could not write the snapshot to the terminal")]
        WriteStdout(#[source] std::io::Error),
    }

    #[derive(serde::Serialize)]
    struct Line<'a> {
        time: String,
        #[serde(flatten)]
        snapshot: &'a Snapshot,
    }

    fn emit(snapshot: &Snapshot) -> Result<(), Error> {
        use std::io::Write as _;
        let mut stdout = std::io::stdout().lock();
        let line = Line { time: jiff::Timestamp::now().to_string(), snapshot };
        serde_json::to_writer(&mut stdout, &line).map_err(Error::SerializeJson)?;
        writeln!(stdout).map_err(Error::WriteStdout)?;
        Ok(())
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let device = Arc::new(Device::connect(Connection::new(args.connection)).await?);
        for (id, name) in &args.areas {
            device.declare_area(name, *id).await?;
        }
        let coordinator = Coordinator::spawn(Arc::clone(&device), *args.refresh_period);
        let mut snapshots = BroadcastStream::new(coordinator.subscribe());
        let mut seen = 0;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                snapshot = snapshots.next() => match snapshot {
                    None => break,
                    Some(Err(BroadcastStreamRecvError::Lagged(count))) => {
                        warn!(count, "snapshot consumer lagged");
                    }
                    Some(Ok(snapshot)) => {
                        emit(&snapshot)?;
                        seen += 1;
                        if args.limit.is_some_and(|limit| seen >= limit) {
                            break;
                        }
                    }
                },
            }
        }
        drop(coordinator);
        device.disconnect().await;
        Ok(())
    }
}

pub mod simulate {
    use crate::simulator::{self, Simulator};

    /// Serve a simulated controller register bank over Modbus TCP.
    #[derive(clap::Parser)]
    pub struct Args {
        /// The address to listen on.
        #[arg(long, default_value = "127.0.0.1:1502")]
        listen: String,
        /// The modbus device ID the simulator answers to.
        #[arg(long, short = 'i', default_value_t = 49)]
        device_id: u8,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Simulator(#[from] simulator::Error),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let simulator =
            Simulator::bind(&args.listen, args.device_id, simulator::demo_bank()).await?;
        println!("listening on {}", simulator.local_addr());
        let _ = tokio::signal::ctrl_c().await;
        Ok(())
    }
}
