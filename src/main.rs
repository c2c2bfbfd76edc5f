use clap::Parser as _;
use koolnova_bms_tools::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers::Args),
    Status(commands::status::Args),
    Area(commands::area::Args),
    Set(commands::set::Args),
    Monitor(commands::monitor::Args),
    Simulate(commands::simulate::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

#[tokio::main]
async fn main() {
    let filter_description =
        std::env::var("KOOLNOVA_BMS_TOOLS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = filter_description
        .parse::<tracing_subscriber::filter::targets::Targets>()
        .expect("KOOLNOVA_BMS_TOOLS_LOG must hold a valid tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Status(args) => end(commands::status::run(args).await),
        Commands::Area(args) => end(commands::area::run(args).await),
        Commands::Set(args) => end(commands::set::run(args).await),
        Commands::Monitor(args) => end(commands::monitor::run(args).await),
        Commands::Simulate(args) => end(commands::simulate::run(args).await),
    }
}
