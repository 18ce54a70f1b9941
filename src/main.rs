//! Entry point: parses CLI flags, initialises logging, discovers devices, and hands off
//! to the dispatcher (§4.8).

mod backlight;
mod compositor;
mod config;
mod controller;
mod dispatcher;
mod error;
mod frame;
mod gpu;
mod sensor;
mod signals;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use backlight::BacklightDevice;
use compositor::CompositorClient;
use config::Config;
use controller::Controller;
use controller::store::TrainingStore;
use dispatcher::Dispatcher;
use gpu::GpuContext;
use sensor::AlsSensor;

/// Automatic display backlight adjustment based on screen and ambient light.
#[derive(Parser, Debug)]
#[command(name = "wluma", version, about)]
struct Args {
    /// Increase log verbosity; repeat for more detail (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);
    signals::install();

    if let Err(err) = run() {
        error!(error = %err, "fatal startup error");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config = Config::discover()?;
    info!(data_file = %config.data_file.display(), "configuration discovered");

    let gpu = GpuContext::new()?;
    let compositor = CompositorClient::connect()?;
    let als = AlsSensor::open(config.als_raw_path.clone(), config.als_scale, config.als_offset)?;
    let backlight =
        BacklightDevice::open(config.backlight_max_path.clone(), config.backlight_brightness_path.clone())?;
    let store = TrainingStore::open(config.data_file.clone())?;
    let controller = Controller::new(store);

    let shutdown = signals::ShutdownFlag::default();
    let mut dispatcher = Dispatcher::new(compositor, gpu, als, backlight, controller, shutdown);
    dispatcher.run()?;

    info!("shut down cleanly");
    Ok(())
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
