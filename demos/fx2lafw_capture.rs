// Capture from an fx2lafw board
//
// Finds Cypress FX2 based logic analyzers over USB, uploads the firmware
// when needed, and streams one acquisition. Build with `--features nusb`.

use std::time::Instant;

use clap::Parser;
use labfeed_rs::drivers::fx2lafw::{Fx2Config, Fx2lafw};
use labfeed_rs::usb::nusb_backend::NusbContext;
use labfeed_rs::{ConfigKey, ConfigValue, DriverHandle, LogicCapture, Session};

#[derive(Parser)]
#[command(name = "fx2lafw_capture")]
#[command(version = "1.0")]
#[command(about = "Acquire samples from an fx2lafw logic analyzer")]
struct Args {
    /// Samples to acquire
    #[arg(short = 'n', long, default_value_t = 100_000)]
    samples: u64,

    /// Samplerate in Hz, one of the rates the board lists
    #[arg(short, long, default_value_t = 1_000_000)]
    samplerate: u64,

    /// Trigger string per probe, as `probe=stages` (e.g. `0=01`)
    #[arg(short, long)]
    trigger: Vec<String>,

    /// Directory holding the fx2lafw firmware images
    #[arg(long)]
    firmware_dir: Option<std::path::PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let mut config = Fx2Config::default();
    if let Some(dir) = &args.firmware_dir {
        config = config.with_firmware_dir(dir);
    }
    let fx = DriverHandle::new(Fx2lafw::new(Box::new(NusbContext::new()), config));
    fx.init()?;

    let Some(dev) = fx.scan(&[])?.into_iter().next() else {
        println!("No fx2lafw device found");
        return Ok(());
    };
    fx.dev_open(&dev)?;
    println!("Opened {dev}");

    fx.config_set(ConfigKey::Samplerate, &ConfigValue::UInt64(args.samplerate), &dev)?;
    fx.config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(args.samples), &dev)?;
    for arg in &args.trigger {
        let (probe, stages) = arg
            .split_once('=')
            .ok_or_else(|| format!("bad trigger '{arg}', expected probe=stages"))?;
        dev.probe_set_trigger(probe.parse()?, Some(stages))?;
    }

    let mut session = Session::new();
    session.dev_add(&dev)?;
    let capture = LogicCapture::attach(&mut session, &dev);

    let started = Instant::now();
    session.start()?;
    session.run()?;
    let elapsed = started.elapsed();
    fx.dev_close(&dev)?;

    let capture = capture.borrow();
    println!(
        "Captured {} of {} samples in {:.1} ms",
        capture.num_samples(),
        args.samples,
        elapsed.as_secs_f64() * 1000.0
    );
    if let Some(at) = capture.trigger_at {
        println!("Trigger at sample {at}");
    }
    println!("{}", capture.to_dataframe()?.head(Some(10)));
    fx.cleanup()?;
    Ok(())
}
