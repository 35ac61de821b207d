// Capture from the demo driver
//
// Scans a virtual logic analyzer, configures it, runs one acquisition and
// prints the result as a DataFrame.

use clap::Parser;
use labfeed_rs::{
    ConfigKey, ConfigOption, ConfigValue, DriverRegistry, LogicCapture, Session,
};

#[derive(Parser)]
#[command(name = "demo_capture")]
#[command(version = "1.0")]
#[command(about = "Acquire samples from the demo pattern generator")]
struct Args {
    /// Samples to acquire
    #[arg(short = 'n', long, default_value_t = 64)]
    samples: u64,

    /// Samplerate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    samplerate: u64,

    /// Logic pattern (sigrok, random, incremental, all-low, all-high)
    #[arg(short, long, default_value = "sigrok")]
    pattern: String,

    /// Number of logic probes
    #[arg(long, default_value_t = 8)]
    probes: u64,

    /// Trigger on probe 0 going high
    #[arg(short, long)]
    trigger: bool,

    /// Write the capture to this CSV file
    #[arg(long)]
    csv: Option<std::path::PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and the datafeed dump")]
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

    let registry = DriverRegistry::with_defaults();
    let demo = registry.create("demo")?;
    demo.init()?;

    let dev = demo
        .scan(&[ConfigOption::new(ConfigKey::NumLogicProbes, args.probes)])?
        .remove(0);
    demo.dev_open(&dev)?;
    println!("Opened {dev}");

    demo.config_set(ConfigKey::Samplerate, &ConfigValue::UInt64(args.samplerate), &dev)?;
    demo.config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(args.samples), &dev)?;
    demo.config_set(ConfigKey::PatternMode, &ConfigValue::from(args.pattern.as_str()), &dev)?;
    if args.trigger {
        dev.probe_set_trigger(0, Some("01"))?;
        println!("Trigger: probe 0 low, then high");
    }

    let mut session = Session::new();
    session.dev_add(&dev)?;
    let capture = LogicCapture::attach(&mut session, &dev);

    session.start()?;
    session.run()?;
    demo.dev_close(&dev)?;

    let capture = capture.borrow();
    println!(
        "Captured {} samples at {} Hz{}",
        capture.num_samples(),
        capture.samplerate,
        capture
            .trigger_at
            .map(|at| format!(", trigger at sample {at}"))
            .unwrap_or_default()
    );

    let mut df = capture.to_dataframe()?;
    println!("{df}");

    if let Some(path) = &args.csv {
        use polars::prelude::{CsvWriter, SerWriter};
        let mut file = std::fs::File::create(path)?;
        CsvWriter::new(&mut file).finish(&mut df)?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}
