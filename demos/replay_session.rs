// Replay a saved session
//
// Points the virtual-session driver at a session archive (or a directory
// with its extracted entries) and prints a summary of every device it replays.

use std::path::PathBuf;

use clap::Parser;
use labfeed_rs::{ConfigKey, ConfigOption, DriverRegistry, LogicCapture, Session};

#[derive(Parser)]
#[command(name = "replay_session")]
#[command(version = "1.0")]
#[command(about = "Replay the devices of a saved session")]
struct Args {
    /// Session archive, or a directory with its extracted entries
    session: PathBuf,

    /// Rows of the DataFrame to print per device
    #[arg(short, long, default_value_t = 10)]
    rows: usize,

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

    let registry = DriverRegistry::with_defaults();
    let driver = registry.create("virtual-session")?;
    driver.init()?;
    let devices = driver.scan(&[ConfigOption::new(
        ConfigKey::SessionFile,
        args.session.display().to_string(),
    )])?;
    if devices.is_empty() {
        println!("{} holds no logic captures", args.session.display());
        return Ok(());
    }

    let mut session = Session::new();
    let mut captures = Vec::new();
    for dev in &devices {
        driver.dev_open(dev)?;
        session.dev_add(dev)?;
        captures.push((dev.clone(), LogicCapture::attach(&mut session, dev)));
    }

    session.start()?;
    session.run()?;

    for (dev, capture) in &captures {
        let capture = capture.borrow();
        let enabled: Vec<String> = dev
            .probes()
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.name.clone())
            .collect();
        println!(
            "{dev}: {} samples at {} Hz, probes [{}]",
            capture.num_samples(),
            capture.samplerate,
            enabled.join(", ")
        );
        println!("{}", capture.to_dataframe()?.head(Some(args.rows)));
    }

    driver.cleanup()?;
    Ok(())
}
