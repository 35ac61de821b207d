// List drivers and their options
//
// Prints every registered driver with the scan and device options it
// reports, and optionally scans for devices.

use clap::Parser;
use labfeed_rs::capability::lookup;
use labfeed_rs::serial::available_ports;
use labfeed_rs::{ConfigKey, ConfigOption, ConfigValue, DriverHandle, DriverRegistry};

#[derive(Parser)]
#[command(name = "list_drivers")]
#[command(version = "1.0")]
#[command(about = "Show the available drivers and what they can do")]
struct Args {
    /// Also scan every driver for devices
    #[arg(short, long)]
    scan: bool,

    /// Serial port handed to serial drivers when scanning
    #[arg(long)]
    port: Option<String>,
}

fn describe_keys(handle: &DriverHandle, key: ConfigKey) -> String {
    match handle.config_list(key, None) {
        Ok(ConfigValue::Keys(keys)) if !keys.is_empty() => keys
            .iter()
            .map(|k| lookup(*k).map_or_else(|| k.to_string(), |info| info.shortname.to_string()))
            .collect::<Vec<_>>()
            .join(", "),
        _ => "-".to_string(),
    }
}

fn scan(handle: &DriverHandle, options: &[ConfigOption]) -> Result<(), Box<dyn std::error::Error>> {
    handle.init()?;
    match handle.scan(options) {
        Ok(found) if found.is_empty() => println!("    no devices"),
        Ok(found) => {
            for dev in found {
                println!("    found {dev}");
            }
        }
        Err(e) => println!("    scan failed: {e}"),
    }
    handle.cleanup()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::init();

    let mut options = Vec::new();
    if let Some(port) = &args.port {
        options.push(ConfigOption::new(ConfigKey::Conn, port.as_str()));
    }

    let registry = DriverRegistry::with_defaults();
    println!("Drivers:");
    for name in registry.names() {
        let handle = registry.create(name)?;
        let info = handle.info();
        println!("  {:<16} {}", info.name, info.longname);
        println!("    scan options:   {}", describe_keys(&handle, ConfigKey::ScanOptions));
        println!("    device options: {}", describe_keys(&handle, ConfigKey::DeviceOptions));
        if args.scan {
            scan(&handle, &options)?;
        }
    }

    match available_ports() {
        Ok(ports) if !ports.is_empty() => println!("\nSerial ports: {}", ports.join(", ")),
        Ok(_) => println!("\nNo serial ports"),
        Err(e) => println!("\nCannot list serial ports: {e}"),
    }
    Ok(())
}
