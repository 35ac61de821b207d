//! # labfeed-rs
//!
//! A hardware acquisition framework for logic analyzers and similar
//! instruments.
//!
//! Drivers implement one [`Driver`] trait. A [`Session`] groups scanned
//! devices, drives their acquisition from a single-threaded event loop and
//! hands every packet of the typed datafeed ([`Packet`]) to the registered
//! consumers, in order: Header, Meta, then Logic/Analog/Trigger, then End.
//!
//! ## Features
//!
//! - **Driver dispatch**: `demo`, `virtual-session` (session file replay),
//!   `ols` (SUMP over a serial port) and `fx2lafw` (Cypress FX2 boards over
//!   USB, with firmware upload and re-enumeration)
//! - **Event loop**: timed and readiness-driven sources on one thread, with
//!   a thread-safe waker for I/O completions
//! - **Streaming triggers**: multi-stage bitmask triggers matched across
//!   buffer boundaries
//! - **DataFrame output**: [`LogicCapture`] turns a run into a `polars`
//!   DataFrame with one boolean column per probe
//!
//! ## Examples
//!
//! ### Capture from the demo device
//!
//! ```rust,no_run
//! use labfeed_rs::{ConfigKey, ConfigValue, DriverRegistry, LogicCapture, Session};
//!
//! let registry = DriverRegistry::with_defaults();
//! let demo = registry.create("demo")?;
//! demo.init()?;
//! let dev = demo.scan(&[])?.remove(0);
//! demo.dev_open(&dev)?;
//! demo.config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(1000), &dev)?;
//!
//! let mut session = Session::new();
//! session.dev_add(&dev)?;
//! let capture = LogicCapture::attach(&mut session, &dev);
//! session.start()?;
//! session.run()?;
//!
//! let df = capture.borrow().to_dataframe()?;
//! println!("{df}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Triggers
//!
//! ```rust
//! use labfeed_rs::trigger::{Trigger, TriggerMatcher};
//!
//! // bit 0 goes high, then bit 1 goes low
//! let trigger = Trigger::start_capturing_when()
//!     .high(0)
//!     .then()
//!     .low(1)
//!     .build()
//!     .unwrap();
//!
//! let mut matcher = TriggerMatcher::new(Some(&trigger));
//! assert_eq!(matcher.scan(&[0b10, 0b11]), None);
//! assert_eq!(matcher.scan(&[0b01]), Some(1));
//! ```

pub mod capability;
pub mod capture;
pub mod datafeed;
pub mod device;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod event_loop;
pub mod serial;
pub mod session;
pub mod trigger;
pub mod usb;

// Re-export the main types for convenience
pub use capability::{ConfigKey, ConfigOption, ConfigValue};

pub use capture::LogicCapture;

pub use datafeed::{Analog, Header, Logic, Packet, PacketType};

pub use device::{DeviceInstance, DeviceStatus, Probe, ProbeKind};

pub use driver::{Driver, DriverHandle, DriverInfo, DriverRegistry};

pub use error::{LabError, Result};

pub use session::{AcquisitionContext, Session, StopHandle};

pub use trigger::{Trigger, TriggerMatcher};
