//! # Sensor Inputs
//!
//! [`SysfsGpioSensor`] reads the metal-detection input through the Linux
//! sysfs GPIO interface. [`IdleSensor`] stands in when there is no
//! hardware (dry runs); counts then come from the `e` operator command.
//!
//! ```text
//! /sys/class/gpio/
//! ├── export          ◄─── write "17" to claim the pin
//! ├── unexport        ◄─── write "17" on release
//! └── gpio17/
//!     ├── direction   ◄─── "in"
//!     └── value       ◄─── "0" / "1", read every sample
//! ```

use std::fs;
use std::path::PathBuf;

use tally_core::{SensorError, SensorSource};
use tracing::{debug, info, warn};

/// Default sysfs GPIO root.
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// A GPIO input read through sysfs.
#[derive(Debug)]
pub struct SysfsGpioSensor {
    root: PathBuf,
    pin: u32,
    exported_here: bool,
    released: bool,
}

impl SysfsGpioSensor {
    /// Claims `pin` under the default sysfs root.
    pub fn open(pin: u32) -> Result<Self, SensorError> {
        Self::open_at(SYSFS_GPIO_ROOT, pin)
    }

    /// Claims `pin` under `root`, exporting it if needed and setting it
    /// to input.
    pub fn open_at(root: impl Into<PathBuf>, pin: u32) -> Result<Self, SensorError> {
        let root = root.into();
        let pin_dir = root.join(format!("gpio{pin}"));

        let exported_here = if pin_dir.exists() {
            debug!(pin, "GPIO pin already exported");
            false
        } else {
            fs::write(root.join("export"), pin.to_string()).map_err(|e| {
                SensorError::NotInitialized(format!("export of GPIO {pin} failed: {e}"))
            })?;
            true
        };

        fs::write(pin_dir.join("direction"), "in").map_err(|e| {
            SensorError::NotInitialized(format!("GPIO {pin} direction not settable: {e}"))
        })?;

        info!(pin, root = %root.display(), "GPIO sensor ready");
        Ok(SysfsGpioSensor {
            root,
            pin,
            exported_here,
            released: false,
        })
    }

    fn value_path(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.pin)).join("value")
    }
}

/// Parses a sysfs GPIO value file.
fn parse_level(raw: &str) -> Result<bool, SensorError> {
    match raw.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(SensorError::InvalidValue(other.to_string())),
    }
}

impl SensorSource for SysfsGpioSensor {
    fn read(&mut self) -> Result<bool, SensorError> {
        if self.released {
            return Err(SensorError::NotInitialized(format!(
                "GPIO {} already released",
                self.pin
            )));
        }
        let raw = fs::read_to_string(self.value_path())?;
        parse_level(&raw)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if self.exported_here {
            match fs::write(self.root.join("unexport"), self.pin.to_string()) {
                Ok(()) => info!(pin = self.pin, "GPIO pin released"),
                Err(err) => warn!(pin = self.pin, error = %err, "Failed to unexport GPIO pin"),
            }
        }
    }
}

/// A sensor that never fires.
#[derive(Debug, Default)]
pub struct IdleSensor;

impl SensorSource for IdleSensor {
    fn read(&mut self) -> Result<bool, SensorError> {
        Ok(false)
    }
}
