//! Capability mixins composed into drivers.
//!
//! A capability contributes a fixed set of features to every driver that
//! declares it, and unlocks the matching convenience trait:
//!
//! - [`Capability::StandardStatus`] → [`StandardStatus`]: IEEE 488.2 common
//!   commands (`*CLS`, `*RST`, `*SRE`, `*IDN?`) plus the SCPI error queue.
//! - [`Capability::Trigger`] → [`Triggerable`]: `*TRG`.
//!
//! Name collisions between mixins and declared features are rejected when the
//! driver is built.

use crate::driver::Driver;
use crate::error::{InstrError, InstrResult};
use crate::feature::{Domain, Feature};
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    StandardStatus,
    Trigger,
}

impl Capability {
    /// Features this capability installs on a driver.
    pub fn features(&self) -> InstrResult<Vec<Feature>> {
        match self {
            Capability::StandardStatus => Ok(vec![
                Feature::text("clear_status")
                    .doc("Clear the status byte and the error queue")
                    .action("*CLS")
                    .build()?,
                Feature::text("reset_device")
                    .doc("Reset the instrument to its power-on state")
                    .action("*RST")
                    .build()?,
                Feature::text("status_enable_register")
                    .doc("Service request enable register")
                    .query("*SRE?")
                    .assign("*SRE {value}")
                    .domain(Domain::unsigned(8))
                    .build()?,
                Feature::text("identification")
                    .doc("Manufacturer, model, serial number and firmware")
                    .query("*IDN?")
                    .domain(Domain::text())
                    .build()?,
                Feature::text("error_queue")
                    .doc("Oldest entry of the error queue")
                    .query("SYST:ERR?")
                    .domain(Domain::text())
                    .build()?,
            ]),
            Capability::Trigger => Ok(vec![Feature::text("trigger")
                .doc("Issue a device-level trigger")
                .action("*TRG")
                .build()?]),
        }
    }
}

fn require(driver: &Driver, capability: Capability) -> InstrResult<()> {
    if driver.has_capability(capability) {
        Ok(())
    } else {
        Err(InstrError::state(format!(
            "driver '{}' does not have the {:?} capability",
            driver.name(),
            capability
        )))
    }
}

/// IEEE 488.2 status reporting.
#[async_trait]
pub trait StandardStatus {
    async fn clear_status(&self) -> InstrResult<()>;

    async fn reset_device(&self) -> InstrResult<()>;

    async fn identification(&self) -> InstrResult<String>;

    /// Pops the oldest entry of the error queue.
    async fn next_error(&self) -> InstrResult<String>;

    /// Drains the error queue until the device reports `0,"No error"`.
    ///
    /// Stops after `limit` entries so a misbehaving device cannot loop forever.
    async fn drain_errors(&self, limit: usize) -> InstrResult<Vec<String>> {
        let mut errors = Vec::new();
        for _ in 0..limit {
            let entry = self.next_error().await?;
            if entry.starts_with('0') || entry.starts_with("+0") {
                break;
            }
            errors.push(entry);
        }
        Ok(errors)
    }
}

#[async_trait]
impl StandardStatus for Driver {
    async fn clear_status(&self) -> InstrResult<()> {
        require(self, Capability::StandardStatus)?;
        self.invoke("clear_status").await
    }

    async fn reset_device(&self) -> InstrResult<()> {
        require(self, Capability::StandardStatus)?;
        self.invoke("reset_device").await
    }

    async fn identification(&self) -> InstrResult<String> {
        require(self, Capability::StandardStatus)?;
        self.get_as("identification").await
    }

    async fn next_error(&self) -> InstrResult<String> {
        require(self, Capability::StandardStatus)?;
        self.get_as("error_queue").await
    }
}

/// Device-level software trigger.
#[async_trait]
pub trait Triggerable {
    async fn trigger(&self) -> InstrResult<()>;
}

#[async_trait]
impl Triggerable for Driver {
    async fn trigger(&self) -> InstrResult<()> {
        require(self, Capability::Trigger)?;
        self.invoke("trigger").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_feature_names_are_disjoint() {
        let status: Vec<String> = Capability::StandardStatus
            .features()
            .unwrap()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        let trigger = Capability::Trigger.features().unwrap();
        assert_eq!(status.len(), 5);
        assert!(trigger.iter().all(|f| !status.contains(&f.name().to_string())));
    }
}
