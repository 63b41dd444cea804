//! Energy pseudo-motor over the monochromator Bragg axis.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::hardware::capabilities::Positioner;
use crate::units::{bragg_to_kev, kev_to_bragg};

/// Positioner in keV that drives a Bragg angle positioner in degrees
pub struct EnergyPositioner {
    name: String,
    bragg: Arc<dyn Positioner>,
}

impl EnergyPositioner {
    /// Energy axis called `name` driving `bragg`
    pub fn new(name: impl Into<String>, bragg: Arc<dyn Positioner>) -> Self {
        Self {
            name: name.into(),
            bragg,
        }
    }
}

#[async_trait]
impl Positioner for EnergyPositioner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn position(&self) -> Result<f64> {
        Ok(bragg_to_kev(self.bragg.position().await?))
    }

    async fn move_to(&self, target: f64, wait: bool) -> Result<()> {
        let bragg = kev_to_bragg(target);
        if !bragg.is_finite() || bragg <= 0.0 {
            bail!("{}: {target} keV is outside the monochromator range", self.name);
        }
        self.bragg.move_to(bragg, wait).await
    }

    async fn is_moving(&self) -> Result<bool> {
        self.bragg.is_moving().await
    }

    async fn stop(&self) -> Result<()> {
        self.bragg.stop().await
    }
}
