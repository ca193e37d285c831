//! Region table used to pick a destination for the daily deals command.

use std::path::Path;

use anyhow::{bail, Context, Result};
use farewatch_core::IataCode;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Region {
    pub name: String,
    pub destinations: Vec<IataCode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DealRegions {
    pub regions: Vec<Region>,
}

impl Default for DealRegions {
    fn default() -> Self {
        let region = |name: &str, codes: [&str; 3]| Region {
            name: name.to_string(),
            destinations: codes
                .iter()
                .filter_map(|c| IataCode::parse(c).ok())
                .collect(),
        };
        Self {
            regions: vec![
                region("Asia", ["SIN", "ICN", "HND"]),
                region("Europe", ["LHR", "CDG", "FCO"]),
                region("Americas", ["LAX", "JFK", "DEN"]),
            ],
        }
    }
}

impl DealRegions {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let table: Self = serde_yaml::from_str(text).context("parsing region table")?;
        table.validate()?;
        Ok(table)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.regions.is_empty() {
            bail!("region table has no regions");
        }
        if let Some(empty) = self.regions.iter().find(|r| r.destinations.is_empty()) {
            bail!("region `{}` has no destinations", empty.name);
        }
        Ok(())
    }

    /// Uniform region, then a uniform destination inside it.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(&str, &IataCode)> {
        let region = self.regions.choose(rng)?;
        let destination = region.destinations.choose(rng)?;
        Some((region.name.as_str(), destination))
    }
}
