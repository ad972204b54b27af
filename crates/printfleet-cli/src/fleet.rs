//! Fleet file loading.
//!
//! A fleet file is TOML with an optional `[settings]` table and one
//! `[[printers]]` entry per printer:
//!
//! ```toml
//! [settings]
//! poll_interval_ms = 3000
//!
//! [[printers]]
//! id = "x1c-workshop"
//! name = "Workshop X1C"
//!
//! [printers.login]
//! protocol = "bambu"
//! printerUrl = "192.168.1.50"
//! serial = "01S00A000000000"
//! accessCode = "12345678"
//! ```

use anyhow::{bail, Context, Result};
use printfleet_core::{FleetSettings, PrinterRecord};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Parsed fleet file.
#[derive(Debug, Default, Deserialize)]
pub struct FleetFile {
    #[serde(default)]
    pub settings: FleetSettings,
    #[serde(default)]
    pub printers: Vec<PrinterRecord>,
}

impl FleetFile {
    /// Read and parse `path`, then apply `PRINTFLEET_*` overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fleet file {}", path.display()))?;
        let mut fleet = Self::parse(&raw)
            .with_context(|| format!("Invalid fleet file {}", path.display()))?;
        fleet.settings.apply_env()?;
        fleet.settings.validate()?;
        Ok(fleet)
    }

    /// Parse fleet TOML without touching the environment.
    pub fn parse(raw: &str) -> Result<Self> {
        let fleet: Self = toml::from_str(raw)?;

        let mut seen = HashSet::new();
        for printer in &fleet.printers {
            if printer.id.trim().is_empty() {
                bail!("printer with empty id");
            }
            if !seen.insert(printer.id.as_str()) {
                bail!("duplicate printer id {:?}", printer.id);
            }
        }
        Ok(fleet)
    }

    pub fn printer(&self, id: &str) -> Option<&PrinterRecord> {
        self.printers.iter().find(|printer| printer.id == id)
    }

    /// Problems with individual records, as `(id, message)`.
    pub fn problems(&self) -> Vec<(String, String)> {
        let mut problems = Vec::new();
        for printer in &self.printers {
            if let Err(e) = printer.login.validate() {
                problems.push((printer.id.clone(), e.to_string()));
            } else if printer.enabled && !self.settings.is_protocol_enabled(printer.protocol()) {
                problems.push((
                    printer.id.clone(),
                    format!("protocol {} is disabled", printer.protocol()),
                ));
            }
        }
        problems
    }
}
