//! Debug probe discovery and selection

use probe_rs::probe::list::Lister;
use probe_rs::probe::DebugProbeInfo;
use tracing::{debug, info, warn};

use crate::error::{DebugError, Result};

/// Probe family, derived from the USB vendor and product ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFamily {
    JLink,
    StLink,
    DapLink,
    /// Microchip/Atmel EDBG based tools (Xplained Pro/Mini, Atmel-ICE, JTAGICE3)
    Edbg,
    Blackmagic,
    Ftdi,
    Unknown,
}

impl ProbeFamily {
    pub fn from_vid_pid(vendor_id: u16, product_id: u16) -> Self {
        match (vendor_id, product_id) {
            (0x1366, _) => ProbeFamily::JLink,
            (0x0483, 0x3748) | (0x0483, 0x374A) | (0x0483, 0x374B) | (0x0483, 0x374E)
            | (0x0483, 0x374F) | (0x0483, 0x3753) => ProbeFamily::StLink,
            (0x0D28, _) => ProbeFamily::DapLink,
            (0x03EB, 0x2111) | (0x03EB, 0x2140) | (0x03EB, 0x2141) | (0x03EB, 0x2145) => {
                ProbeFamily::Edbg
            }
            (0x1D50, 0x6018) => ProbeFamily::Blackmagic,
            (0x0403, _) => ProbeFamily::Ftdi,
            _ => ProbeFamily::Unknown,
        }
    }

    /// Lower values are preferred when auto-selecting
    fn preference(self) -> u8 {
        match self {
            ProbeFamily::JLink => 0,
            ProbeFamily::StLink => 1,
            ProbeFamily::DapLink => 2,
            ProbeFamily::Edbg => 3,
            _ => 4,
        }
    }
}

impl std::fmt::Display for ProbeFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeFamily::JLink => write!(f, "J-Link"),
            ProbeFamily::StLink => write!(f, "ST-Link"),
            ProbeFamily::DapLink => write!(f, "DAPLink"),
            ProbeFamily::Edbg => write!(f, "EDBG"),
            ProbeFamily::Blackmagic => write!(f, "Black Magic Probe"),
            ProbeFamily::Ftdi => write!(f, "FTDI"),
            ProbeFamily::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Summary of a connected probe, for listing
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub identifier: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub family: ProbeFamily,
}

impl From<&DebugProbeInfo> for ProbeInfo {
    fn from(probe: &DebugProbeInfo) -> Self {
        Self {
            identifier: probe.identifier.clone(),
            vendor_id: probe.vendor_id,
            product_id: probe.product_id,
            serial_number: probe.serial_number.clone(),
            family: ProbeFamily::from_vid_pid(probe.vendor_id, probe.product_id),
        }
    }
}

impl std::fmt::Display for ProbeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] VID:PID={:04X}:{:04X} serial={}",
            self.identifier,
            self.family,
            self.vendor_id,
            self.product_id,
            self.serial_number.as_deref().unwrap_or("none")
        )
    }
}

pub struct ProbeDiscovery;

impl ProbeDiscovery {
    /// List all available debug probes
    pub fn list_probes() -> Vec<ProbeInfo> {
        debug!("Discovering debug probes");
        let probes: Vec<ProbeInfo> = Lister::new().list_all().iter().map(ProbeInfo::from).collect();

        info!("Found {} debug probes", probes.len());
        for probe in &probes {
            debug!("  {}", probe);
        }
        probes
    }

    /// Pick a probe by selector: `auto`, a serial number, or part of the identifier
    pub fn select(selector: &str) -> Result<DebugProbeInfo> {
        let probes = Lister::new().list_all();
        if probes.is_empty() {
            return Err(DebugError::ProbeNotFound("No debug probes found".to_string()));
        }

        let summaries: Vec<ProbeInfo> = probes.iter().map(ProbeInfo::from).collect();
        let index = Self::select_index(&summaries, selector).ok_or_else(|| {
            DebugError::ProbeNotFound(format!("No probe matches selector '{}'", selector))
        })?;

        info!("Selected probe: {}", summaries[index]);
        probes
            .into_iter()
            .nth(index)
            .ok_or_else(|| DebugError::ProbeNotFound(selector.to_string()))
    }

    fn select_index(probes: &[ProbeInfo], selector: &str) -> Option<usize> {
        if selector.eq_ignore_ascii_case("auto") {
            return probes
                .iter()
                .enumerate()
                .min_by_key(|(_, probe)| probe.family.preference())
                .map(|(index, _)| index);
        }

        let matching: Vec<usize> = probes
            .iter()
            .enumerate()
            .filter(|(_, probe)| {
                probe.serial_number.as_deref() == Some(selector)
                    || probe.identifier.contains(selector)
            })
            .map(|(index, _)| index)
            .collect();

        if matching.len() > 1 {
            warn!("Multiple probes match '{}', using the first one", selector);
        }
        matching.first().copied()
    }
}
