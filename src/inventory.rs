//! Probe inventory: live USB bus view joined with the configured catalog.
//!
//! Enumeration reads the host USB bus; the join matches configured probes
//! by serial number first, falling back to VID+PID when the catalog carries
//! no serial. Search filters are AND-combined and shared between
//! `/probes/search` and the `probe-finder` CLI.

use crate::config::{normalize_usb_id, ProbeConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One attached USB device, as much of it as the join needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
}

/// List attached USB devices from the host bus view.
///
/// Enumeration failures degrade to an empty view (every probe reports
/// disconnected) rather than failing the request.
pub fn scan() -> Vec<UsbDevice> {
    match nusb::list_devices() {
        Ok(devices) => devices
            .map(|d| UsbDevice {
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                serial: d.serial_number().map(str::to_string),
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "USB enumeration failed");
            Vec::new()
        }
    }
}

/// Connection status of one configured probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeStatus {
    pub id: u32,
    pub name: String,
    pub interface: String,
    pub connected: bool,
    pub observed_serial: String,
    pub expected_serial: String,
    /// Whether the observed serial satisfies the catalog's expectation.
    #[serde(rename = "match")]
    pub serial_match: bool,
}

/// Join one configured probe against the bus view.
pub fn probe_status(probe: &ProbeConfig, devices: &[UsbDevice]) -> ProbeStatus {
    let vid = parse_usb_id(&probe.vendor_id);
    let pid = parse_usb_id(&probe.product_id);
    let candidates: Vec<&UsbDevice> = devices
        .iter()
        .filter(|d| Some(d.vendor_id) == vid && Some(d.product_id) == pid)
        .collect();

    let expected = probe.serial.as_str();
    let (connected, observed, serial_match) = if !expected.is_empty() {
        if let Some(d) = candidates
            .iter()
            .find(|d| d.serial.as_deref() == Some(expected))
        {
            (true, d.serial.clone().unwrap_or_default(), true)
        } else if let Some(d) = candidates.first() {
            // Right device type on the bus, but not the unit the catalog
            // expects.
            (true, d.serial.clone().unwrap_or_default(), false)
        } else {
            (false, String::new(), false)
        }
    } else if let Some(d) = candidates.first() {
        (true, d.serial.clone().unwrap_or_default(), true)
    } else {
        (false, String::new(), false)
    };

    ProbeStatus {
        id: probe.id,
        name: probe.name.clone(),
        interface: probe.interface.clone(),
        connected,
        observed_serial: observed,
        expected_serial: expected.to_string(),
        serial_match,
    }
}

/// Status of every configured probe against one bus scan.
pub fn all_probe_status(probes: &[ProbeConfig], devices: &[UsbDevice]) -> Vec<ProbeStatus> {
    probes.iter().map(|p| probe_status(p, devices)).collect()
}

fn parse_usb_id(value: &str) -> Option<u16> {
    u16::from_str_radix(&normalize_usb_id(value), 16).ok()
}

/// Normalize an interface name for matching: lowercase, separators
/// stripped, common vendor aliases folded.
pub fn normalize_interface_name(name: &str) -> String {
    let flat: String = name
        .to_lowercase()
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect();
    match flat.as_str() {
        "jlink" | "segger" => "jlink".to_string(),
        "cmsisdap" | "cmsis" | "dap" => "cmsisdap".to_string(),
        "wchlink" | "wch" | "wchlinke" => "wchlink".to_string(),
        other => other.to_string(),
    }
}

/// Search criteria over the configured probe catalog. All present fields
/// must match (AND).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl SearchQuery {
    pub fn is_empty(&self) -> bool {
        self.interface.is_none()
            && self.vid.is_none()
            && self.pid.is_none()
            && self.serial.is_none()
            && self.name.is_none()
    }
}

/// Search result for one query.
#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub query: SearchQuery,
    pub matches: Vec<ProbeConfig>,
    pub count: usize,
}

/// Filter configured probes by the query. An empty query matches all.
pub fn search_probes(probes: &[ProbeConfig], query: &SearchQuery) -> SearchResult {
    let mut matches: Vec<ProbeConfig> = probes.to_vec();

    if let Some(interface) = &query.interface {
        let wanted = normalize_interface_name(interface);
        matches.retain(|p| normalize_interface_name(&p.interface) == wanted);
    }
    if let Some(vid) = &query.vid {
        let wanted = normalize_usb_id(vid);
        matches.retain(|p| normalize_usb_id(&p.vendor_id) == wanted);
    }
    if let Some(pid) = &query.pid {
        let wanted = normalize_usb_id(pid);
        matches.retain(|p| normalize_usb_id(&p.product_id) == wanted);
    }
    if let Some(serial) = &query.serial {
        matches.retain(|p| &p.serial == serial);
    }
    if let Some(name) = &query.name {
        let needle = name.to_lowercase();
        matches.retain(|p| p.name.to_lowercase().contains(&needle));
    }

    SearchResult {
        query: query.clone(),
        count: matches.len(),
        matches,
    }
}
