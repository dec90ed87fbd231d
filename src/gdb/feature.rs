//! `qSupported` feature names

use std::fmt;

/// Optional protocol features negotiated through `qSupported`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    SoftwareBreakpoints,
    HardwareBreakpoints,
    PacketSize,
    NoAckMode,
    MultiProcess,
    VContSupported,
    ErrorMessages,
}

impl Feature {
    pub fn name(self) -> &'static str {
        match self {
            Feature::SoftwareBreakpoints => "swbreak",
            Feature::HardwareBreakpoints => "hwbreak",
            Feature::PacketSize => "PacketSize",
            Feature::NoAckMode => "QStartNoAckMode",
            Feature::MultiProcess => "multiprocess",
            Feature::VContSupported => "vContSupported",
            Feature::ErrorMessages => "error-message",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "swbreak" => Some(Feature::SoftwareBreakpoints),
            "hwbreak" => Some(Feature::HardwareBreakpoints),
            "PacketSize" => Some(Feature::PacketSize),
            "QStartNoAckMode" => Some(Feature::NoAckMode),
            "multiprocess" => Some(Feature::MultiProcess),
            "vContSupported" => Some(Feature::VContSupported),
            "error-message" => Some(Feature::ErrorMessages),
            _ => None,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
