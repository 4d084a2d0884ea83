use serde::{Deserialize, Serialize};

/// Instantaneous net below this magnitude (kWh) is reported as balanced.
pub const NET_FLOW_DEADBAND_KWH: f64 = 0.001;

/// Grid-flow totals for a device's current accounting day.
///
/// `instant_net` is `generated - consumed` of the last accepted reading;
/// positive means the site is ahead on generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total_imported: f64,
    pub total_exported: f64,
    pub instant_net: f64,
}

impl Totals {
    pub fn net_flow(&self) -> NetFlow {
        NetFlow::from_net(self.instant_net)
    }
}

/// Per-channel energy since the start of the accounting day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub consumed: f64,
    pub generated: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    Export,
    Import,
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetFlow {
    pub direction: FlowDirection,
    pub magnitude_kwh: f64,
}

impl NetFlow {
    pub fn from_net(net: f64) -> Self {
        let direction = if net > NET_FLOW_DEADBAND_KWH {
            FlowDirection::Export
        } else if net < -NET_FLOW_DEADBAND_KWH {
            FlowDirection::Import
        } else {
            FlowDirection::Balanced
        };

        Self {
            direction,
            magnitude_kwh: net.abs(),
        }
    }
}
