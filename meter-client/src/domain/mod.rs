mod device_state;
mod reading;
mod totals;

pub use device_state::{DayKey, DeviceState};
pub use reading::{parse_timestamp, DeviceReading, RawReading, Reading, ReadingError};
pub use totals::{DailyUsage, FlowDirection, NetFlow, Totals, NET_FLOW_DEADBAND_KWH};
