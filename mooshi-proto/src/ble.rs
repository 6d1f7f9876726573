//! BLE GATT constants for the Mooshimeter serial service
//!
//! The meter exposes one service with a pair of characteristics that carry
//! the framed protocol: the client writes to `SERIAL_IN` and receives
//! notifications from `SERIAL_OUT`.

/// BLE Service UUID advertised by the meter
pub const SERVICE_UUID: &str = "1bc5ffa0-0200-62ab-e411-f254e005dbd4";

/// Serial-in characteristic UUID (client writes)
pub const SERIAL_IN_UUID: &str = "1bc5ffa1-0200-62ab-e411-f254e005dbd4";

/// Serial-out characteristic UUID (notify)
pub const SERIAL_OUT_UUID: &str = "1bc5ffa2-0200-62ab-e411-f254e005dbd4";

/// Largest write the meter accepts in one BLE packet (minimum ATT payload)
pub const DEFAULT_FRAGMENT_SIZE: usize = 20;
