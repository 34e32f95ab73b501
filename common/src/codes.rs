//! Factory signal captures baked into the firmware image.

/// Power toggle for the bridged appliance, captured raw from its remote.
/// Alternating mark/space durations in microseconds, starting with a mark.
pub const POWER_RAW: &[u16] = &[
    9054, 4510, 570, 562, 568, 562, 570, 1698, 570, 560, 568, 564, 568, 564, 566, 566, 566, 562,
    570, 1690, 572, 1690, 572, 562, 572, 1696, 566, 1696, 568, 1694, 570, 1694, 568, 1698, 566,
    564, 570, 560, 570, 562, 568, 1696, 566, 562, 570, 564, 568, 562, 570, 564, 566, 1696, 568,
    1696, 570, 1690, 574, 560, 570, 1696, 566, 1692, 572, 1688, 574, 1688, 572, 39234, 9048, 2256,
    570,
];

pub const POWER_CARRIER_KHZ: u32 = 38;

/// Command name the capture above is registered under.
pub const POWER_COMMAND: &str = "on";
