//! Device filtering

/// USB class code of hubs
const HUB_CLASS: u8 = 9;
/// Linux Foundation vendor ID used by root hubs
const LINUX_FOUNDATION_VID: u16 = 0x1d6b;

/// Root hubs are never offered as accessories
pub fn is_root_hub(vendor_id: u16, class_code: u8) -> bool {
    vendor_id == LINUX_FOUNDATION_VID && class_code == HUB_CLASS
}

/// Check a VID/PID pair against `VID:PID` filter patterns
///
/// Patterns look like `0x1234:0x5678` or `0x1234:*`; either side may be `*`.
/// An empty filter list allows every device. Malformed patterns never match.
pub fn matches_filters(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
            return false;
        };
        part_matches(filter_vid, vid) && part_matches(filter_pid, pid)
    })
}

fn part_matches(pattern: &str, value: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(hex, 16)
        .map(|v| v == value)
        .unwrap_or(false)
}
