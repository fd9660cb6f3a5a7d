//! IFCB ROI identifiers of the form `<bin>_<roi>`.

use std::sync::LazyLock;

use regex::Regex;

static PID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<bin>.+)_(?P<roi>\d+)$").expect("valid PID pattern"));

/// Width of the zero-padded ROI number in a PID.
pub const ROI_WIDTH: usize = 5;

/// ROI number from the token after the last underscore.
///
/// ```
/// use plankton_pipeline::core::pid::roi_number;
///
/// assert_eq!(roi_number("D20240418T084427_IFCB124_00042"), Some(42));
/// assert_eq!(roi_number("no-underscore"), None);
/// ```
pub fn roi_number(pid: &str) -> Option<u32> {
    let (_, roi) = pid.trim().rsplit_once('_')?;
    roi.parse().ok()
}

/// Split a PID into bin and ROI number.
pub fn split_pid(pid: &str) -> Option<(&str, u32)> {
    let caps = PID_PATTERN.captures(pid)?;
    let bin = caps.name("bin")?.as_str();
    let roi = caps.name("roi")?.as_str().parse().ok()?;
    Some((bin, roi))
}

/// Bin part of a PID, or the whole token when it is not a PID.
pub fn bin_of(token: &str) -> &str {
    PID_PATTERN
        .captures(token)
        .and_then(|caps| caps.name("bin"))
        .map_or(token, |m| m.as_str())
}

/// Build a PID with the ROI number zero-padded to [`ROI_WIDTH`] digits.
pub fn format_pid(bin: &str, roi: u32) -> String {
    format!("{}_{:0width$}", bin, roi, width = ROI_WIDTH)
}
