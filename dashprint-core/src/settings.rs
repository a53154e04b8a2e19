//! Persisted per-printer configuration.

use serde::{Deserialize, Serialize};

/// Build volume in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintArea {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// A printer's persisted settings: how to reach it, what to call it, and the
/// initial lifecycle flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterSettings {
    pub name: String,
    #[serde(rename = "uniqueName", default)]
    pub unique_name: String,
    #[serde(rename = "devicePath")]
    pub device_path: String,
    #[serde(rename = "baudRate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub stopped: bool,
    #[serde(rename = "printArea")]
    pub print_area: PrintArea,
}

/// True if `candidate` matches the slug grammar `[a-z0-9]+(-[a-z0-9]+)*`.
pub fn is_valid_slug(candidate: &str) -> bool {
    if candidate.is_empty() {
        return false;
    }
    let mut prev_was_hyphen = true; // leading hyphen or empty segment is invalid
    for b in candidate.bytes() {
        match b {
            b'a'..=b'z' | b'0'..=b'9' => prev_was_hyphen = false,
            b'-' => {
                if prev_was_hyphen {
                    return false;
                }
                prev_was_hyphen = true;
            }
            _ => return false,
        }
    }
    !prev_was_hyphen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_grammar() {
        assert!(is_valid_slug("prusa"));
        assert!(is_valid_slug("prusa-mk3s"));
        assert!(is_valid_slug("p2"));
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("-prusa"));
        assert!(!is_valid_slug("prusa-"));
        assert!(!is_valid_slug("prusa--mk3s"));
        assert!(!is_valid_slug("Prusa"));
        assert!(!is_valid_slug("prusa_mk3s"));
    }
}
