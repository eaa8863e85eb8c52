//! Flasher progress line parser.
//!
//! The flasher reports lines such as
//! `Flashing [==========          ] 40% eta 0m12s`. Lines that do not match
//! are logged once per job and otherwise ignored.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{trace, warn};

use cleep_shared::types::InstallStatus;

static PROGRESS_LINE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^.*(Flashing|Validating)\s.*?(\d{1,3})%\s+eta\s+(.*)$").ok()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashProgress {
    pub status: InstallStatus,
    pub percent: u8,
    pub eta: String,
}

pub fn parse_line(line: &str) -> Option<FlashProgress> {
    let caps = PROGRESS_LINE.as_ref()?.captures(line.trim_end())?;
    let status = match caps.get(1)?.as_str() {
        "Flashing" => InstallStatus::Flashing,
        _ => InstallStatus::Validating,
    };
    let percent = caps.get(2)?.as_str().parse::<u16>().ok()?.min(100) as u8;
    Some(FlashProgress {
        status,
        percent,
        eta: caps.get(3)?.as_str().trim().to_string(),
    })
}

/// Per-job parser state.
#[derive(Debug, Default)]
pub struct ProgressParser {
    drift_logged: bool,
}

impl ProgressParser {
    pub fn feed(&mut self, line: &str) -> Option<FlashProgress> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let parsed = parse_line(line);
        if parsed.is_none() {
            if !self.drift_logged {
                self.drift_logged = true;
                warn!(line, "Unrecognized flasher output");
            } else {
                trace!(line, "Flasher output");
            }
        }
        parsed
    }

    pub fn drift_logged(&self) -> bool {
        self.drift_logged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flashing_and_validating() {
        let p = parse_line("Flashing [=========                ] 40% eta 0m12s").unwrap();
        assert_eq!(p.status, InstallStatus::Flashing);
        assert_eq!(p.percent, 40);
        assert_eq!(p.eta, "0m12s");

        let p = parse_line("\u{1b}[1A Validating [====] 100% eta 0s\r").unwrap();
        assert_eq!(p.status, InstallStatus::Validating);
        assert_eq!(p.percent, 100);
        assert_eq!(p.eta, "0s");
    }

    #[test]
    fn test_parse_rejects_other_lines() {
        assert!(parse_line("Flashing done").is_none());
        assert!(parse_line("Decompressing 40% eta 1m").is_none());
        assert!(parse_line("").is_none());
        assert_eq!(parse_line("Flashing [] 250% eta ?").unwrap().percent, 100);
    }

    #[test]
    fn test_drift_logged_once() {
        let mut parser = ProgressParser::default();
        assert!(parser.feed("   ").is_none());
        assert!(!parser.drift_logged());
        assert!(parser.feed("? Select drive").is_none());
        assert!(parser.drift_logged());
        assert!(parser.feed("Flashing [=] 3% eta 9m").is_some());
    }

    #[test]
    fn test_drift_flag_resets_per_job() {
        let mut first = ProgressParser::default();
        first.feed("? Select drive");
        assert!(first.drift_logged());

        let mut second = ProgressParser::default();
        assert!(!second.drift_logged());
        second.feed("? Select drive");
        assert!(second.drift_logged());
    }
}
