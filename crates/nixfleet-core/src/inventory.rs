use std::fmt;
use std::path::PathBuf;

/// Platform a host runs, dispatching the Platform Activator's switch primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Base {
	Ubuntu,
	Nixos,
	Darwin,
}

impl fmt::Display for Base {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Base::Ubuntu => "ubuntu",
			Base::Nixos => "nixos",
			Base::Darwin => "darwin",
		};
		f.write_str(s)
	}
}

/// A target host, read-only for the duration of one Apply run. Produced by
/// the (external) inventory loader; the core never mutates it.
#[derive(Debug, Clone)]
pub struct Host {
	pub name: String,
	pub address: String,
	pub port: u16,
	pub user: String,
	pub base: Base,
	pub ssh_key_refs: Vec<PathBuf>,
	pub reboot_window: Option<RebootWindow>,
}

impl Host {
	pub fn pool_key(&self) -> crate::pool::PoolKey {
		crate::pool::PoolKey {
			host: self.address.clone(),
			port: self.port,
			user: self.user.clone(),
		}
	}
}

/// A parsed `"<Day3> HH:MM-HH:MM"` reboot window, consumed by an external
/// reboot orchestrator. The core only parses and answers `is_in_window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootWindow {
	pub day: chrono::Weekday,
	pub start: (u8, u8),
	pub end: (u8, u8),
}

impl RebootWindow {
	/// `None` input (empty string) means "no window", i.e. reboot any time.
	/// Callers represent that as `Option<RebootWindow> == None` and should
	/// treat it as always-true before calling into this parser.
	pub fn parse(input: &str) -> Result<Option<Self>, crate::error::NixFleetError> {
		if input.is_empty() {
			return Ok(None);
		}
		let mut parts = input.splitn(2, ' ');
		let day = parts
			.next()
			.ok_or_else(|| bad_window(input))?;
		let range = parts.next().ok_or_else(|| bad_window(input))?;
		let day = parse_day(day).ok_or_else(|| bad_window(input))?;
		let (start_s, end_s) = range.split_once('-').ok_or_else(|| bad_window(input))?;
		let start = parse_hhmm(start_s).ok_or_else(|| bad_window(input))?;
		let end = parse_hhmm(end_s).ok_or_else(|| bad_window(input))?;
		Ok(Some(Self { day, start, end }))
	}

	pub fn is_in_window(&self, at: chrono::DateTime<chrono::Utc>) -> bool {
		if at.weekday() != self.day {
			return false;
		}
		let minutes = at.time().hour() as u32 * 60 + at.time().minute();
		let start = self.start.0 as u32 * 60 + self.start.1 as u32;
		let end = self.end.0 as u32 * 60 + self.end.1 as u32;
		minutes >= start && minutes <= end
	}
}

fn bad_window(input: &str) -> crate::error::NixFleetError {
	crate::error::NixFleetError::Input(format!("malformed reboot window: {input:?}"))
}

fn parse_day(s: &str) -> Option<chrono::Weekday> {
	use chrono::Weekday::*;
	Some(match s {
		"Sun" => Sun,
		"Mon" => Mon,
		"Tue" => Tue,
		"Wed" => Wed,
		"Thu" => Thu,
		"Fri" => Fri,
		"Sat" => Sat,
		_ => return None,
	})
}

fn parse_hhmm(s: &str) -> Option<(u8, u8)> {
	let (h, m) = s.split_once(':')?;
	let h: u8 = h.parse().ok()?;
	let m: u8 = m.parse().ok()?;
	if h > 23 || m > 59 {
		return None;
	}
	Some((h, m))
}

use chrono::{Datelike, Timelike};

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn parses_valid_window() {
		let w = RebootWindow::parse("Sun 02:00-04:00").unwrap().unwrap();
		let in_window = chrono::Utc.with_ymd_and_hms(2026, 8, 2, 2, 0, 0).unwrap();
		assert_eq!(in_window.weekday(), chrono::Weekday::Sun);
		assert!(w.is_in_window(in_window));
		let past_end = chrono::Utc.with_ymd_and_hms(2026, 8, 2, 4, 1, 0).unwrap();
		assert!(!w.is_in_window(past_end));
	}

	#[test]
	fn empty_string_is_no_window() {
		assert_eq!(RebootWindow::parse("").unwrap(), None);
	}

	#[test]
	fn rejects_garbage() {
		assert!(RebootWindow::parse("invalid").is_err());
	}

	#[test]
	fn rejects_out_of_range_hours() {
		assert!(RebootWindow::parse("Sun 25:00-26:00").is_err());
	}
}
