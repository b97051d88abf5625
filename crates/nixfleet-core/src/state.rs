//! State Store: the target's `/var/lib/nixfleet/state.json`, read via the
//! Executor's `cat` and written with a write-then-rename sequence (spec.md
//! §4.7). Authority over `HostState` lies with the target; the control
//! machine only reads it for display and drift comparison.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::closure::Generation;
use crate::error::NixFleetError;
use crate::executor::RemoteCommand;
use crate::inventory::Base;

const STATE_PATH: &str = "/var/lib/nixfleet/state.json";
const LOCK_PATH: &str = "/var/lib/nixfleet/state.lock";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitHealth {
	pub active: bool,
	pub enabled: bool,
	pub sub_state: String,
	pub last_check: DateTime<Utc>,
}

/// A file the closure's `activate` script materializes, tracked so drift
/// scans and restart ordering (spec.md §5) have something to diff against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedFile {
	pub hash: String,
	pub mode: u32,
	pub owner: String,
	pub group: String,
	pub restart_units: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostState {
	pub hostname: String,
	pub base: Base,
	pub current_generation: Option<Generation>,
	/// Bounded append-only generation history (spec.md §3's "Generations are
	/// append-only per host"), pruned to `retained_generations` on write so
	/// the standalone rollback verb always has a target without the file
	/// growing unbounded.
	#[serde(default)]
	pub recent_generations: Vec<Generation>,
	pub last_apply: Option<DateTime<Utc>>,
	pub manifest_hash: Option<String>,
	pub service_health: BTreeMap<String, UnitHealth>,
	pub managed_files: BTreeMap<String, ManagedFile>,
	pub reboot_required: bool,
	pub reboot_packages: Vec<String>,
	pub pending_updates: u32,
	pub security_updates: u32,
	pub drift_detected: bool,
	pub drift_files: Vec<String>,
	pub state_version: u32,
	pub updated_at: DateTime<Utc>,
}

impl HostState {
	pub fn new(hostname: String, base: Base) -> Self {
		Self {
			hostname,
			base,
			current_generation: None,
			recent_generations: Vec::new(),
			last_apply: None,
			manifest_hash: None,
			service_health: BTreeMap::new(),
			managed_files: BTreeMap::new(),
			reboot_required: false,
			reboot_packages: Vec::new(),
			pending_updates: 0,
			security_updates: 0,
			drift_detected: false,
			drift_files: Vec::new(),
			state_version: STATE_VERSION,
			updated_at: Utc::now(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileChange {
	Added { path: String },
	Changed { path: String },
	Removed { path: String },
}

/// The projected effect of activating a proposed closure, produced before
/// Apply for dry-run/PR-style previews (spec.md §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanDiff {
	pub file_changes: Vec<FileChange>,
	pub units_to_restart: Vec<String>,
	pub packages_added: Vec<String>,
	pub packages_removed: Vec<String>,
}

/// Compares the currently recorded `managedFiles` against the set the
/// proposed closure would install.
pub fn diff(expected: &BTreeMap<String, ManagedFile>, actual: &BTreeMap<String, ManagedFile>) -> PlanDiff {
	let mut file_changes = Vec::new();
	let mut units_to_restart = std::collections::BTreeSet::new();

	for (path, expected_file) in expected {
		match actual.get(path) {
			None => {
				file_changes.push(FileChange::Added { path: path.clone() });
				units_to_restart.extend(expected_file.restart_units.iter().cloned());
			}
			Some(actual_file) => {
				if actual_file.hash != expected_file.hash
					|| actual_file.mode != expected_file.mode
					|| actual_file.owner != expected_file.owner
					|| actual_file.group != expected_file.group
				{
					file_changes.push(FileChange::Changed { path: path.clone() });
					units_to_restart.extend(expected_file.restart_units.iter().cloned());
				}
			}
		}
	}
	for path in actual.keys() {
		if !expected.contains_key(path) {
			file_changes.push(FileChange::Removed { path: path.clone() });
		}
	}

	PlanDiff {
		file_changes,
		units_to_restart: units_to_restart.into_iter().collect(),
		packages_added: Vec::new(),
		packages_removed: Vec::new(),
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftStatus {
	Ok,
	Missing,
	ContentChanged,
	PermissionsChanged,
}

/// Reads `state.json` off the target via `cat`, returning `None` if the
/// target has never been managed by NixFleet before (file absent).
pub async fn read_state(
	session: Arc<openssh::Session>,
	ctx: &CancellationToken,
) -> Result<Option<HostState>, NixFleetError> {
	let out = RemoteCommand::on_session(session, "cat")
		.arg(STATE_PATH)
		.run(ctx)
		.await?;
	if !out.success() {
		return Ok(None);
	}
	serde_json::from_slice(&out.stdout)
		.map(Some)
		.map_err(|e| NixFleetError::Transport {
			host: "remote".into(),
			source: anyhow::anyhow!(e),
		})
}

/// Writes `state.json` atomically: serialize to a temp path alongside the
/// target, then `mv` it into place, mirroring the teacher's
/// `NamedTempFile::persist` local atomic-overwrite pattern, adapted to a
/// remote temp-file-then-rename sequence over the Executor.
pub async fn write_state(
	session: Arc<openssh::Session>,
	state: &HostState,
	ctx: &CancellationToken,
) -> Result<(), NixFleetError> {
	let serialized = serde_json::to_string_pretty(state).map_err(|e| NixFleetError::Transport {
		host: state.hostname.clone(),
		source: anyhow::anyhow!(e),
	})?;
	let tmp_path = format!("{STATE_PATH}.tmp");

	let mkdir = RemoteCommand::on_session(session.clone(), "mkdir")
		.arg("-p")
		.arg("/var/lib/nixfleet")
		.sudo()
		.run(ctx)
		.await?;
	if !mkdir.success() {
		return Err(NixFleetError::Transport {
			host: state.hostname.clone(),
			source: anyhow::anyhow!("mkdir -p /var/lib/nixfleet exited {}", mkdir.exit_code),
		});
	}

	let write = RemoteCommand::on_session(session.clone(), "tee")
		.arg(&tmp_path)
		.sudo()
		.run_with_stdin(ctx, serialized.into_bytes())
		.await?;
	if !write.success() {
		return Err(NixFleetError::Transport {
			host: state.hostname.clone(),
			source: anyhow::anyhow!("write to {tmp_path} exited {}", write.exit_code),
		});
	}

	let rename = RemoteCommand::on_session(session, "mv")
		.arg(&tmp_path)
		.arg(STATE_PATH)
		.sudo()
		.run(ctx)
		.await?;
	if !rename.success() {
		return Err(NixFleetError::Transport {
			host: state.hostname.clone(),
			source: anyhow::anyhow!("rename of {tmp_path} exited {}", rename.exit_code),
		});
	}
	Ok(())
}

/// Advisory lock guard for `state.json` (spec.md §5): writers refuse to
/// proceed if a lock held by a still-running pid exists. Held for the
/// duration of a single Apply's state-writing phase.
pub async fn acquire_state_lock(
	session: Arc<openssh::Session>,
	ctx: &CancellationToken,
) -> Result<(), NixFleetError> {
	let check = RemoteCommand::on_session(session.clone(), "sh")
		.arg("-c")
		.arg(format!(
			"test -f {LOCK_PATH} && kill -0 \"$(cat {LOCK_PATH})\" 2>/dev/null"
		))
		.run(ctx)
		.await?;
	if check.success() {
		return Err(NixFleetError::Busy {
			host: "remote".into(),
		});
	}
	let write = RemoteCommand::on_session(session, "sh")
		.arg("-c")
		.arg(format!("mkdir -p /var/lib/nixfleet && echo $$ > {LOCK_PATH}"))
		.sudo()
		.run(ctx)
		.await?;
	if !write.success() {
		return Err(NixFleetError::Transport {
			host: "remote".into(),
			source: anyhow::anyhow!("failed to write state lock"),
		});
	}
	Ok(())
}

pub async fn release_state_lock(
	session: Arc<openssh::Session>,
	ctx: &CancellationToken,
) -> Result<(), NixFleetError> {
	let out = RemoteCommand::on_session(session, "rm")
		.arg("-f")
		.arg(LOCK_PATH)
		.sudo()
		.run(ctx)
		.await?;
	if !out.success() {
		return Err(NixFleetError::Transport {
			host: "remote".into(),
			source: anyhow::anyhow!("failed to release state lock"),
		});
	}
	Ok(())
}

/// Classifies one managed file against its on-disk reality. Callers build
/// `actual` by hashing/`stat`-ing each path via the Executor; kept pure
/// here so it is trivially unit-testable without SSH.
pub fn classify_drift(expected: &ManagedFile, actual: Option<&(String, u32, String, String)>) -> DriftStatus {
	match actual {
		None => DriftStatus::Missing,
		Some((hash, mode, owner, group)) => {
			if hash != &expected.hash {
				DriftStatus::ContentChanged
			} else if *mode != expected.mode || owner != &expected.owner || group != &expected.group {
				DriftStatus::PermissionsChanged
			} else {
				DriftStatus::Ok
			}
		}
	}
}

pub fn sha256_hex(content: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(content);
	format!("{:x}", hasher.finalize())
}

/// Stats and hashes every managed file on the target, classifies each
/// against its recorded expectation, and folds the result into
/// `drift_detected`/`drift_files` (spec.md §3's per-phase state update).
pub async fn scan_drift(
	session: Arc<openssh::Session>,
	managed_files: &BTreeMap<String, ManagedFile>,
	ctx: &CancellationToken,
) -> (bool, Vec<String>) {
	let mut drift_files = Vec::new();
	for (path, expected) in managed_files {
		let out = RemoteCommand::on_session(session.clone(), "sh")
			.arg("-c")
			.arg(format!(
				"stat -c '%a %U %G' {path} 2>/dev/null && sha256sum {path} 2>/dev/null | cut -d' ' -f1"
			))
			.run(ctx)
			.await;
		let actual = match out {
			Ok(o) if o.success() => parse_stat_and_hash(&o.stdout_string()),
			_ => None,
		};
		if classify_drift(expected, actual.as_ref()) != DriftStatus::Ok {
			drift_files.push(path.clone());
		}
	}
	(!drift_files.is_empty(), drift_files)
}

fn parse_stat_and_hash(output: &str) -> Option<(String, u32, String, String)> {
	let mut lines = output.lines();
	let stat_line = lines.next()?;
	let hash = lines.next()?.split_whitespace().next()?.to_owned();
	let mut parts = stat_line.split_whitespace();
	let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
	let owner = parts.next()?.to_owned();
	let group = parts.next()?.to_owned();
	Some((hash, mode, owner, group))
}

/// Reads `systemctl show` for each unit touched by the managed-file restart
/// graph, so `HostState.service_health` reflects the units NixFleet actually
/// cares about rather than every unit on the box.
pub async fn scan_service_health(
	session: Arc<openssh::Session>,
	units: &BTreeSet<String>,
	ctx: &CancellationToken,
) -> BTreeMap<String, UnitHealth> {
	let mut out = BTreeMap::new();
	for unit in units {
		let result = RemoteCommand::on_session(session.clone(), "systemctl")
			.arg("show")
			.arg(unit)
			.arg("--property=ActiveState,UnitFileState,SubState")
			.arg("--value")
			.run(ctx)
			.await;
		let Ok(result) = result else { continue };
		if !result.success() {
			continue;
		}
		let mut lines = result.stdout_string().lines().map(str::to_owned).collect::<Vec<_>>().into_iter();
		let active_state = lines.next().unwrap_or_default();
		let unit_file_state = lines.next().unwrap_or_default();
		let sub_state = lines.next().unwrap_or_default();
		out.insert(
			unit.clone(),
			UnitHealth {
				active: active_state == "active",
				enabled: unit_file_state == "enabled",
				sub_state,
				last_check: Utc::now(),
			},
		);
	}
	out
}

/// Facts about pending OS-level maintenance (spec.md §3's `rebootRequired`/
/// `pendingUpdates`/`securityUpdates`). Ubuntu tracks these through
/// `unattended-upgrades`' own marker files and `apt`; NixOS and Darwin have
/// no equivalent concept of a package-manager-driven reboot flag, so they
/// report the all-clear defaults rather than approximating one.
pub async fn scan_system_facts(
	session: Arc<openssh::Session>,
	base: Base,
	ctx: &CancellationToken,
) -> (bool, Vec<String>, u32, u32) {
	if base != Base::Ubuntu {
		return (false, Vec::new(), 0, 0);
	}

	let reboot_required = RemoteCommand::on_session(session.clone(), "test")
		.arg("-f")
		.arg("/var/run/reboot-required")
		.run(ctx)
		.await
		.map(|o| o.success())
		.unwrap_or(false);

	let reboot_packages = if reboot_required {
		RemoteCommand::on_session(session.clone(), "cat")
			.arg("/var/run/reboot-required.pkgs")
			.run(ctx)
			.await
			.ok()
			.filter(|o| o.success())
			.map(|o| o.stdout_string().lines().map(str::to_owned).collect())
			.unwrap_or_default()
	} else {
		Vec::new()
	};

	let upgradable = RemoteCommand::on_session(session.clone(), "sh")
		.arg("-c")
		.arg("apt list --upgradable 2>/dev/null | tail -n +2")
		.run(ctx)
		.await
		.ok()
		.filter(|o| o.success())
		.map(|o| o.stdout_string())
		.unwrap_or_default();
	let pending_updates = upgradable.lines().filter(|l| !l.is_empty()).count() as u32;
	let security_updates = upgradable.lines().filter(|l| l.contains("-security")).count() as u32;

	(reboot_required, reboot_packages, pending_updates, security_updates)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn file(hash: &str, mode: u32) -> ManagedFile {
		ManagedFile {
			hash: hash.to_owned(),
			mode,
			owner: "root".to_owned(),
			group: "root".to_owned(),
			restart_units: vec!["web.service".to_owned()],
		}
	}

	#[test]
	fn drift_classifies_missing() {
		assert_eq!(classify_drift(&file("abc", 0o644), None), DriftStatus::Missing);
	}

	#[test]
	fn drift_classifies_content_changed() {
		let actual = ("def".to_owned(), 0o644, "root".to_owned(), "root".to_owned());
		assert_eq!(
			classify_drift(&file("abc", 0o644), Some(&actual)),
			DriftStatus::ContentChanged
		);
	}

	#[test]
	fn drift_classifies_permissions_changed() {
		let actual = ("abc".to_owned(), 0o600, "root".to_owned(), "root".to_owned());
		assert_eq!(
			classify_drift(&file("abc", 0o644), Some(&actual)),
			DriftStatus::PermissionsChanged
		);
	}

	#[test]
	fn drift_classifies_ok() {
		let actual = ("abc".to_owned(), 0o644, "root".to_owned(), "root".to_owned());
		assert_eq!(classify_drift(&file("abc", 0o644), Some(&actual)), DriftStatus::Ok);
	}

	#[test]
	fn diff_detects_added_and_removed() {
		let mut expected = BTreeMap::new();
		expected.insert("/etc/a".to_owned(), file("abc", 0o644));
		let mut actual = BTreeMap::new();
		actual.insert("/etc/b".to_owned(), file("xyz", 0o644));

		let d = diff(&expected, &actual);
		assert!(d
			.file_changes
			.contains(&FileChange::Added { path: "/etc/a".to_owned() }));
		assert!(d
			.file_changes
			.contains(&FileChange::Removed { path: "/etc/b".to_owned() }));
		assert!(d.units_to_restart.contains(&"web.service".to_owned()));
	}

	#[test]
	fn sha256_hex_is_stable() {
		assert_eq!(
			sha256_hex(b"hello"),
			"2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
		);
	}

	#[test]
	fn parse_stat_and_hash_reads_stat_then_hash_line() {
		let output = "644 root root\nabc123  /etc/nginx.conf\n";
		let (hash, mode, owner, group) = parse_stat_and_hash(output).unwrap();
		assert_eq!(hash, "abc123");
		assert_eq!(mode, 0o644);
		assert_eq!(owner, "root");
		assert_eq!(group, "root");
	}

	#[test]
	fn parse_stat_and_hash_rejects_short_output() {
		assert!(parse_stat_and_hash("644 root root\n").is_none());
		assert!(parse_stat_and_hash("").is_none());
	}
}
