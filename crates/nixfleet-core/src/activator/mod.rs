//! Platform Activator: the atomic swap from the current generation to the
//! newly copied one (spec.md §4.5). The three back-ends share this state
//! machine and differ only in the switch primitive, dispatched by a small
//! trait (spec.md §9) rather than an inheritance hierarchy — the teacher's
//! `Activator { switch(...) }` shape named directly in the design notes.

pub mod darwin;
pub mod nixos;
pub mod ubuntu;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::closure::{Closure, Generation, GenerationResult};
use crate::error::NixFleetError;
use crate::executor::RemoteCommand;
use crate::inventory::{Base, Host};
use crate::state::ManagedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchAction {
	/// Upload only, no switch.
	Upload,
	/// Activate now, revert to the prior generation on next boot.
	Test,
	/// Set the boot default, do not activate now.
	Boot,
	/// Set the boot default and activate now.
	Switch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivatorState {
	Prepared,
	Staged,
	Switching,
	Activated,
	Committed,
	Aborted,
	RollingBack,
	RolledBack,
	Broken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployAction {
	Switched,
	Noop,
}

#[derive(Debug, Clone)]
pub struct ActivationOutcome {
	pub state: ActivatorState,
	pub action: DeployAction,
	pub generation: Option<Generation>,
	pub degraded: bool,
}

/// The platform-specific "switch primitive" (spec.md §4.5). Implementors
/// perform the single atomic call that makes `closure` the running system
/// state and return whether it succeeded.
#[async_trait]
pub trait PlatformSwitch: Send + Sync {
	async fn switch(
		&self,
		session: Arc<openssh::Session>,
		closure: &Closure,
		action: SwitchAction,
		ctx: &CancellationToken,
	) -> Result<(), NixFleetError>;

	/// Runs the rollback-side switch primitive against a prior generation's
	/// store path, used by `ROLLING_BACK`.
	async fn switch_back(
		&self,
		session: Arc<openssh::Session>,
		prior_store_path: &str,
		ctx: &CancellationToken,
	) -> Result<(), NixFleetError>;

	/// Whether this platform has an unattended, target-side rollback path
	/// (marker file + `systemd-run` watchdog timer) for the case where
	/// `switch` succeeds but leaves SSH unreachable, so the Pipeline's own
	/// `switch_back` over the same (possibly dead) session can never run.
	/// Ubuntu and NixOS have `systemd`; Darwin does not, so its rollback
	/// stays pipeline-driven only.
	fn supports_watchdog(&self) -> bool {
		false
	}
}

const ROLLBACK_MARKER: &str = "/etc/nixfleet-rollback-marker";
const WATCHDOG_ARM_TIMER: &str = "nixfleet-rollback-watchdog-run";
const WATCHDOG_SERVICE: &str = "nixfleet-rollback-watchdog.service";
const WATCHDOG_GRACE: &str = "3min";

/// Writes the marker the target-side watchdog unit reads to know which
/// generation to restore, then arms a one-shot timer that starts
/// `nixfleet-rollback-watchdog.service` in `WATCHDOG_GRACE` unless disarmed
/// first. Grounded on the teacher's `execute_upload`
/// (`cmds/fleet/src/cmds/build_systems.rs`): `mktemp` + atomic `mv` into
/// place, then `systemd-run --on-active`.
async fn arm_rollback_watchdog(
	session: Arc<openssh::Session>,
	rollback_generation_id: u64,
	ctx: &CancellationToken,
) -> Result<(), NixFleetError> {
	let write_marker = format!(
		"mark=$(mktemp -p /etc -t nixfleet-rollback-marker.XXXXXX) && echo -n {rollback_generation_id} > \"$mark\" && mv --no-clobber \"$mark\" {ROLLBACK_MARKER}"
	);
	let out = RemoteCommand::on_session(session.clone(), "sh")
		.arg("-c")
		.arg(write_marker)
		.sudo()
		.run(ctx)
		.await?;
	if !out.success() {
		return Err(NixFleetError::Activation {
			host: "".to_owned(),
			reason: format!("failed to write rollback marker: {}", String::from_utf8_lossy(&out.stderr)),
		});
	}

	let out = RemoteCommand::on_session(session, "systemd-run")
		.arg("--on-active")
		.arg(WATCHDOG_GRACE)
		.arg("--unit")
		.arg(WATCHDOG_ARM_TIMER)
		.arg("systemctl")
		.arg("start")
		.arg(WATCHDOG_SERVICE)
		.sudo()
		.run(ctx)
		.await?;
	if !out.success() {
		return Err(NixFleetError::Activation {
			host: "".to_owned(),
			reason: format!("failed to arm rollback watchdog: {}", String::from_utf8_lossy(&out.stderr)),
		});
	}
	Ok(())
}

/// Removes the marker and stops the armed timer once a switch has committed
/// (or the Pipeline's own `switch_back` already recovered the host), so the
/// watchdog never fires against a healthy system.
async fn disarm_rollback_watchdog(session: Arc<openssh::Session>, ctx: &CancellationToken) {
	let remove_marker = RemoteCommand::on_session(session.clone(), "rm")
		.arg("-f")
		.arg(ROLLBACK_MARKER)
		.sudo()
		.run(ctx)
		.await;
	if let Err(e) = remove_marker {
		warn!(error = %e, "failed to remove rollback marker");
	}
	let stop_timer = RemoteCommand::on_session(session, "systemctl")
		.arg("stop")
		.arg(format!("{WATCHDOG_ARM_TIMER}.timer"))
		.sudo()
		.run(ctx)
		.await;
	if let Err(e) = stop_timer {
		warn!(error = %e, "failed to disarm rollback watchdog timer");
	}
}

pub fn platform_switch(base: Base) -> Box<dyn PlatformSwitch> {
	match base {
		Base::Ubuntu => Box::new(ubuntu::UbuntuSwitch),
		Base::Nixos => Box::new(nixos::NixosSwitch),
		Base::Darwin => Box::new(darwin::DarwinSwitch),
	}
}

/// Runs `pre_activate_hook` while in `STAGED`; a failure transitions
/// directly to `ABORTED` without attempting a switch.
pub type Hook = Option<String>;

pub struct ActivateRequest<'a> {
	pub host: &'a Host,
	pub session: Arc<openssh::Session>,
	pub closure: &'a Closure,
	pub action: SwitchAction,
	pub current_generation: Option<&'a Generation>,
	pub next_generation_id: u64,
	pub pre_activate: Hook,
	pub post_activate: Hook,
	pub managed_files: &'a BTreeMap<String, ManagedFile>,
	pub restart_graph: &'a BTreeMap<String, BTreeSet<String>>,
}

/// Drives one host through PREPARED → ... → COMMITTED/ABORTED/BROKEN.
/// Not re-entrant for a given host — the Apply Pipeline's per-host lock
/// guarantees only one activation runs per host at a time (spec.md §5).
pub async fn activate(
	switcher: &dyn PlatformSwitch,
	req: ActivateRequest<'_>,
	ctx: &CancellationToken,
) -> Result<ActivationOutcome, NixFleetError> {
	// PREPARED -> idempotence short-circuit.
	if let Some(current) = req.current_generation {
		if current.store_path == req.closure.store_path {
			info!(host = %req.host.name, "closure unchanged, skipping activation");
			return Ok(ActivationOutcome {
				state: ActivatorState::Committed,
				action: DeployAction::Noop,
				generation: Some(current.clone()),
				degraded: false,
			});
		}
	}

	// PREPARED -> STAGED: the copy already completed before activate() is
	// called (Transport precedes Activate in the pipeline), so STAGED is
	// reached unconditionally here.
	let state = ActivatorState::Staged;

	// STAGED: preActivate hook.
	if let Some(hook) = &req.pre_activate {
		let out = RemoteCommand::on_session(req.session.clone(), "sh")
			.arg("-c")
			.arg(hook)
			.run(ctx)
			.await?;
		if !out.success() {
			warn!(host = %req.host.name, "pre-activate hook failed");
			return Ok(ActivationOutcome {
				state: ActivatorState::Aborted,
				action: DeployAction::Noop,
				generation: None,
				degraded: false,
			});
		}
	}
	let _ = state;

	// Arm the target-side watchdog before the switch primitive runs, so an
	// unattended recovery exists for the case it cares about: the switch
	// succeeds but leaves SSH unreachable, and our own `switch_back` over
	// this same session can never run.
	let watchdog_armed = switcher.supports_watchdog()
		&& matches!(req.action, SwitchAction::Switch | SwitchAction::Test)
		&& req.current_generation.is_some();
	if watchdog_armed {
		let rollback_generation_id = req.current_generation.expect("checked above").id;
		if let Err(e) = arm_rollback_watchdog(req.session.clone(), rollback_generation_id, ctx).await {
			warn!(host = %req.host.name, error = %e, "failed to arm rollback watchdog, aborting before switch");
			return Ok(ActivationOutcome {
				state: ActivatorState::Aborted,
				action: DeployAction::Noop,
				generation: None,
				degraded: false,
			});
		}
	}

	// STAGED -> SWITCHING -> ACTIVATED.
	let switch_result = switcher
		.switch(req.session.clone(), req.closure, req.action, ctx)
		.await;

	let switch_result = match switch_result {
		Ok(()) => switch_result,
		Err(_) if matches!(req.action, SwitchAction::Upload) => {
			// Upload-only never reaches SWITCHING; nothing to roll back.
			return Ok(ActivationOutcome {
				state: ActivatorState::Committed,
				action: DeployAction::Switched,
				generation: None,
				degraded: false,
			});
		}
		other => other,
	};

	if let Err(e) = switch_result {
		warn!(host = %req.host.name, error = %e, "switch primitive failed, rolling back");
		let outcome = roll_back(switcher, &req, ctx).await?;
		// Our own `switch_back` ran over the same session: if it succeeded
		// the host is already recovered, so disarm the watchdog. If it
		// failed too (the session is genuinely dead), leave the marker and
		// timer in place — that unattended path is the whole point of
		// arming it.
		if watchdog_armed && matches!(outcome.state, ActivatorState::RolledBack) {
			disarm_rollback_watchdog(req.session.clone(), ctx).await;
		}
		return Ok(outcome);
	}

	if matches!(req.action, SwitchAction::Upload | SwitchAction::Boot) {
		// No activation performed on this host this run (Boot only flips
		// the default for the next boot); commit without restarting units.
		let generation = Generation {
			id: req.next_generation_id,
			store_path: req.closure.store_path.clone(),
			activated_at: chrono::Utc::now(),
			result: GenerationResult::Ok,
		};
		return Ok(ActivationOutcome {
			state: ActivatorState::Committed,
			action: DeployAction::Switched,
			generation: Some(generation),
			degraded: false,
		});
	}

	// ACTIVATED: restart units for changed managed files, in topological
	// order over the `requires` graph, ties broken alphabetically so two
	// runs with the same diff restart in the same order (spec.md §5, §8).
	let order = topo_order(req.restart_graph);
	for unit in &order {
		if let Err(e) = restart_unit(req.session.clone(), unit, ctx).await {
			warn!(host = %req.host.name, unit, error = %e, "failed to restart unit");
		}
	}

	// ACTIVATED -> COMMITTED: postActivate hook. A failure degrades the
	// activation but does not roll it back automatically; Health decides.
	let mut degraded = false;
	if let Some(hook) = &req.post_activate {
		let out = RemoteCommand::on_session(req.session.clone(), "sh")
			.arg("-c")
			.arg(hook)
			.run(ctx)
			.await?;
		if !out.success() {
			warn!(host = %req.host.name, "post-activate hook failed, activation degraded");
			degraded = true;
		}
	}

	let generation = Generation {
		id: req.next_generation_id,
		store_path: req.closure.store_path.clone(),
		activated_at: chrono::Utc::now(),
		result: GenerationResult::Ok,
	};

	if watchdog_armed {
		disarm_rollback_watchdog(req.session.clone(), ctx).await;
	}

	Ok(ActivationOutcome {
		state: ActivatorState::Committed,
		action: DeployAction::Switched,
		generation: Some(generation),
		degraded,
	})
}

async fn roll_back(
	switcher: &dyn PlatformSwitch,
	req: &ActivateRequest<'_>,
	ctx: &CancellationToken,
) -> Result<ActivationOutcome, NixFleetError> {
	let Some(current) = req.current_generation else {
		return Ok(ActivationOutcome {
			state: ActivatorState::Broken,
			action: DeployAction::Noop,
			generation: None,
			degraded: false,
		});
	};
	match switcher
		.switch_back(req.session.clone(), &current.store_path, ctx)
		.await
	{
		Ok(()) => Ok(ActivationOutcome {
			state: ActivatorState::RolledBack,
			action: DeployAction::Noop,
			generation: Some(Generation {
				id: req.next_generation_id,
				store_path: req.closure.store_path.clone(),
				activated_at: chrono::Utc::now(),
				result: GenerationResult::RolledBack,
			}),
			degraded: false,
		}),
		Err(e) => {
			warn!(host = %req.host.name, error = %e, "rollback switch also failed");
			Ok(ActivationOutcome {
				state: ActivatorState::Broken,
				action: DeployAction::Noop,
				generation: None,
				degraded: false,
			})
		}
	}
}

async fn restart_unit(
	session: Arc<openssh::Session>,
	unit: &str,
	ctx: &CancellationToken,
) -> Result<(), NixFleetError> {
	let out = RemoteCommand::on_session(session, "systemctl")
		.arg("restart")
		.arg(unit)
		.sudo()
		.run(ctx)
		.await?;
	if !out.success() {
		return Err(NixFleetError::Activation {
			host: "".to_owned(),
			reason: format!("systemctl restart {unit} exited {}", out.exit_code),
		});
	}
	Ok(())
}

/// Kahn's algorithm over the explicit `requires` graph, ties broken
/// alphabetically by unit name, so determinism holds across runs with an
/// identical diff (spec.md §5, §8 invariant 7).
fn topo_order(graph: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
	// requires: unit -> set of units it depends on (must start first).
	// Build edges dep -> unit so dep is visited before unit.
	let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
	let mut indegree: BTreeMap<&str, usize> = graph.keys().map(|k| (k.as_str(), 0)).collect();
	for (unit, deps) in graph {
		for dep in deps {
			dependents
				.entry(dep.as_str())
				.or_default()
				.insert(unit.as_str());
			*indegree.entry(unit.as_str()).or_insert(0) += 1;
			indegree.entry(dep.as_str()).or_insert(0);
		}
	}

	let mut ready: BTreeSet<&str> = indegree
		.iter()
		.filter(|(_, &deg)| deg == 0)
		.map(|(&u, _)| u)
		.collect();
	let mut order = Vec::new();
	while let Some(&unit) = ready.iter().next() {
		ready.remove(unit);
		order.push(unit.to_owned());
		if let Some(dependents) = dependents.get(unit) {
			for &dependent in dependents {
				let deg = indegree.get_mut(dependent).unwrap();
				*deg -= 1;
				if *deg == 0 {
					ready.insert(dependent);
				}
			}
		}
	}
	order
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn topo_order_is_deterministic_and_respects_requires() {
		let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
		graph.insert("web.service".into(), BTreeSet::from(["db.service".into()]));
		graph.insert("cache.service".into(), BTreeSet::new());
		graph.insert("db.service".into(), BTreeSet::new());

		let order = topo_order(&graph);
		let db_pos = order.iter().position(|u| u == "db.service").unwrap();
		let web_pos = order.iter().position(|u| u == "web.service").unwrap();
		assert!(db_pos < web_pos, "db.service must restart before web.service");

		let order2 = topo_order(&graph);
		assert_eq!(order, order2, "restart order must be deterministic");
	}
}
