//! Apply Pipeline: orchestrates Preflight → Build → Copy → Activate →
//! Health across many hosts with bounded parallelism (spec.md §4.8).
//! Concurrency is a `Semaphore` + `JoinSet`, generalized from the teacher's
//! unbounded `LocalSet`/`spawn_local` fan-out in `BuildSystems::run` to the
//! bounded cap spec.md requires.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::activator::{self, ActivateRequest, ActivatorState, DeployAction, SwitchAction};
use crate::error::NixFleetError;
use crate::evaluator::Evaluator;
use crate::health::{self, HealthProbe, HealthReport};
use crate::inventory::Host;
use crate::pool::Pool;
use crate::preflight::{self, PreflightReport, Probe};
use crate::state::{self, ManagedFile, PlanDiff};
use crate::transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthCheckPolicy {
	Rollback,
	Halt,
	Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostResult {
	pub host: String,
	pub success: bool,
	pub preflight_results: Option<PreflightReport>,
	pub deploy_result: Option<DeployResult>,
	pub health_results: Option<HealthReport>,
	pub plan_diff: Option<PlanDiff>,
	pub rollback_performed: bool,
	pub error_message: Option<String>,
	pub phase_durations: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResult {
	pub state: String,
	pub action: String,
	pub store_path: Option<String>,
	pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResults {
	pub start_time: DateTime<Utc>,
	pub end_time: DateTime<Utc>,
	pub total_hosts: usize,
	pub successful: usize,
	pub failed: usize,
	pub per_host: Vec<HostResult>,
}

pub struct ApplyOptions {
	pub attr: String,
	pub action: SwitchAction,
	pub dry_run: bool,
	pub skip_preflight: bool,
	pub skip_health_checks: bool,
	pub health_check_delay: Duration,
	pub health_check_policy: HealthCheckPolicy,
	pub parallelism: usize,
	pub preflight_probes: Vec<Probe>,
	pub health_probes: Vec<HealthProbe>,
	pub managed_files: BTreeMap<String, ManagedFile>,
	pub restart_graph: BTreeMap<String, BTreeSet<String>>,
	pub pre_activate: Option<String>,
	pub post_activate: Option<String>,
}

/// Guards against two concurrent Apply runs activating the same host
/// (spec.md §5: a second call fails fast with `BusyError`).
#[derive(Default)]
pub struct BusyGuard {
	inflight: Mutex<HashSet<String>>,
}

impl BusyGuard {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	async fn enter(self: &Arc<Self>, host: &str) -> Result<BusyLease, NixFleetError> {
		let mut set = self.inflight.lock().await;
		if !set.insert(host.to_owned()) {
			return Err(NixFleetError::Busy { host: host.to_owned() });
		}
		Ok(BusyLease {
			guard: self.clone(),
			host: host.to_owned(),
		})
	}
}

struct BusyLease {
	guard: Arc<BusyGuard>,
	host: String,
}

impl Drop for BusyLease {
	fn drop(&mut self) {
		let guard = self.guard.clone();
		let host = std::mem::take(&mut self.host);
		tokio::spawn(async move {
			guard.inflight.lock().await.remove(&host);
		});
	}
}

pub async fn apply(
	hosts: &[Host],
	evaluator: Arc<dyn Evaluator>,
	pool: Arc<Pool>,
	busy: Arc<BusyGuard>,
	opts: Arc<ApplyOptions>,
	ctx: CancellationToken,
) -> PipelineResults {
	let start_time = Utc::now();
	let permits = opts.parallelism.max(1);
	let semaphore = Arc::new(Semaphore::new(permits));

	let mut tasks = JoinSet::new();
	for host in hosts {
		let host = host.clone();
		let evaluator = evaluator.clone();
		let pool = pool.clone();
		let busy = busy.clone();
		let opts = opts.clone();
		let semaphore = semaphore.clone();
		let ctx = ctx.child_token();
		tasks.spawn(async move {
			let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
			apply_one_host(&host, evaluator, pool, busy, &opts, &ctx).await
		});
	}

	let mut per_host = Vec::with_capacity(hosts.len());
	while let Some(joined) = tasks.join_next().await {
		match joined {
			Ok(result) => per_host.push(result),
			Err(e) => warn!(error = %e, "apply task panicked"),
		}
	}

	let successful = per_host.iter().filter(|r| r.success).count();
	let failed = per_host.len() - successful;
	PipelineResults {
		start_time,
		end_time: Utc::now(),
		total_hosts: hosts.len(),
		successful,
		failed,
		per_host,
	}
}

async fn apply_one_host(
	host: &Host,
	evaluator: Arc<dyn Evaluator>,
	pool: Arc<Pool>,
	busy: Arc<BusyGuard>,
	opts: &ApplyOptions,
	ctx: &CancellationToken,
) -> HostResult {
	let span = info_span!("host", host = %host.name);
	apply_one_host_inner(host, evaluator, pool, busy, opts, ctx)
		.instrument(span)
		.await
}

async fn apply_one_host_inner(
	host: &Host,
	evaluator: Arc<dyn Evaluator>,
	pool: Arc<Pool>,
	busy: Arc<BusyGuard>,
	opts: &ApplyOptions,
	ctx: &CancellationToken,
) -> HostResult {
	let mut result = HostResult {
		host: host.name.clone(),
		success: false,
		preflight_results: None,
		deploy_result: None,
		health_results: None,
		plan_diff: None,
		rollback_performed: false,
		error_message: None,
		phase_durations: BTreeMap::new(),
	};

	let _lease = match busy.enter(&host.name).await {
		Ok(lease) => lease,
		Err(e) => {
			result.error_message = Some(e.to_string());
			return result;
		}
	};

	// Step 1: acquire session.
	let (elapsed, session) = timed(pool.acquire(&host.pool_key())).await;
	result.phase_durations.insert("acquire".into(), elapsed);
	let session = match session {
		Ok(s) => s,
		Err(e) => {
			warn!(error = %e, "ssh acquire failed");
			result.error_message = Some(format!("SSH: {e}"));
			return result;
		}
	};

	// Read the host's previously recorded state up front: the dry-run path
	// below needs it to build a `PlanDiff`, and the Activator needs the
	// generation it names whether or not this is a dry run.
	let prior_state = state::read_state(session.clone(), ctx).await.ok().flatten();
	let prior_generation = prior_state.as_ref().and_then(|s| s.current_generation.clone());

	// Step 2: preflight.
	if !opts.skip_preflight {
		let (elapsed, report) = timed(preflight::run_preflight(
			session.clone(),
			&host.address,
			&opts.preflight_probes,
			ctx,
		))
		.await;
		result.phase_durations.insert("preflight".into(), elapsed);
		let passed = report.passed;
		result.preflight_results = Some(report);
		if !passed {
			result.error_message = Some("preflight checks failed".into());
			return result;
		}
	}

	// Step 3: build closure (control-machine side, parallel-safe).
	let (elapsed, closure) = timed(evaluator.build(&opts.attr, host)).await;
	result.phase_durations.insert("build".into(), elapsed);
	let closure = match closure {
		Ok(c) => c,
		Err(source) => {
			let e = NixFleetError::Build {
				host: host.name.clone(),
				source,
			};
			warn!(error = %e, "build failed");
			result.error_message = Some(e.to_string());
			return result;
		}
	};

	// Step 4: dry run records the closure, diffs managed files against the
	// host's last recorded state, and stops before transport.
	if opts.dry_run {
		let prior_managed_files = prior_state.as_ref().map(|s| &s.managed_files).cloned().unwrap_or_default();
		result.plan_diff = Some(state::diff(&opts.managed_files, &prior_managed_files));
		result.deploy_result = Some(DeployResult {
			state: "planned".into(),
			action: "dry-run".into(),
			store_path: Some(closure.store_path.clone()),
			degraded: false,
		});
		result.success = true;
		return result;
	}

	// Step 5: transport.
	let (elapsed, copied) = timed(transport::copy_to_host(
		evaluator.as_ref(),
		&closure,
		host,
		session.clone(),
		ctx,
	))
	.await;
	result.phase_durations.insert("copy".into(), elapsed);
	if let Err(e) = copied {
		warn!(error = %e, "transport failed");
		result.error_message = Some(e.to_string());
		return result;
	}

	// Step 6: activate.
	let switcher = activator::platform_switch(host.base);
	let next_generation_id = Utc::now().timestamp_millis().max(0) as u64;
	let req = ActivateRequest {
		host,
		session: session.clone(),
		closure: &closure,
		action: opts.action,
		current_generation: prior_generation.as_ref(),
		next_generation_id,
		pre_activate: opts.pre_activate.clone(),
		post_activate: opts.post_activate.clone(),
		managed_files: &opts.managed_files,
		restart_graph: &opts.restart_graph,
	};
	let (elapsed, outcome) = timed(activator::activate(switcher.as_ref(), req, ctx)).await;
	result.phase_durations.insert("activate".into(), elapsed);
	let outcome = match outcome {
		Ok(o) => o,
		Err(e) => {
			warn!(error = %e, "activation errored");
			result.error_message = Some(e.to_string());
			return result;
		}
	};

	result.deploy_result = Some(DeployResult {
		state: format!("{:?}", outcome.state),
		action: format!("{:?}", outcome.action),
		store_path: outcome.generation.as_ref().map(|g| g.store_path.clone()),
		degraded: outcome.degraded,
	});

	if !matches!(outcome.state, ActivatorState::Committed) {
		result.error_message = Some(format!("activation ended in state {:?}", outcome.state));
		return result;
	}
	if matches!(outcome.action, DeployAction::Noop) {
		info!("closure unchanged, no-op");
		result.success = true;
		return result;
	}

	persist_state(
		session.clone(),
		host,
		prior_state.clone(),
		outcome.generation.clone(),
		&opts.managed_files,
		ctx,
	)
	.await;

	// Step 7: health checks.
	if opts.skip_health_checks {
		result.success = true;
		return result;
	}
	let (elapsed, report) = timed(health::run_health_checks(
		session.clone(),
		opts.health_check_delay,
		&opts.health_probes,
		ctx,
	))
	.await;
	result.phase_durations.insert("health".into(), elapsed);
	let passed = report.passed;
	result.health_results = Some(report);
	if passed {
		result.success = true;
		return result;
	}

	match opts.health_check_policy {
		HealthCheckPolicy::Continue => {
			warn!("health checks failed, continuing per policy");
			result.success = true;
		}
		HealthCheckPolicy::Halt => {
			result.success = false;
			result.error_message = Some("health failed".into());
		}
		HealthCheckPolicy::Rollback => {
			let rollback_switcher = activator::platform_switch(host.base);
			let history = prior_generation.clone().into_iter().collect::<Vec<_>>();
			let rollback_generation_id = next_generation_id.wrapping_add(1);
			match crate::rollback::rollback_to_previous(
				rollback_switcher.as_ref(),
				session.clone(),
				&history,
				&closure,
				rollback_generation_id,
				ctx,
			)
			.await
			{
				Ok(rolled_back_generation) => {
					persist_state(
						session.clone(),
						host,
						prior_state.clone(),
						Some(rolled_back_generation),
						&opts.managed_files,
						ctx,
					)
					.await;
					result.rollback_performed = true;
					result.success = false;
					result.error_message = Some("health failed, rolled back".into());
				}
				Err(e) => {
					warn!(error = %e, "rollback also failed");
					result.rollback_performed = false;
					result.success = false;
					result.error_message = Some("health failed AND rollback failed".into());
				}
			}
		}
	}
	result
}

/// Folds a new generation into the host's persisted state and writes it
/// back to the target (spec.md §4.7). Best-effort: a write failure is
/// logged, not propagated, since the activation itself already succeeded
/// and state is advisory for display/rollback-target-selection, not for
/// correctness of the running system.
async fn persist_state(
	session: Arc<openssh::Session>,
	host: &Host,
	prior_state: Option<state::HostState>,
	new_generation: Option<crate::closure::Generation>,
	managed_files: &BTreeMap<String, ManagedFile>,
	ctx: &CancellationToken,
) {
	let mut host_state = prior_state.unwrap_or_else(|| state::HostState::new(host.name.clone(), host.base));
	if let Some(generation) = new_generation {
		host_state.recent_generations.push(generation.clone());
		host_state.current_generation = Some(generation);
	}
	crate::closure::prune_generations(&mut host_state.recent_generations, 2, None);
	host_state.managed_files = managed_files.clone();

	let (drift_detected, drift_files) = state::scan_drift(session.clone(), managed_files, ctx).await;
	host_state.drift_detected = drift_detected;
	host_state.drift_files = drift_files;

	let units: BTreeSet<String> = managed_files.values().flat_map(|f| f.restart_units.iter().cloned()).collect();
	host_state.service_health = state::scan_service_health(session.clone(), &units, ctx).await;

	let (reboot_required, reboot_packages, pending_updates, security_updates) =
		state::scan_system_facts(session.clone(), host.base, ctx).await;
	host_state.reboot_required = reboot_required;
	host_state.reboot_packages = reboot_packages;
	host_state.pending_updates = pending_updates;
	host_state.security_updates = security_updates;

	host_state.last_apply = Some(Utc::now());
	host_state.updated_at = Utc::now();

	if let Err(e) = state::acquire_state_lock(session.clone(), ctx).await {
		warn!(host = %host.name, error = %e, "failed to acquire state lock, skipping state write");
		return;
	}
	if let Err(e) = state::write_state(session.clone(), &host_state, ctx).await {
		warn!(host = %host.name, error = %e, "failed to persist host state");
	}
	if let Err(e) = state::release_state_lock(session, ctx).await {
		warn!(host = %host.name, error = %e, "failed to release state lock");
	}
}

async fn timed<F: std::future::Future>(fut: F) -> (u64, F::Output) {
	let start = Instant::now();
	let out = fut.await;
	(start.elapsed().as_millis() as u64, out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn busy_guard_rejects_concurrent_apply_of_same_host() {
		let guard = BusyGuard::new();
		let first = guard.enter("web1").await.unwrap();
		let second = guard.enter("web1").await;
		assert!(matches!(second, Err(NixFleetError::Busy { .. })));
		drop(first);
	}

	#[tokio::test]
	async fn busy_guard_allows_different_hosts_concurrently() {
		let guard = BusyGuard::new();
		let a = guard.enter("web1").await.unwrap();
		let b = guard.enter("web2").await.unwrap();
		drop(a);
		drop(b);
	}
}
