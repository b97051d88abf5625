//! The standalone `rollback` verb: reads each host's persisted generation
//! history and re-activates the most recent `ok` generation, independent of
//! the Apply Pipeline's build/copy/health-check machinery.

use std::sync::Arc;

use nixfleet_core::inventory::Host;
use nixfleet_core::pool::Pool;
use nixfleet_core::rollback::{rollback_to, select_target, RollbackPolicy};
use nixfleet_core::{activator, state};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct HostOutcome {
	pub host: String,
	pub success: bool,
	pub message: String,
}

/// Rolls back every selected host to its previous `ok` generation. Hosts
/// with no persisted state, or no `ok` generation besides the current one,
/// are reported as failures rather than silently skipped.
pub async fn run(hosts: &[Host], pool: Arc<Pool>, ctx: CancellationToken) -> Vec<HostOutcome> {
	let mut outcomes = Vec::with_capacity(hosts.len());
	for host in hosts {
		let outcome = rollback_one(host, pool.clone(), &ctx).await;
		match &outcome.success {
			true => info!(host = %host.name, "rolled back"),
			false => warn!(host = %host.name, message = %outcome.message, "rollback failed"),
		}
		outcomes.push(outcome);
	}
	outcomes
}

async fn rollback_one(host: &Host, pool: Arc<Pool>, ctx: &CancellationToken) -> HostOutcome {
	let fail = |message: String| HostOutcome {
		host: host.name.clone(),
		success: false,
		message,
	};

	let session = match pool.acquire(&host.pool_key()).await {
		Ok(s) => s,
		Err(e) => return fail(format!("could not connect: {e}")),
	};

	let Some(host_state) = state::read_state(session.clone(), ctx).await.unwrap_or(None) else {
		return fail("no persisted state, nothing to roll back".to_owned());
	};
	let Some(current) = host_state.current_generation.clone() else {
		return fail("host has no current generation on record".to_owned());
	};
	let Some(target) = select_target(&host_state.recent_generations, &current.store_path, RollbackPolicy::PreviousOk) else {
		return fail("no prior ok generation to roll back to".to_owned());
	};

	let switcher = activator::platform_switch(host.base);
	let next_id = host_state.recent_generations.iter().map(|g| g.id).max().unwrap_or(current.id).saturating_add(1);
	let rolled_back = match rollback_to(switcher.as_ref(), session.clone(), &target, next_id, ctx).await {
		Ok(g) => g,
		Err(e) => return fail(format!("switch_back failed: {e}")),
	};

	let mut new_state = host_state;
	new_state.recent_generations.push(rolled_back.clone());
	new_state.current_generation = Some(rolled_back);
	new_state.updated_at = chrono::Utc::now();

	if let Err(e) = state::acquire_state_lock(session.clone(), ctx).await {
		error!(host = %host.name, error = %e, "rolled back but could not lock state for persisting");
		return HostOutcome {
			host: host.name.clone(),
			success: true,
			message: "rolled back, state write skipped (lock unavailable)".to_owned(),
		};
	}
	let write_result = state::write_state(session.clone(), &new_state, ctx).await;
	let _ = state::release_state_lock(session, ctx).await;
	if let Err(e) = write_result {
		error!(host = %host.name, error = %e, "rolled back but failed to persist new state");
	}

	HostOutcome {
		host: host.name.clone(),
		success: true,
		message: format!("rolled back to {}", target.store_path),
	}
}
