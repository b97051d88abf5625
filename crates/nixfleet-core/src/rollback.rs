//! Rollback Controller: selects a prior generation and re-activates it,
//! guided by policy (spec.md §2 component 9). Invoked by the Apply
//! Pipeline on health failure when `healthCheckPolicy == rollback`, and by
//! the standalone `rollback` CLI verb.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::activator::PlatformSwitch;
use crate::closure::{Closure, Generation, GenerationResult};
use crate::error::NixFleetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackPolicy {
	/// Roll back to the most recent `ok` generation other than the one just
	/// (attempted to be) activated.
	PreviousOk,
	/// Roll back to a specific, caller-named generation id.
	ToGeneration(u64),
}

/// Chooses the rollback target out of a host's known generation history.
pub fn select_target(generations: &[Generation], exclude_store_path: &str, policy: RollbackPolicy) -> Option<Generation> {
	match policy {
		RollbackPolicy::PreviousOk => generations
			.iter()
			.filter(|g| g.is_ok() && g.store_path != exclude_store_path)
			.max_by_key(|g| g.activated_at)
			.cloned(),
		RollbackPolicy::ToGeneration(id) => generations.iter().find(|g| g.id == id).cloned(),
	}
}

/// Re-activates `target` on `session` via the platform switch primitive and
/// records the resulting generation with `result = rolled-back`, matching
/// the scenario in spec.md §8 (generation N recorded as `rolled-back`,
/// `currentGeneration` pointing back at the prior `ok` generation).
pub async fn rollback_to(
	switcher: &dyn PlatformSwitch,
	session: Arc<openssh::Session>,
	target: &Generation,
	next_generation_id: u64,
	ctx: &CancellationToken,
) -> Result<Generation, NixFleetError> {
	info!(store_path = %target.store_path, "rolling back");
	switcher.switch_back(session, &target.store_path, ctx).await?;
	Ok(Generation {
		id: next_generation_id,
		store_path: target.store_path.clone(),
		activated_at: chrono::Utc::now(),
		result: GenerationResult::RolledBack,
	})
}

/// Convenience wrapper used by the Pipeline's health-failure path: picks the
/// previous `ok` generation and rolls back to it in one call.
pub async fn rollback_to_previous(
	switcher: &dyn PlatformSwitch,
	session: Arc<openssh::Session>,
	generations: &[Generation],
	failed_closure: &Closure,
	next_generation_id: u64,
	ctx: &CancellationToken,
) -> Result<Generation, NixFleetError> {
	let Some(target) = select_target(generations, &failed_closure.store_path, RollbackPolicy::PreviousOk) else {
		warn!("no prior ok generation to roll back to");
		return Err(NixFleetError::Rollback {
			host: "".to_owned(),
			reason: "no prior ok generation available".to_owned(),
		});
	};
	rollback_to(switcher, session, &target, next_generation_id, ctx).await
}

#[cfg(test)]
mod tests {
	use super::*;

	fn gen(id: u64, hours_ago: i64, path: &str, result: GenerationResult) -> Generation {
		Generation {
			id,
			store_path: path.to_owned(),
			activated_at: chrono::Utc::now() - chrono::Duration::hours(hours_ago),
			result,
		}
	}

	#[test]
	fn selects_most_recent_ok_excluding_failed() {
		let gens = vec![
			gen(1, 20, "/nix/store/a", GenerationResult::Ok),
			gen(2, 10, "/nix/store/b", GenerationResult::Ok),
			gen(3, 1, "/nix/store/c", GenerationResult::Failed),
		];
		let target = select_target(&gens, "/nix/store/c", RollbackPolicy::PreviousOk).unwrap();
		assert_eq!(target.store_path, "/nix/store/b");
	}

	#[test]
	fn to_generation_picks_exact_id() {
		let gens = vec![
			gen(1, 20, "/nix/store/a", GenerationResult::Ok),
			gen(2, 10, "/nix/store/b", GenerationResult::Ok),
		];
		let target = select_target(&gens, "/nix/store/b", RollbackPolicy::ToGeneration(1)).unwrap();
		assert_eq!(target.id, 1);
	}

	#[test]
	fn no_target_when_history_empty() {
		assert!(select_target(&[], "/nix/store/a", RollbackPolicy::PreviousOk).is_none());
	}
}
