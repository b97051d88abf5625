use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inventory::Base;

/// A content-addressed build artifact. The core treats `store_path` as an
/// opaque identifier; it never parses or rewrites it. The evaluator
/// guarantees that its transitive dependencies are present on disk
/// wherever `store_path` is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
	pub store_path: String,
	pub manifest_hash: String,
	pub base: Base,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GenerationResult {
	Ok,
	Failed,
	RolledBack,
}

/// A numbered, activated closure on a specific host. Append-only; managed
/// exclusively by the Platform Activator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
	pub id: u64,
	pub store_path: String,
	pub activated_at: DateTime<Utc>,
	pub result: GenerationResult,
}

impl Generation {
	/// `len({g : g.result == ok})` must be non-decreasing across Apply runs
	/// (spec invariant 3); callers append, never remove, `ok` generations.
	pub fn is_ok(&self) -> bool {
		matches!(self.result, GenerationResult::Ok)
	}
}

/// The current generation for a host: the `ok` generation with the largest
/// `activated_at`.
pub fn current_generation(generations: &[Generation]) -> Option<&Generation> {
	generations
		.iter()
		.filter(|g| g.is_ok())
		.max_by_key(|g| g.activated_at)
}

/// Retention policy: keep at least `min_ok_retained` most recent `ok`
/// generations so rollback always has a target (spec.md §3, Open Questions).
/// Non-`ok` generations older than `max_age` (if given) are dropped; `ok`
/// generations beyond the retention count are dropped regardless of age.
pub fn prune_generations(
	generations: &mut Vec<Generation>,
	min_ok_retained: usize,
	max_age: Option<chrono::Duration>,
) {
	let min_ok_retained = min_ok_retained.max(2);
	let mut ok_by_recency: Vec<u64> = generations
		.iter()
		.filter(|g| g.is_ok())
		.map(|g| g.id)
		.collect();
	ok_by_recency.sort_by_key(|id| {
		std::cmp::Reverse(generations.iter().find(|g| g.id == *id).unwrap().activated_at)
	});
	let keep_ok_ids: std::collections::HashSet<u64> =
		ok_by_recency.into_iter().take(min_ok_retained).collect();

	let now = Utc::now();
	generations.retain(|g| {
		if g.is_ok() {
			return keep_ok_ids.contains(&g.id);
		}
		match max_age {
			Some(age) => now - g.activated_at <= age,
			None => true,
		}
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	fn gen(id: u64, hours_ago: i64, result: GenerationResult) -> Generation {
		Generation {
			id,
			store_path: format!("/nix/store/{id}"),
			activated_at: Utc::now() - chrono::Duration::hours(hours_ago),
			result,
		}
	}

	#[test]
	fn current_generation_is_latest_ok() {
		let gens = vec![
			gen(1, 10, GenerationResult::Ok),
			gen(2, 5, GenerationResult::Ok),
			gen(3, 1, GenerationResult::Failed),
		];
		assert_eq!(current_generation(&gens).unwrap().id, 2);
	}

	#[test]
	fn retains_at_least_two_ok_generations() {
		let mut gens = vec![
			gen(1, 30, GenerationResult::Ok),
			gen(2, 20, GenerationResult::Ok),
			gen(3, 10, GenerationResult::Ok),
		];
		prune_generations(&mut gens, 2, None);
		assert_eq!(gens.iter().filter(|g| g.is_ok()).count(), 2);
		assert!(gens.iter().any(|g| g.id == 3));
		assert!(gens.iter().any(|g| g.id == 2));
	}
}
