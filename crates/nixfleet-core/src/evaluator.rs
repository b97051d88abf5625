//! Narrow interface to the external build-system evaluator (out of scope
//! per spec.md §1; the core only consumes its `eval`/`build`/`path_info`/
//! `copy` primitives). Grounded on the teacher's `nix copy
//! --substitute-on-destination --to ssh-ng://<host>` invocation in
//! `cmds/fleet/src/cmds/build_systems.rs`.

use async_trait::async_trait;

use crate::closure::Closure;
use crate::inventory::Host;

#[derive(Debug, Clone)]
pub struct PathInfo {
	pub nar_hash: String,
	pub closure_size: u64,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
	async fn eval(&self, attr: &str) -> anyhow::Result<String>;
	async fn build(&self, attr: &str, host: &Host) -> anyhow::Result<Closure>;
	async fn path_info(&self, store_path: &str) -> anyhow::Result<PathInfo>;
	async fn copy(&self, store_path: &str, host: &Host) -> anyhow::Result<()>;
}

/// Shells out to `nix`, the way the teacher does (`nix copy
/// --substitute-on-destination --to ssh-ng://<host>`, retried up to 3 times
/// with a 5s backoff on transient copy failures).
pub struct NixEvaluator {
	pub flake_attr_prefix: String,
}

#[async_trait]
impl Evaluator for NixEvaluator {
	async fn eval(&self, attr: &str) -> anyhow::Result<String> {
		let ctx = tokio_util::sync::CancellationToken::new();
		let out = crate::executor::RemoteCommand::local("nix")
			.arg("eval")
			.arg("--json")
			.arg(format!("{}.{attr}", self.flake_attr_prefix))
			.run(&ctx)
			.await?;
		if !out.success() {
			anyhow::bail!("nix eval {attr} failed: {}", out.stdout_string());
		}
		Ok(out.stdout_string())
	}

	async fn build(&self, attr: &str, host: &Host) -> anyhow::Result<Closure> {
		let ctx = tokio_util::sync::CancellationToken::new();
		let out = crate::executor::RemoteCommand::local("nix")
			.arg("build")
			.arg("--no-link")
			.arg("--print-out-paths")
			.arg(format!("{}.{attr}", self.flake_attr_prefix))
			.run(&ctx)
			.await?;
		if !out.success() {
			anyhow::bail!("nix build {attr} failed");
		}
		let store_path = out.stdout_string().trim().to_owned();
		let info = self.path_info(&store_path).await?;
		Ok(Closure {
			store_path,
			manifest_hash: info.nar_hash,
			base: host.base,
		})
	}

	async fn path_info(&self, store_path: &str) -> anyhow::Result<PathInfo> {
		let ctx = tokio_util::sync::CancellationToken::new();
		let out = crate::executor::RemoteCommand::local("nix")
			.arg("path-info")
			.arg("--json")
			.arg(store_path)
			.run(&ctx)
			.await?;
		#[derive(serde::Deserialize)]
		struct Entry {
			#[serde(rename = "narHash")]
			nar_hash: String,
			#[serde(rename = "closureSize")]
			closure_size: u64,
		}
		let entries: Vec<Entry> = serde_json::from_slice(&out.stdout)?;
		let entry = entries
			.into_iter()
			.next()
			.ok_or_else(|| anyhow::anyhow!("nix path-info returned no entries"))?;
		Ok(PathInfo {
			nar_hash: entry.nar_hash,
			closure_size: entry.closure_size,
		})
	}

	async fn copy(&self, store_path: &str, host: &Host) -> anyhow::Result<()> {
		let ctx = tokio_util::sync::CancellationToken::new();
		let mut tries = 0;
		loop {
			let out = crate::executor::RemoteCommand::local("nix")
				.arg("copy")
				.arg("--substitute-on-destination")
				.arg("--to")
				.arg(format!("ssh-ng://{}@{}", host.user, host.address))
				.arg(store_path)
				.run(&ctx)
				.await?;
			if out.success() {
				return Ok(());
			}
			tries += 1;
			if tries >= 3 {
				anyhow::bail!("nix copy to {} failed after {tries} tries", host.name);
			}
			tokio::time::sleep(std::time::Duration::from_millis(5000)).await;
		}
	}
}

/// In-memory `Evaluator` for tests that need a closure without shelling out
/// to `nix`: returns a canned store path derived from `attr`, optionally
/// failing `build`/`copy` on demand to exercise the Pipeline's error paths.
#[derive(Default)]
pub struct FakeEvaluator {
	pub fail_build: bool,
	pub fail_copy: bool,
	pub manifest_hash: String,
}

#[async_trait]
impl Evaluator for FakeEvaluator {
	async fn eval(&self, attr: &str) -> anyhow::Result<String> {
		Ok(format!("/nix/store/fake-{attr}"))
	}

	async fn build(&self, attr: &str, host: &Host) -> anyhow::Result<Closure> {
		if self.fail_build {
			anyhow::bail!("fake build failure for {attr}");
		}
		Ok(Closure {
			store_path: format!("/nix/store/fake-{attr}-{}", host.name),
			manifest_hash: if self.manifest_hash.is_empty() {
				"fakehash".to_owned()
			} else {
				self.manifest_hash.clone()
			},
			base: host.base,
		})
	}

	async fn path_info(&self, store_path: &str) -> anyhow::Result<PathInfo> {
		Ok(PathInfo {
			nar_hash: format!("fake-nar-{store_path}"),
			closure_size: 0,
		})
	}

	async fn copy(&self, _store_path: &str, host: &Host) -> anyhow::Result<()> {
		if self.fail_copy {
			anyhow::bail!("fake copy failure for {}", host.name);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::inventory::{Base, Host};

	fn host() -> Host {
		Host {
			name: "web1".into(),
			address: "web1.example".into(),
			user: "root".into(),
			port: 22,
			base: Base::Nixos,
			ssh_key_refs: Vec::new(),
			reboot_window: None,
		}
	}

	#[tokio::test]
	async fn fake_evaluator_builds_a_closure_per_host() {
		let evaluator = FakeEvaluator::default();
		let closure = evaluator.build("fleet.web", &host()).await.unwrap();
		assert!(closure.store_path.contains("web1"));
		assert_eq!(closure.base, Base::Nixos);
	}

	#[tokio::test]
	async fn fake_evaluator_honors_fail_build() {
		let evaluator = FakeEvaluator {
			fail_build: true,
			..Default::default()
		};
		assert!(evaluator.build("fleet.web", &host()).await.is_err());
	}
}
