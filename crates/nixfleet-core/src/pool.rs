//! SSH connection pool. Sessions are shared across concurrently-running
//! hosts: multiple `acquire` calls for the same `(host, port, user)` key
//! return handles onto the same underlying multiplexed SSH connection, with
//! dialling serialized by a per-key one-shot initializer (`tokio::sync::OnceCell`,
//! the dial-once primitive spec.md §9 calls for, generalized from the
//! teacher's `ConfigHost::open_session`'s `OnceLock<Arc<openssh::Session>>`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use openssh::{KnownHosts, SessionBuilder};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::error::NixFleetError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
	pub host: String,
	pub port: u16,
	pub user: String,
}

impl std::fmt::Display for PoolKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}@{}:{}", self.user, self.host, self.port)
	}
}

/// Host-key verification mode. `Strict` is the default; `InsecureIgnore`
/// exists for CI/ephemeral targets only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
	Strict,
	InsecureIgnore,
}

struct PooledEntry {
	session: OnceCell<Arc<openssh::Session>>,
	last_used: Mutex<Instant>,
}

pub struct PoolConfig {
	pub idle_timeout: Duration,
	pub idle_sweep_interval: Duration,
	pub host_key_policy: HostKeyPolicy,
	pub known_hosts_path: Option<std::path::PathBuf>,
	/// Agent socket first, then each of these private key files, in order.
	pub identity_files: Vec<std::path::PathBuf>,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			idle_timeout: Duration::from_secs(5 * 60),
			idle_sweep_interval: Duration::from_secs(60),
			host_key_policy: HostKeyPolicy::Strict,
			known_hosts_path: None,
			identity_files: Vec::new(),
		}
	}
}

pub struct Pool {
	config: PoolConfig,
	entries: Mutex<HashMap<PoolKey, Arc<PooledEntry>>>,
}

impl Pool {
	pub fn new(config: PoolConfig) -> Arc<Self> {
		let pool = Arc::new(Self {
			config,
			entries: Mutex::new(HashMap::new()),
		});
		let weak = Arc::downgrade(&pool);
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(
				weak.upgrade()
					.map(|p| p.config.idle_sweep_interval)
					.unwrap_or(Duration::from_secs(60)),
			);
			loop {
				interval.tick().await;
				let Some(pool) = weak.upgrade() else {
					break;
				};
				pool.reap_idle().await;
			}
		});
		pool
	}

	async fn reap_idle(&self) {
		let mut entries = self.entries.lock().await;
		let mut to_remove = Vec::new();
		for (key, entry) in entries.iter() {
			let last_used = *entry.last_used.lock().await;
			if last_used.elapsed() > self.config.idle_timeout {
				to_remove.push(key.clone());
			}
		}
		for key in to_remove {
			debug!(%key, "evicting idle ssh session");
			entries.remove(&key);
		}
	}

	/// Returns a handle onto the (possibly already-open) session for `key`,
	/// dialling at most once per key even under concurrent callers.
	pub async fn acquire(&self, key: &PoolKey) -> Result<Arc<openssh::Session>, NixFleetError> {
		let entry = {
			let mut entries = self.entries.lock().await;
			entries
				.entry(key.clone())
				.or_insert_with(|| {
					Arc::new(PooledEntry {
						session: OnceCell::new(),
						last_used: Mutex::new(Instant::now()),
					})
				})
				.clone()
		};

		let session = entry
			.session
			.get_or_try_init(|| self.dial(key))
			.await?
			.clone();
		*entry.last_used.lock().await = Instant::now();
		Ok(session)
	}

	async fn dial(&self, key: &PoolKey) -> Result<Arc<openssh::Session>, NixFleetError> {
		let known_hosts = match self.config.host_key_policy {
			HostKeyPolicy::Strict => KnownHosts::Strict,
			HostKeyPolicy::InsecureIgnore => KnownHosts::Accept,
		};

		let mut builder = SessionBuilder::default();
		builder
			.known_hosts_check(known_hosts)
			.user(key.user.clone())
			.port(key.port);

		if let (HostKeyPolicy::Strict, Some(path)) =
			(self.config.host_key_policy, &self.config.known_hosts_path)
		{
			builder.user_known_hosts_file(path);
		}

		if !self.config.identity_files.is_empty() {
			// Agent socket is tried implicitly by openssh/ssh before any
			// explicit identity file; identity files are tried in order.
			for identity in &self.config.identity_files {
				builder.keyfile(identity);
			}
		}

		info!(%key, "dialling ssh session");
		match builder.connect(&key.host).await {
			Ok(session) => Ok(Arc::new(session)),
			Err(e) => {
				warn!(%key, error = %e, "ssh dial failed");
				Err(NixFleetError::Transport {
					host: key.host.clone(),
					source: anyhow::anyhow!(e),
				})
			}
		}
	}

	/// Closes and drops every pooled session. Used at shutdown and by tests
	/// asserting no leaked sessions remain after a cancelled run.
	pub async fn close(&self) {
		let mut entries = self.entries.lock().await;
		for (key, entry) in entries.drain() {
			if let Ok(pooled) = Arc::try_unwrap(entry) {
				if let Some(session) = pooled.session.into_inner() {
					if let Ok(session) = Arc::try_unwrap(session) {
						debug!(%key, "closing ssh session");
						let _ = session.close().await;
					}
				}
			}
		}
	}

	pub async fn len(&self) -> usize {
		self.entries.lock().await.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pool_key_display() {
		let key = PoolKey {
			host: "web1".into(),
			port: 22,
			user: "root".into(),
		};
		assert_eq!(key.to_string(), "root@web1:22");
	}

	#[tokio::test]
	async fn empty_pool_has_no_sessions() {
		let pool = Pool::new(PoolConfig::default());
		assert_eq!(pool.len().await, 0);
		pool.close().await;
		assert_eq!(pool.len().await, 0);
	}
}
