//! Minimal inventory loader: the out-of-scope "external collaborator"
//! spec.md §1 carves out of the core, given just enough shape here for the
//! CLI to have hosts to hand the Pipeline. Reads a small JSON file rather
//! than evaluating a Nix flake, since flake evaluation belongs to the
//! (also out-of-scope) build-system Evaluator.

use std::path::{Path, PathBuf};

use nixfleet_core::inventory::{Base, Host, RebootWindow};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct InventoryFile {
	hosts: Vec<InventoryHost>,
}

#[derive(Debug, Deserialize)]
struct InventoryHost {
	name: String,
	address: String,
	#[serde(default = "default_port")]
	port: u16,
	#[serde(default = "default_user")]
	user: String,
	base: Base,
	#[serde(default)]
	ssh_key_refs: Vec<PathBuf>,
	#[serde(default)]
	reboot_window: String,
}

fn default_port() -> u16 {
	22
}

fn default_user() -> String {
	"root".to_owned()
}

pub async fn load(path: &Path) -> anyhow::Result<Vec<Host>> {
	let contents = tokio::fs::read_to_string(path).await?;
	let file: InventoryFile = serde_json::from_str(&contents)?;
	file.hosts
		.into_iter()
		.map(|h| {
			let reboot_window = RebootWindow::parse(&h.reboot_window)
				.map_err(|e| anyhow::anyhow!("host {}: {e}", h.name))?;
			Ok(Host {
				name: h.name,
				address: h.address,
				port: h.port,
				user: h.user,
				base: h.base,
				ssh_key_refs: h.ssh_key_refs,
				reboot_window,
			})
		})
		.collect()
}

pub fn select<'a>(hosts: &'a [Host], only: &[String]) -> Vec<&'a Host> {
	if only.is_empty() {
		return hosts.iter().collect();
	}
	hosts.iter().filter(|h| only.contains(&h.name)).collect()
}
