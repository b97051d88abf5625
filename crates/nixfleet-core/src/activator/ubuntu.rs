//! Ubuntu switch primitive: symlink swap of the `nixfleet` profile via
//! `nix-env --set` (atomic `rename(2)`), then the closure's own `activate`
//! script, which materializes managed `/etc` files, users, groups, and
//! directories. Grounded directly on the teacher's `execute_upload`
//! (`cmds/fleet/src/cmds/build_systems.rs`), which performs the identical
//! sequence against `/nix/var/nix/profiles/system`. Has `systemd`, so it
//! opts into the rollback-marker/watchdog mechanism (`activator::mod`)
//! around the switch.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{PlatformSwitch, SwitchAction};
use crate::closure::Closure;
use crate::error::NixFleetError;
use crate::executor::RemoteCommand;

const PROFILE: &str = "/nix/var/nix/profiles/nixfleet";

pub struct UbuntuSwitch;

#[async_trait]
impl PlatformSwitch for UbuntuSwitch {
	async fn switch(
		&self,
		session: Arc<openssh::Session>,
		closure: &Closure,
		action: SwitchAction,
		ctx: &CancellationToken,
	) -> Result<(), NixFleetError> {
		if matches!(action, SwitchAction::Switch | SwitchAction::Boot) {
			let out = RemoteCommand::on_session(session.clone(), "nix-env")
				.arg("--profile")
				.arg(PROFILE)
				.arg("--set")
				.arg(&closure.store_path)
				.sudo()
				.run(ctx)
				.await?;
			if !out.success() {
				return Err(activation_error(&out.stderr));
			}
		}
		if matches!(action, SwitchAction::Switch | SwitchAction::Test) {
			let activate_script = format!("{}/activate", closure.store_path);
			let out = RemoteCommand::on_session(session, activate_script)
				.sudo()
				.run(ctx)
				.await?;
			if !out.success() {
				return Err(activation_error(&out.stderr));
			}
		}
		Ok(())
	}

	async fn switch_back(
		&self,
		session: Arc<openssh::Session>,
		prior_store_path: &str,
		ctx: &CancellationToken,
	) -> Result<(), NixFleetError> {
		let out = RemoteCommand::on_session(session.clone(), "nix-env")
			.arg("--profile")
			.arg(PROFILE)
			.arg("--set")
			.arg(prior_store_path)
			.sudo()
			.run(ctx)
			.await?;
		if !out.success() {
			return Err(activation_error(&out.stderr));
		}
		let activate_script = format!("{prior_store_path}/activate");
		let out = RemoteCommand::on_session(session, activate_script)
			.sudo()
			.run(ctx)
			.await?;
		if !out.success() {
			return Err(activation_error(&out.stderr));
		}
		Ok(())
	}

	fn supports_watchdog(&self) -> bool {
		true
	}
}

fn activation_error(stderr: &[u8]) -> NixFleetError {
	NixFleetError::Activation {
		host: "".to_owned(),
		reason: String::from_utf8_lossy(stderr).into_owned(),
	}
}
