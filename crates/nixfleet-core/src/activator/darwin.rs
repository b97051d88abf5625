//! Darwin switch primitive: the `darwin-rebuild` analogue, which updates
//! `launchd` daemons. New to this spec (the teacher only targets NixOS and
//! Ubuntu-via-Nix); modeled on the same "run an activation binary out of
//! the closure, check the exit code" shape as NixOS's own
//! `switch-to-configuration`, since `darwin-rebuild activate` is that
//! system's equivalent entrypoint. No `systemd-run` equivalent exists on
//! Darwin, so `supports_watchdog` stays at its default `false`: a switch
//! that leaves SSH unreachable here has no unattended recovery, only the
//! Rollback Controller's next pipeline-driven run.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{PlatformSwitch, SwitchAction};
use crate::closure::Closure;
use crate::error::NixFleetError;
use crate::executor::RemoteCommand;

pub struct DarwinSwitch;

#[async_trait]
impl PlatformSwitch for DarwinSwitch {
	async fn switch(
		&self,
		session: Arc<openssh::Session>,
		closure: &Closure,
		action: SwitchAction,
		ctx: &CancellationToken,
	) -> Result<(), NixFleetError> {
		if matches!(action, SwitchAction::Upload) {
			return Ok(());
		}
		let activate = format!("{}/activate", closure.store_path);
		let out = RemoteCommand::on_session(session, activate)
			.run(ctx)
			.await?;
		if !out.success() {
			return Err(NixFleetError::Activation {
				host: "".to_owned(),
				reason: String::from_utf8_lossy(&out.stderr).into_owned(),
			});
		}
		Ok(())
	}

	async fn switch_back(
		&self,
		session: Arc<openssh::Session>,
		prior_store_path: &str,
		ctx: &CancellationToken,
	) -> Result<(), NixFleetError> {
		let activate = format!("{prior_store_path}/activate");
		let out = RemoteCommand::on_session(session, activate)
			.run(ctx)
			.await?;
		if !out.success() {
			return Err(NixFleetError::Activation {
				host: "".to_owned(),
				reason: String::from_utf8_lossy(&out.stderr).into_owned(),
			});
		}
		Ok(())
	}
}
