//! NixOS switch primitive: `<storePath>/bin/switch-to-configuration
//! switch|boot|test`. NixOS's own activation machinery provides atomic
//! generation rotation; the command shape is identical to the teacher's
//! invocation in `execute_upload`. Has `systemd`, so it opts into the
//! rollback-marker/watchdog mechanism (`activator::mod`) around the switch.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{PlatformSwitch, SwitchAction};
use crate::closure::Closure;
use crate::error::NixFleetError;
use crate::executor::RemoteCommand;

pub struct NixosSwitch;

impl NixosSwitch {
	fn action_name(action: SwitchAction) -> Option<&'static str> {
		match action {
			SwitchAction::Upload => None,
			SwitchAction::Test => Some("test"),
			SwitchAction::Boot => Some("boot"),
			SwitchAction::Switch => Some("switch"),
		}
	}
}

#[async_trait]
impl PlatformSwitch for NixosSwitch {
	async fn switch(
		&self,
		session: Arc<openssh::Session>,
		closure: &Closure,
		action: SwitchAction,
		ctx: &CancellationToken,
	) -> Result<(), NixFleetError> {
		let Some(name) = Self::action_name(action) else {
			return Ok(());
		};
		let switch_to_configuration = format!("{}/bin/switch-to-configuration", closure.store_path);
		let out = RemoteCommand::on_session(session, switch_to_configuration)
			.arg(name)
			.sudo()
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
		let switch_to_configuration = format!("{prior_store_path}/bin/switch-to-configuration");
		let out = RemoteCommand::on_session(session, switch_to_configuration)
			.arg("switch")
			.sudo()
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

	fn supports_watchdog(&self) -> bool {
		true
	}
}
