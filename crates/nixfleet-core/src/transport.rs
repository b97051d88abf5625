//! Closure Transport: streams a build artifact to a target and asserts its
//! on-disk presence (spec.md §4.4).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::closure::Closure;
use crate::error::NixFleetError;
use crate::evaluator::Evaluator;
use crate::executor::RemoteCommand;
use crate::inventory::Host;

pub async fn copy_to_host(
	evaluator: &dyn Evaluator,
	closure: &Closure,
	host: &Host,
	session: Arc<openssh::Session>,
	ctx: &CancellationToken,
) -> Result<(), NixFleetError> {
	info!(host = %host.name, store_path = %closure.store_path, "copying closure");
	evaluator
		.copy(&closure.store_path, host)
		.await
		.map_err(|source| NixFleetError::Copy {
			host: host.name.clone(),
			source,
		})?;

	let present = RemoteCommand::on_session(session, "test")
		.arg("-e")
		.arg(&closure.store_path)
		.run(ctx)
		.await?;
	if !present.success() {
		return Err(NixFleetError::Copy {
			host: host.name.clone(),
			source: anyhow::anyhow!(
				"store path {} not present on target after copy",
				closure.store_path
			),
		});
	}
	Ok(())
}
