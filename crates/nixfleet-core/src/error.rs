use thiserror::Error;

/// The error taxonomy the core raises, matched by the Apply Pipeline to
/// decide rollback/halt/continue routing and by the CLI to pick an exit
/// code (0 success, 1 some host failed, 2 input/configuration error).
#[derive(Debug, Error)]
pub enum NixFleetError {
	#[error("input error: {0}")]
	Input(String),

	#[error("no usable SSH credential for {host}")]
	Auth { host: String },

	#[error("transport error talking to {host}: {source}")]
	Transport {
		host: String,
		#[source]
		source: anyhow::Error,
	},

	#[error("preflight checks failed: {0}")]
	Preflight(String),

	#[error("build failed for host {host}: {source}")]
	Build {
		host: String,
		#[source]
		source: anyhow::Error,
	},

	#[error("copy to {host} failed: {source}")]
	Copy {
		host: String,
		#[source]
		source: anyhow::Error,
	},

	#[error("activation failed on {host}: {reason}")]
	Activation { host: String, reason: String },

	#[error("health checks failed on {host}")]
	Health { host: String },

	#[error("rollback failed on {host}: {reason}")]
	Rollback { host: String, reason: String },

	#[error("apply already running on {host}")]
	Busy { host: String },

	#[error("cancelled")]
	Cancelled,
}

pub type Result<T> = std::result::Result<T, NixFleetError>;
