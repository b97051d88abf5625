//! Health Checker: post-activation probes with per-check timeouts
//! (spec.md §4.6).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::executor::RemoteCommand;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HealthKind {
	Command { command: String },
	HttpGet { url: String, expect_status: Option<u16> },
	SystemdActive { unit: String },
	PortOpen { port: u16 },
	TcpDial { host: String, port: u16 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbe {
	pub name: String,
	pub kind: HealthKind,
	pub timeout: Duration,
	pub soft_fail: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HealthOutcome {
	Pass,
	Fail { reason: String },
}

impl HealthOutcome {
	pub fn is_pass(&self) -> bool {
		matches!(self, HealthOutcome::Pass)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
	pub name: String,
	pub outcome: HealthOutcome,
	pub soft_fail: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
	pub passed: bool,
	pub results: Vec<HealthResult>,
}

pub async fn run_health_checks(
	session: Arc<openssh::Session>,
	stabilisation_delay: Duration,
	probes: &[HealthProbe],
	ctx: &CancellationToken,
) -> HealthReport {
	tokio::select! {
		_ = tokio::time::sleep(stabilisation_delay) => {}
		_ = ctx.cancelled() => {}
	}

	let mut results = Vec::with_capacity(probes.len());
	for probe in probes {
		let outcome = run_one(session.clone(), probe, ctx).await;
		results.push(HealthResult {
			name: probe.name.clone(),
			outcome,
			soft_fail: probe.soft_fail,
		});
	}
	// Aggregate is conjunctive unless the failing probe is softFail.
	let passed = results
		.iter()
		.all(|r| r.outcome.is_pass() || r.soft_fail);
	HealthReport { passed, results }
}

async fn run_one(
	session: Arc<openssh::Session>,
	probe: &HealthProbe,
	ctx: &CancellationToken,
) -> HealthOutcome {
	match timeout(probe.timeout, run_one_inner(session, &probe.kind, ctx)).await {
		Ok(outcome) => outcome,
		Err(_) => HealthOutcome::Fail {
			reason: "timeout".to_owned(),
		},
	}
}

async fn run_one_inner(
	session: Arc<openssh::Session>,
	kind: &HealthKind,
	ctx: &CancellationToken,
) -> HealthOutcome {
	match kind {
		HealthKind::Command { command } => {
			let out = RemoteCommand::on_session(session, "sh")
				.arg("-c")
				.arg(command)
				.run(ctx)
				.await;
			match out {
				Ok(out) if out.success() => HealthOutcome::Pass,
				Ok(out) => HealthOutcome::Fail {
					reason: format!("exit code {}", out.exit_code),
				},
				Err(e) => HealthOutcome::Fail {
					reason: e.to_string(),
				},
			}
		}
		HealthKind::SystemdActive { unit } => {
			let out = RemoteCommand::on_session(session, "systemctl")
				.arg("is-active")
				.arg("--quiet")
				.arg(unit)
				.run(ctx)
				.await;
			match out {
				Ok(out) if out.success() => HealthOutcome::Pass,
				Ok(_) => HealthOutcome::Fail {
					reason: format!("{unit} is not active"),
				},
				Err(e) => HealthOutcome::Fail {
					reason: e.to_string(),
				},
			}
		}
		HealthKind::PortOpen { port } | HealthKind::TcpDial { port, .. } => {
			let host = match kind {
				HealthKind::TcpDial { host, .. } => host.clone(),
				_ => "127.0.0.1".to_owned(),
			};
			match tokio::net::TcpStream::connect((host.as_str(), *port)).await {
				Ok(_) => HealthOutcome::Pass,
				Err(e) => HealthOutcome::Fail {
					reason: e.to_string(),
				},
			}
		}
		HealthKind::HttpGet { url, expect_status } => {
			match reqwest::get(url).await {
				Ok(resp) => {
					let status = resp.status().as_u16();
					match expect_status {
						Some(expected) if *expected != status => HealthOutcome::Fail {
							reason: format!("expected status {expected}, got {status}"),
						},
						_ if resp.status().is_success() || expect_status.is_some() => {
							HealthOutcome::Pass
						}
						_ => HealthOutcome::Fail {
							reason: format!("status {status}"),
						},
					}
				}
				Err(e) => HealthOutcome::Fail {
					reason: e.to_string(),
				},
			}
		}
	}
}
