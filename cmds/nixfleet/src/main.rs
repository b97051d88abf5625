mod complete;
mod config;
mod inventory;
mod rollback;
mod summary;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use nixfleet_core::activator::SwitchAction;
use nixfleet_core::evaluator::NixEvaluator;
use nixfleet_core::pipeline::{self, ApplyOptions, BusyGuard, HealthCheckPolicy};
use nixfleet_core::pool::{Pool, PoolConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, metadata::LevelFilter};
use tracing_subscriber::{prelude::*, EnvFilter};

use config::FleetConfig;

#[derive(Parser)]
#[clap(version, author, about = "Evaluate, deploy, and roll back a fleet of Nix-managed hosts")]
struct RootOpts {
	/// Path to the fleet configuration TOML file.
	#[clap(long, env = "NIXFLEET_CONFIG", default_value = "fleet.toml")]
	config: PathBuf,

	/// Restrict the run to these hosts (default: all hosts in the inventory).
	#[clap(long = "host", global = true)]
	hosts: Vec<String>,

	/// Number of hosts to process concurrently.
	#[clap(long, global = true)]
	parallel: Option<usize>,

	#[clap(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Build closures and show what would change, without touching any target.
	Plan {
		/// Flake attribute (or attribute suffix) to evaluate for each host.
		attr: String,
	},
	/// Build, transport, activate, and health-check the fleet.
	Apply {
		attr: String,
		#[clap(long)]
		dry_run: bool,
		#[clap(long)]
		skip_preflight: bool,
		#[clap(long)]
		skip_health_checks: bool,
		#[clap(long, value_enum, default_value = "halt")]
		health_policy: HealthPolicyArg,
		#[clap(long, value_enum, default_value = "switch")]
		action: SwitchActionArg,
	},
	/// Roll each selected host back to its previous known-good generation.
	Rollback,
	/// Generate shell completions.
	Complete(complete::Complete),
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum HealthPolicyArg {
	Rollback,
	Halt,
	Continue,
}

impl From<HealthPolicyArg> for HealthCheckPolicy {
	fn from(v: HealthPolicyArg) -> Self {
		match v {
			HealthPolicyArg::Rollback => HealthCheckPolicy::Rollback,
			HealthPolicyArg::Halt => HealthCheckPolicy::Halt,
			HealthPolicyArg::Continue => HealthCheckPolicy::Continue,
		}
	}
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum SwitchActionArg {
	Upload,
	Test,
	Boot,
	Switch,
}

impl From<SwitchActionArg> for SwitchAction {
	fn from(v: SwitchActionArg) -> Self {
		match v {
			SwitchActionArg::Upload => SwitchAction::Upload,
			SwitchActionArg::Test => SwitchAction::Test,
			SwitchActionArg::Boot => SwitchAction::Boot,
			SwitchActionArg::Switch => SwitchAction::Switch,
		}
	}
}

#[tokio::main]
async fn main() -> ExitCode {
	let filter = EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into());
	tracing_subscriber::registry()
		.with(tracing_subscriber::fmt::layer().with_target(false).with_filter(filter))
		.init();

	match run().await {
		Ok(code) => code,
		Err(e) => {
			error!(error = %e, "nixfleet failed");
			ExitCode::from(2)
		}
	}
}

async fn run() -> anyhow::Result<ExitCode> {
	let opts = RootOpts::parse();

	if let Command::Complete(c) = &opts.command {
		c.run(RootOpts::command());
		return Ok(ExitCode::SUCCESS);
	}

	let config = FleetConfig::load(&opts.config).await?;
	let hosts = inventory::load(&config.inventory).await?;
	let selected: Vec<_> = inventory::select(&hosts, &opts.hosts).into_iter().cloned().collect();
	if selected.is_empty() {
		anyhow::bail!("no hosts selected");
	}

	let pool = Pool::new(PoolConfig::default());
	let busy = BusyGuard::new();
	let evaluator: Arc<dyn nixfleet_core::evaluator::Evaluator> = Arc::new(NixEvaluator {
		flake_attr_prefix: config.flake_attr_prefix.clone().unwrap_or_else(|| "fleet".to_owned()),
	});
	let ctx = CancellationToken::new();
	let parallelism = opts.parallel.unwrap_or(config.default_parallelism);

	let apply_opts = |attr: String, dry_run: bool, skip_preflight: bool, skip_health_checks: bool, policy: HealthCheckPolicy, action: SwitchAction| {
		Arc::new(ApplyOptions {
			attr,
			action,
			dry_run,
			skip_preflight,
			skip_health_checks,
			health_check_delay: config.health_check_delay(),
			health_check_policy: policy,
			parallelism,
			preflight_probes: config.preflight_probes.clone(),
			health_probes: config.health_probes.clone(),
			managed_files: Default::default(),
			restart_graph: Default::default(),
			pre_activate: None,
			post_activate: None,
		})
	};

	if let Command::Rollback = opts.command {
		let outcomes = rollback::run(&selected, pool, ctx).await;
		let failed = outcomes.iter().filter(|o| !o.success).count();
		for o in &outcomes {
			match o.success {
				true => println!("{}: {}", o.host, o.message),
				false => println!("{}: FAILED: {}", o.host, o.message),
			}
		}
		return Ok(if failed == 0 { ExitCode::SUCCESS } else { ExitCode::from(1) });
	}

	let results = match opts.command {
		Command::Plan { attr } => {
			let o = apply_opts(attr, true, false, true, HealthCheckPolicy::Halt, SwitchAction::Switch);
			pipeline::apply(&selected, evaluator, pool, busy, o, ctx).await
		}
		Command::Apply {
			attr,
			dry_run,
			skip_preflight,
			skip_health_checks,
			health_policy,
			action,
		} => {
			let o = apply_opts(
				attr,
				dry_run,
				skip_preflight,
				skip_health_checks,
				health_policy.into(),
				action.into(),
			);
			pipeline::apply(&selected, evaluator, pool, busy, o, ctx).await
		}
		Command::Rollback | Command::Complete(_) => unreachable!("handled above"),
	};

	summary::print(&results);

	if results.failed == 0 {
		Ok(ExitCode::SUCCESS)
	} else {
		Ok(ExitCode::from(1))
	}
}
