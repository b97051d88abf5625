//! Per-host summary table, printed after every `plan`/`apply`/`rollback`
//! run, grounded on the teacher's `tabled`/`owo-colors` summary tables in
//! `cmds/fleet/src/cmds/secrets/mod.rs`.

use nixfleet_core::pipeline::PipelineResults;
use owo_colors::OwoColorize;
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct Row {
	#[tabled(rename = "HOST")]
	host: String,
	#[tabled(rename = "RESULT")]
	result: String,
	#[tabled(rename = "ACTION")]
	action: String,
	#[tabled(rename = "ROLLED BACK")]
	rolled_back: String,
	#[tabled(rename = "ERROR")]
	error: String,
}

pub fn print(results: &PipelineResults) {
	let rows: Vec<Row> = results
		.per_host
		.iter()
		.map(|r| Row {
			host: r.host.clone(),
			result: if r.success {
				"ok".green().to_string()
			} else {
				"failed".red().to_string()
			},
			action: r
				.deploy_result
				.as_ref()
				.map(|d| d.action.clone())
				.unwrap_or_default(),
			rolled_back: if r.rollback_performed { "yes".yellow().to_string() } else { "".to_owned() },
			error: r.error_message.clone().unwrap_or_default(),
		})
		.collect();

	println!("{}", Table::new(rows));
	println!(
		"{}/{} hosts succeeded",
		results.successful.to_string().green(),
		results.total_hosts
	);

	for r in &results.per_host {
		let Some(diff) = &r.plan_diff else { continue };
		if diff.file_changes.is_empty() && diff.units_to_restart.is_empty() {
			continue;
		}
		println!("\n{}:", r.host.bold());
		for change in &diff.file_changes {
			match change {
				nixfleet_core::state::FileChange::Added { path } => println!("  {} {path}", "+".green()),
				nixfleet_core::state::FileChange::Changed { path } => println!("  {} {path}", "~".yellow()),
				nixfleet_core::state::FileChange::Removed { path } => println!("  {} {path}", "-".red()),
			}
		}
		if !diff.units_to_restart.is_empty() {
			println!("  restarts: {}", diff.units_to_restart.join(", "));
		}
	}
}
