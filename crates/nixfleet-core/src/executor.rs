//! Remote command execution with cancellation, generalized from the
//! teacher's `MyCommand`/`run_nix_inner*` plumbing
//! (`crates/fleet-base/src/command.rs`) to take an explicit
//! `CancellationToken` instead of relying on span-scoped ambient state, and
//! to report exit codes to the caller instead of treating non-zero as an
//! error (spec.md §4.2: "exit code != 0 is not an error of exec").

use std::ffi::OsStr;
use std::process::Stdio;
use std::sync::Arc;

use better_command::Handler;
use futures::StreamExt;
use openssh::Session;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio::select;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::NixFleetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
	None,
	Sudo,
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
	pub stdout: Vec<u8>,
	pub stderr: Vec<u8>,
	pub exit_code: i32,
}

impl CommandOutput {
	pub fn success(&self) -> bool {
		self.exit_code == 0
	}

	pub fn stdout_string(&self) -> String {
		String::from_utf8_lossy(&self.stdout).into_owned()
	}
}

/// A single remote (or, for the control machine's own local work, local)
/// command. Cheap to build; consumed by one of the `run_*` methods.
pub struct RemoteCommand {
	program: String,
	args: Vec<String>,
	session: Option<Arc<Session>>,
	escalation: Escalation,
}

impl RemoteCommand {
	/// A command that will run on the target host through `session`.
	pub fn on_session(session: Arc<Session>, program: impl AsRef<OsStr>) -> Self {
		Self {
			program: program.as_ref().to_string_lossy().into_owned(),
			args: Vec::new(),
			session: Some(session),
			escalation: Escalation::None,
		}
	}

	/// A command that runs locally on the control machine (e.g. the
	/// evaluator's `build`/`copy` primitives).
	pub fn local(program: impl AsRef<OsStr>) -> Self {
		Self {
			program: program.as_ref().to_string_lossy().into_owned(),
			args: Vec::new(),
			session: None,
			escalation: Escalation::None,
		}
	}

	pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
		self.args.push(arg.as_ref().to_string_lossy().into_owned());
		self
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<OsStr>,
	{
		for a in args {
			self.args.push(a.as_ref().to_string_lossy().into_owned());
		}
		self
	}

	pub fn sudo(mut self) -> Self {
		self.escalation = Escalation::Sudo;
		self
	}

	fn command_line(&self) -> String {
		let mut out = self.program.clone();
		for arg in &self.args {
			out.push(' ');
			out.push_str(arg);
		}
		out
	}

	fn program_and_args(&self) -> (String, Vec<String>) {
		if self.escalation == Escalation::Sudo {
			let mut args = vec![self.program.clone()];
			args.extend(self.args.clone());
			("sudo".to_owned(), args)
		} else {
			(self.program.clone(), self.args.clone())
		}
	}

	/// Runs the command to completion, capturing stdout/stderr and the exit
	/// code. Non-zero exit is reported in `CommandOutput`, not as an `Err`.
	/// If `ctx` is cancelled, the child is killed, any buffered output is
	/// discarded, and `NixFleetError::Cancelled` is returned.
	pub async fn run(self, ctx: &CancellationToken) -> Result<CommandOutput, NixFleetError> {
		self.run_with_handler(ctx, &mut better_command::NoopHandler).await
	}

	/// As `run`, but streams each stderr line through `handler` as it
	/// arrives (e.g. into `tracing`), matching the teacher's live-logging
	/// behavior for long-running activation commands.
	pub async fn run_with_handler(
		self,
		ctx: &CancellationToken,
		handler: &mut dyn Handler,
	) -> Result<CommandOutput, NixFleetError> {
		let line = self.command_line();
		let (program, args) = self.program_and_args();
		match self.session {
			Some(session) => run_remote(line, session, program, args, ctx, None, handler).await,
			None => run_local(line, program, args, ctx, None, handler).await,
		}
	}

	/// As `run`, but writes `stdin` to the child's standard input before
	/// draining its output, used by the State Store to push a file's
	/// contents through `tee` without a local-to-remote file copy.
	pub async fn run_with_stdin(
		self,
		ctx: &CancellationToken,
		stdin: Vec<u8>,
	) -> Result<CommandOutput, NixFleetError> {
		let line = self.command_line();
		let (program, args) = self.program_and_args();
		match self.session {
			Some(session) => {
				run_remote(line, session, program, args, ctx, Some(stdin), &mut better_command::NoopHandler).await
			}
			None => run_local(line, program, args, ctx, Some(stdin), &mut better_command::NoopHandler).await,
		}
	}
}

async fn run_local(
	line: String,
	program: String,
	args: Vec<String>,
	ctx: &CancellationToken,
	stdin: Option<Vec<u8>>,
	handler: &mut dyn Handler,
) -> Result<CommandOutput, NixFleetError> {
	debug!(command = %line, "running local command");
	let mut cmd = Command::new(program);
	cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
	cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
	let mut child = cmd.spawn().map_err(|e| NixFleetError::Transport {
		host: "localhost".into(),
		source: anyhow::anyhow!(e),
	})?;
	if let Some(bytes) = stdin {
		if let Some(mut pipe) = child.stdin.take() {
			let _ = pipe.write_all(&bytes).await;
		}
	}
	let stdout = child.stdout.take().unwrap();
	let stderr = child.stderr.take().unwrap();
	let result = drain_and_wait(ctx, handler, stdout, stderr, child.wait()).await;
	if result.is_err() {
		// Cancellation or a wait error: kill the process on the way out so
		// we never leave an orphaned subprocess behind.
		let _ = child.kill().await;
	}
	result
}

async fn run_remote(
	line: String,
	session: Arc<Session>,
	program: String,
	args: Vec<String>,
	ctx: &CancellationToken,
	stdin: Option<Vec<u8>>,
	handler: &mut dyn Handler,
) -> Result<CommandOutput, NixFleetError> {
	debug!(command = %line, "running remote command");
	let mut cmd = session.command(program);
	cmd.args(args);
	cmd.stdin(if stdin.is_some() {
		openssh::Stdio::piped()
	} else {
		openssh::Stdio::null()
	});
	cmd.stdout(openssh::Stdio::piped());
	cmd.stderr(openssh::Stdio::piped());
	let mut child = cmd.spawn().await.map_err(|e| NixFleetError::Transport {
		host: "remote".into(),
		source: anyhow::anyhow!(e),
	})?;
	if let Some(bytes) = stdin {
		if let Some(mut pipe) = child.stdin().take() {
			let _ = pipe.write_all(&bytes).await;
		}
	}
	let stdout = child.stdout().take().unwrap();
	let stderr = child.stderr().take().unwrap();
	let result = drain_and_wait(ctx, handler, stdout, stderr, child.wait()).await;
	if result.is_err() {
		// openssh has no portable remote SIGKILL; disconnecting the channel
		// is the closest equivalent to "send KILL on the remote session",
		// severing the remote process's controlling terminal.
		let _ = child.disconnect().await;
	}
	result
}

async fn drain_and_wait<O, E, F>(
	ctx: &CancellationToken,
	handler: &mut dyn Handler,
	stdout: O,
	stderr: E,
	wait: F,
) -> Result<CommandOutput, NixFleetError>
where
	O: AsyncRead + Unpin,
	E: AsyncRead + Unpin,
	F: std::future::Future,
	F::Output: ExitStatusLike,
{
	let mut out = FramedRead::new(stdout, tokio_util::codec::BytesCodec::new());
	let mut err = FramedRead::new(stderr, LinesCodec::new());
	let mut stdout_buf = Vec::new();
	let mut stderr_buf = Vec::new();

	tokio::pin!(wait);
	loop {
		select! {
			biased;
			_ = ctx.cancelled() => {
				return Err(NixFleetError::Cancelled);
			}
			chunk = out.next() => {
				match chunk {
					Some(Ok(bytes)) => stdout_buf.extend_from_slice(&bytes),
					Some(Err(_)) | None => {}
				}
			}
			line = err.next() => {
				match line {
					Some(Ok(line)) => {
						handler.handle_line(&line);
						stderr_buf.extend_from_slice(line.as_bytes());
						stderr_buf.push(b'\n');
					}
					Some(Err(_)) | None => {}
				}
			}
			status = &mut wait => {
				let exit_code = status.exit_code().map_err(|e| NixFleetError::Transport {
					host: "remote".into(),
					source: e,
				})?;
				return Ok(CommandOutput {
					stdout: stdout_buf,
					stderr: stderr_buf,
					exit_code,
				});
			}
		}
	}
}

/// Bridges `tokio::process::Child::wait`'s and `openssh`'s remote-child
/// wait result types onto one exit-code accessor.
trait ExitStatusLike {
	fn exit_code(self) -> anyhow::Result<i32>;
}

impl ExitStatusLike for std::io::Result<std::process::ExitStatus> {
	fn exit_code(self) -> anyhow::Result<i32> {
		Ok(self?.code().unwrap_or(-1))
	}
}

impl ExitStatusLike for std::result::Result<std::process::ExitStatus, openssh::Error> {
	fn exit_code(self) -> anyhow::Result<i32> {
		Ok(self?.code().unwrap_or(-1))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn local_echo_succeeds() {
		let ctx = CancellationToken::new();
		let out = RemoteCommand::local("echo")
			.arg("hello")
			.run(&ctx)
			.await
			.unwrap();
		assert!(out.success());
		assert_eq!(out.stdout_string().trim(), "hello");
	}

	#[tokio::test]
	async fn non_zero_exit_is_not_an_error() {
		let ctx = CancellationToken::new();
		let out = RemoteCommand::local("sh")
			.arg("-c")
			.arg("exit 7")
			.run(&ctx)
			.await
			.unwrap();
		assert_eq!(out.exit_code, 7);
	}

	#[tokio::test]
	async fn cancellation_returns_cancelled() {
		let ctx = CancellationToken::new();
		ctx.cancel();
		let result = RemoteCommand::local("sleep").arg("5").run(&ctx).await;
		assert!(matches!(result, Err(NixFleetError::Cancelled)));
	}
}
