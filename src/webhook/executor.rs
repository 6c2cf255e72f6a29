use std::{
	path::{Path, PathBuf},
	process::Stdio,
	time::{Duration, SystemTime},
};

use async_trait::async_trait;
use base64::Engine;
use color_eyre::{Result, eyre::eyre};
use serde::Serialize;
use tokio::{
	io::{AsyncBufReadExt, AsyncRead, BufReader},
	process::{Child, Command},
};

use crate::report::RunReport;

const TERM_GRACE: Duration = Duration::from_secs(5);

/// The exported spreadsheet, ready to ship in a JSON body
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ExcelFile {
	pub name: String,
	pub size: u64,
	/// Base64 of the file bytes
	pub data: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionOutput {
	pub stdout: String,
	pub stderr: String,
	pub excel: Option<ExcelFile>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionFailure {
	#[error("Failed to start automation: {0}")]
	Spawn(String),
	#[error("Automation exited with status {code:?}")]
	Exited { code: Option<i32>, stdout: String, stderr: String },
	#[error("Execution timed out after {after:?}")]
	TimedOut { after: Duration, stdout: String, stderr: String },
}

impl ExecutionFailure {
	pub fn stdout(&self) -> &str {
		match self {
			ExecutionFailure::Spawn(_) => "",
			ExecutionFailure::Exited { stdout, .. } | ExecutionFailure::TimedOut { stdout, .. } => stdout,
		}
	}

	pub fn stderr(&self) -> &str {
		match self {
			ExecutionFailure::Spawn(_) => "",
			ExecutionFailure::Exited { stderr, .. } | ExecutionFailure::TimedOut { stderr, .. } => stderr,
		}
	}
}

/// Runs one automation pass on behalf of a webhook request
#[async_trait]
pub trait AutomationExecutor: Send + Sync {
	async fn execute(&self) -> Result<ExecutionOutput, ExecutionFailure>;
}

/// Runs the pass in a child process, so a wedged browser can't take the server down with it
#[derive(Clone, Debug)]
pub struct ProcessExecutor {
	program: PathBuf,
	args: Vec<String>,
	timeout: Duration,
	downloads_dir: PathBuf,
}

impl ProcessExecutor {
	pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration, downloads_dir: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args,
			timeout,
			downloads_dir: downloads_dir.into(),
		}
	}

	/// This same binary with the `run` subcommand. Env is inherited; `flags` (e.g. `--config`) go before `run`
	pub fn current_exe(timeout: Duration, downloads_dir: impl Into<PathBuf>, flags: Vec<String>) -> Result<Self> {
		let program = std::env::current_exe().map_err(|e| eyre!("Failed to locate own executable: {}", e))?;
		let mut args = flags;
		args.push("run".to_string());
		Ok(Self::new(program, args, timeout, downloads_dir))
	}
}

#[async_trait]
impl AutomationExecutor for ProcessExecutor {
	async fn execute(&self) -> Result<ExecutionOutput, ExecutionFailure> {
		tracing::info!(program = %self.program.display(), args = ?self.args, "starting automation");
		let started = SystemTime::now();
		let mut child = Command::new(&self.program)
			.args(&self.args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()
			.map_err(|e| ExecutionFailure::Spawn(e.to_string()))?;

		let stdout = tokio::spawn(collect_lines(child.stdout.take(), "stdout"));
		let stderr = tokio::spawn(collect_lines(child.stderr.take(), "stderr"));

		let status = match tokio::time::timeout(self.timeout, child.wait()).await {
			Ok(Ok(status)) => Some(status),
			Ok(Err(e)) => return Err(ExecutionFailure::Spawn(format!("failed waiting on child: {e}"))),
			Err(_) => {
				tracing::error!(after = ?self.timeout, "automation timed out, terminating");
				terminate(&mut child).await;
				None
			}
		};
		// Grandchildren (the browser) may still hold the pipes open
		let stdout = tokio::time::timeout(TERM_GRACE, stdout).await.ok().and_then(|joined| joined.ok()).unwrap_or_default();
		let stderr = tokio::time::timeout(TERM_GRACE, stderr).await.ok().and_then(|joined| joined.ok()).unwrap_or_default();

		match status {
			None => Err(ExecutionFailure::TimedOut {
				after: self.timeout,
				stdout,
				stderr,
			}),
			Some(status) if status.success() => {
				let excel = reported_excel(&stdout).or_else(|| find_new_excel(&self.downloads_dir, started));
				match &excel {
					Some(file) => tracing::info!(name = %file.name, size = file.size, "picked up exported file"),
					None => tracing::warn!(dir = %self.downloads_dir.display(), "no new Excel file after run"),
				}
				Ok(ExecutionOutput { stdout, stderr, excel })
			}
			Some(status) => Err(ExecutionFailure::Exited {
				code: status.code(),
				stdout,
				stderr,
			}),
		}
	}
}

async fn collect_lines<R: AsyncRead + Unpin>(pipe: Option<R>, stream: &'static str) -> String {
	let Some(pipe) = pipe else {
		return String::new();
	};
	let mut lines = BufReader::new(pipe).lines();
	let mut collected = String::new();
	while let Ok(Some(line)) = lines.next_line().await {
		tracing::debug!(stream, "{line}");
		collected.push_str(&line);
		collected.push('\n');
	}
	collected
}

/// SIGTERM, a grace period, then SIGKILL
async fn terminate(child: &mut Child) {
	if let Some(pid) = child.id() {
		// SAFETY: `pid` is our own child which has not been reaped yet, so it cannot refer to an unrelated process
		let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
		if rc != 0 {
			tracing::warn!(pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
		}
	}
	if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
		tracing::warn!("child ignored SIGTERM, killing");
		if let Err(e) = child.kill().await {
			tracing::error!("failed to kill child: {e}");
		}
	}
}

/// The file the run itself reports having exported. The child may have been pointed at a different downloads dir
pub fn reported_excel(stdout: &str) -> Option<ExcelFile> {
	let report = RunReport::extract_from_output(stdout)?;
	let path = PathBuf::from(report.get("exported")?.as_str()?);
	let file = read_excel(&path);
	if file.is_none() {
		tracing::warn!(path = %path.display(), "reported export is not readable");
	}
	file
}

/// Newest `.xlsx`/`.xls` in `dir` modified at or after `since`
pub fn find_new_excel(dir: &Path, since: SystemTime) -> Option<ExcelFile> {
	let newest = std::fs::read_dir(dir)
		.ok()?
		.filter_map(|entry| entry.ok())
		.filter(|entry| {
			entry
				.path()
				.extension()
				.and_then(|ext| ext.to_str())
				.is_some_and(|ext| ext.eq_ignore_ascii_case("xlsx") || ext.eq_ignore_ascii_case("xls"))
		})
		.filter_map(|entry| {
			let modified = entry.metadata().ok()?.modified().ok()?;
			(modified >= since).then_some((modified, entry.path()))
		})
		.max_by_key(|(modified, _)| *modified)?;

	read_excel(&newest.1)
}

fn read_excel(path: &Path) -> Option<ExcelFile> {
	let bytes = std::fs::read(path).ok()?;
	Some(ExcelFile {
		name: path.file_name()?.to_string_lossy().into_owned(),
		size: bytes.len() as u64,
		data: base64::engine::general_purpose::STANDARD.encode(&bytes),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn picks_only_spreadsheets_written_after_start() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("notes.txt"), b"not a sheet").unwrap();
		assert_eq!(find_new_excel(dir.path(), SystemTime::UNIX_EPOCH), None);

		std::fs::write(dir.path().join("report.xlsx"), b"PK\x03\x04").unwrap();
		let found = find_new_excel(dir.path(), SystemTime::UNIX_EPOCH).unwrap();
		assert_eq!(found.name, "report.xlsx");
		assert_eq!(found.size, 4);
		assert_eq!(found.data, "UEsDBA==");

		let future = SystemTime::now() + Duration::from_secs(3600);
		assert_eq!(find_new_excel(dir.path(), future), None);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn captures_output_of_successful_child() {
		let dir = tempfile::tempdir().unwrap();
		let executor = ProcessExecutor::new("sh", vec!["-c".into(), "echo hello; echo oops >&2".into()], Duration::from_secs(10), dir.path());
		let output = executor.execute().await.unwrap();
		assert_eq!(output.stdout, "hello\n");
		assert_eq!(output.stderr, "oops\n");
		assert!(output.excel.is_none());
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn reported_export_wins_over_scanned_dir() {
		let scanned = tempfile::tempdir().unwrap();
		let elsewhere = tempfile::tempdir().unwrap();
		let sheet = elsewhere.path().join("report.xlsx");
		let script = format!(r#"printf 'PK' > '{0}'; echo 'run report: {{"exported":"{0}"}}'"#, sheet.display());
		let executor = ProcessExecutor::new("sh", vec!["-c".into(), script], Duration::from_secs(10), scanned.path());

		let output = executor.execute().await.unwrap();
		let excel = output.excel.expect("exported file relayed");
		assert_eq!(excel.name, "report.xlsx");
		assert_eq!(excel.size, 2);
	}

	#[test]
	fn unreadable_reported_export_yields_nothing() {
		assert_eq!(reported_excel(r#"run report: {"exported":"/nonexistent/hilan.xlsx"}"#), None);
		assert_eq!(reported_excel(r#"run report: {"exported":null}"#), None);
		assert_eq!(reported_excel("no report"), None);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn nonzero_exit_is_a_failure_with_output() {
		let dir = tempfile::tempdir().unwrap();
		let executor = ProcessExecutor::new("sh", vec!["-c".into(), "echo partial; exit 3".into()], Duration::from_secs(10), dir.path());
		let failure = executor.execute().await.unwrap_err();
		assert!(matches!(failure, ExecutionFailure::Exited { code: Some(3), .. }));
		assert_eq!(failure.stdout(), "partial\n");
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn slow_child_is_terminated() {
		let dir = tempfile::tempdir().unwrap();
		let executor = ProcessExecutor::new("sh", vec!["-c".into(), "exec sleep 30".into()], Duration::from_millis(200), dir.path());
		let started = std::time::Instant::now();
		let failure = executor.execute().await.unwrap_err();
		assert!(matches!(failure, ExecutionFailure::TimedOut { .. }));
		assert!(started.elapsed() < Duration::from_secs(15));
	}
}
