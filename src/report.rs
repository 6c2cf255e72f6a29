//! Step results and the per-run report.
//!
//! Every step of a run ends in a [`StepOutcome`]. Nothing short of a fatal error aborts a run, so the report is the
//! only way for a caller to tell a full pass from one that silently skipped half of the work.

use std::{fmt, path::PathBuf};

use color_eyre::Report;
use serde::{Deserialize, Serialize};

use crate::StepError;

/// Stdout line prefix the run report is printed under
pub const REPORT_PREFIX: &str = "run report: ";

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
	Login,
	OpenReport,
	PreviousMonth,
	SelectDays,
	CommitDays,
	FillRows,
	Save,
	AnalyzedSheet,
	ReportSummary,
	ExcelExport,
}

impl Step {
	pub fn name(&self) -> &'static str {
		match self {
			Step::Login => "login",
			Step::OpenReport => "open report",
			Step::PreviousMonth => "previous month",
			Step::SelectDays => "select days",
			Step::CommitDays => "commit days",
			Step::FillRows => "fill rows",
			Step::Save => "save",
			Step::AnalyzedSheet => "analyzed sheet",
			Step::ReportSummary => "report summary",
			Step::ExcelExport => "excel export",
		}
	}
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
	Succeeded(String),
	Skipped(String),
	Failed(String),
}

impl StepOutcome {
	pub fn succeeded(detail: impl Into<String>) -> Self {
		StepOutcome::Succeeded(detail.into())
	}

	pub fn skipped(reason: impl Into<String>) -> Self {
		StepOutcome::Skipped(reason.into())
	}

	pub fn failed(reason: impl Into<String>) -> Self {
		StepOutcome::Failed(reason.into())
	}

	pub fn is_succeeded(&self) -> bool {
		matches!(self, StepOutcome::Succeeded(_))
	}

	/// Collapse a step's result: absence-type [`StepError`]s become `Skipped`, any other error becomes `Failed`
	pub fn from_result(result: Result<StepOutcome, Report>) -> Self {
		match result {
			Ok(outcome) => outcome,
			Err(e) => match e.downcast_ref::<StepError>() {
				Some(step_error) if step_error.is_absence() => StepOutcome::Skipped(step_error.to_string()),
				_ => StepOutcome::Failed(format!("{e:#}")),
			},
		}
	}
}

impl fmt::Display for StepOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StepOutcome::Succeeded(detail) => write!(f, "ok ({detail})"),
			StepOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
			StepOutcome::Failed(reason) => write!(f, "FAILED: {reason}"),
		}
	}
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StepRecord {
	pub step: Step,
	pub outcome: StepOutcome,
}

/// Row-level tallies from the grid fill
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RowCounts {
	pub filled: usize,
	pub skipped: usize,
	pub failed: usize,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RunReport {
	pub steps: Vec<StepRecord>,
	pub days_deselected: usize,
	pub days_selected: usize,
	pub rows: RowCounts,
	pub exported: Option<PathBuf>,
	/// Set when the pass stopped before reaching the grid (no "Report and Update" entry point)
	pub terminated_early: bool,
}

impl RunReport {
	pub fn record(&mut self, step: Step, outcome: StepOutcome) {
		match &outcome {
			StepOutcome::Succeeded(_) => tracing::info!(step = step.name(), "{outcome}"),
			StepOutcome::Skipped(_) => tracing::warn!(step = step.name(), "{outcome}"),
			StepOutcome::Failed(_) => tracing::error!(step = step.name(), "{outcome}"),
		}
		self.steps.push(StepRecord { step, outcome });
	}

	/// Record every remaining step as skipped because an earlier one did not complete
	pub fn skip_rest(&mut self, steps: &[Step], because: Step) {
		for step in steps {
			self.record(*step, StepOutcome::skipped(format!("not reached: {} did not complete", because.name())));
		}
	}

	pub fn outcome_of(&self, step: Step) -> Option<&StepOutcome> {
		self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
	}

	/// Every step succeeded, every qualifying row was filled and a file was exported
	pub fn is_complete(&self) -> bool {
		!self.terminated_early && !self.steps.is_empty() && self.steps.iter().all(|r| r.outcome.is_succeeded()) && self.rows.failed == 0 && self.exported.is_some()
	}

	pub fn to_line(&self) -> String {
		let json = serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
		format!("{REPORT_PREFIX}{json}")
	}

	/// Find the last report line in a run's captured stdout
	pub fn extract_from_output(stdout: &str) -> Option<serde_json::Value> {
		stdout.lines().rev().find_map(|line| line.strip_prefix(REPORT_PREFIX)).and_then(|json| serde_json::from_str(json).ok())
	}
}

impl fmt::Display for RunReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let verdict = if self.is_complete() { "complete" } else { "partial" };
		writeln!(f, "Run {verdict}:")?;
		for record in &self.steps {
			writeln!(f, "  {:<15} {}", record.step.name(), record.outcome)?;
		}
		writeln!(f, "  days: {} selected, {} weekend deselected", self.days_selected, self.days_deselected)?;
		writeln!(f, "  rows: {} filled, {} skipped, {} failed", self.rows.filled, self.rows.skipped, self.rows.failed)?;
		match &self.exported {
			Some(path) => write!(f, "  export: {}", path.display()),
			None => write!(f, "  export: none"),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use color_eyre::eyre::eyre;

	use super::*;

	#[test]
	fn absence_errors_become_skipped() {
		let not_found = StepOutcome::from_result(Err(StepError::not_found("save button").into()));
		assert_eq!(not_found, StepOutcome::skipped("element not found: save button"));

		let timeout = StepOutcome::from_result(Err(StepError::Timeout {
			what: "login inputs".into(),
			after: Duration::from_secs(10),
		}
		.into()));
		assert!(matches!(timeout, StepOutcome::Skipped(_)));
	}

	#[test]
	fn other_errors_become_failed() {
		let action = StepOutcome::from_result(Err(StepError::action("click", "detached").into()));
		assert!(matches!(action, StepOutcome::Failed(ref r) if r.contains("detached")));

		let adhoc = StepOutcome::from_result(Err(eyre!("socket closed")));
		assert!(matches!(adhoc, StepOutcome::Failed(_)));
	}

	#[test]
	fn partial_run_is_not_complete() {
		let mut report = RunReport::default();
		report.record(Step::Login, StepOutcome::succeeded("submitted"));
		report.record(Step::Save, StepOutcome::succeeded("clicked"));
		report.skip_rest(&[Step::AnalyzedSheet, Step::ExcelExport], Step::Save);
		assert!(!report.is_complete());
		assert!(matches!(report.outcome_of(Step::ExcelExport), Some(StepOutcome::Skipped(_))));
	}

	#[test]
	fn complete_run_requires_export() {
		let mut report = RunReport::default();
		report.record(Step::Login, StepOutcome::succeeded("submitted"));
		assert!(!report.is_complete());
		report.exported = Some(PathBuf::from("downloads/report.xlsx"));
		assert!(report.is_complete());
		report.rows.failed = 1;
		assert!(!report.is_complete());
	}

	#[test]
	fn report_line_is_found_in_noisy_output() {
		let mut report = RunReport::default();
		report.record(Step::Login, StepOutcome::skipped("missing fields"));
		report.rows.filled = 21;
		let stdout = format!("Starting...\nsome log line\n{}\nbye\n", report.to_line());

		let value = RunReport::extract_from_output(&stdout).unwrap();
		assert_eq!(value["rows"]["filled"], 21);
		assert_eq!(value["steps"][0]["outcome"]["status"], "skipped");
		assert!(RunReport::extract_from_output("no report here").is_none());
	}
}
