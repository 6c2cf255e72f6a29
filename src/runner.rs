//! One automation pass: login, open the calendar, select the month's workdays, fill the grid, save and export.

use chromiumoxide::Page;
use color_eyre::Result;
use v_utils::log;

use crate::{
	calendar::{self, SelectionSummary, TargetMonth},
	config::AppConfig,
	debug, export, login, navigate,
	report::{RowCounts, RunReport, Step, StepOutcome},
	rows,
	session::Session,
};

/// Run one pass against the account in `config`.
///
/// Only fatal errors (browser launch, page creation) are returned as `Err`; everything a step can run into ends up in
/// the report instead.
pub async fn run(config: &AppConfig) -> Result<RunReport> {
	let run_id = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
	tracing::info!(%run_id, ?config, "starting run");

	let mut session = Session::launch(config).await?;
	let report = drive(&mut session, config, &run_id).await;

	debug::screenshot(&session.page, &config.debug_dir, "final.png").await;
	session.close().await;
	Ok(report)
}

async fn drive(session: &mut Session, config: &AppConfig, run_id: &str) -> RunReport {
	let page = session.page.clone();
	let mut report = RunReport::default();

	// Login problems are not fatal here: a live session may already be in place, and the next step shows whether it is
	report.record(Step::Login, login::authenticate(&page, config).await);

	let opened = navigate::open_report_page(&page, config).await;
	let reached_calendar = opened.is_succeeded();
	report.record(Step::OpenReport, opened);
	if !reached_calendar {
		log!("'דיווח ועדכון' not reachable, ending pass");
		report.terminated_early = true;
		debug::snapshot_html(&page, run_id).await;
		return report;
	}
	debug::screenshot(&page, &config.debug_dir, "debug-after-navigation.png").await;
	debug::snapshot_html(&page, run_id).await;

	report.record(Step::PreviousMonth, navigate::previous_month(&page, config).await);

	let month = TargetMonth::previous_of(chrono::Local::now().date_naive());
	let selection = select_days(&page, month, &mut report).await;
	report.record(Step::SelectDays, selection);
	report.record(Step::CommitDays, calendar::commit_selection(&page, config.settle()).await);
	debug::snapshot_html(&page, run_id).await;

	let filled = fill_grid(&page, config, &mut report.rows).await;
	report.record(Step::FillRows, filled);

	export::save_and_export(session, config, &mut report, run_id).await;
	report
}

async fn select_days(page: &Page, month: TargetMonth, report: &mut RunReport) -> StepOutcome {
	match calendar::select_workdays(page, month).await {
		Ok(summary) => {
			report.days_selected = summary.selected;
			report.days_deselected = summary.deselected;
			selection_outcome(month, &summary)
		}
		Err(e) => StepOutcome::from_result(Err(e)),
	}
}

fn selection_outcome(month: TargetMonth, summary: &SelectionSummary) -> StepOutcome {
	let detail = format!(
		"{month}: {} workdays selected, {} weekend days deselected, {} unclassifiable",
		summary.selected, summary.deselected, summary.unclassifiable
	);
	match summary.click_failures {
		0 => StepOutcome::succeeded(detail),
		n => StepOutcome::failed(format!("{detail}; {n} clicks failed")),
	}
}

async fn fill_grid(page: &Page, config: &AppConfig, counts: &mut RowCounts) -> StepOutcome {
	match rows::fill_rows(page, config).await {
		Ok(filled) => {
			*counts = filled;
			let detail = format!("{} filled, {} skipped, {} failed", filled.filled, filled.skipped, filled.failed);
			// Failed rows stay as they are for manual review
			match filled.failed {
				0 => StepOutcome::succeeded(detail),
				_ => StepOutcome::failed(detail),
			}
		}
		Err(e) => StepOutcome::from_result(Err(e)),
	}
}
