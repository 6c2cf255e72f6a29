//! Day selection on the monthly calendar.
//!
//! The calendar shows bare day numbers with no weekday information, so the weekday of each cell is computed from the
//! month we *expect* to be on (the one before today). Which cells to touch is decided by [`plan_cells`], a pure
//! function over what was observed in the page; the browser half only executes the plan.

use std::{sync::LazyLock, time::Duration};

use chromiumoxide::Page;
use chrono::{Datelike, Months, NaiveDate, Weekday};
use color_eyre::{Result, eyre::eyre};
use derive_new::new;
use regex::Regex;
use serde::Deserialize;
use v_utils::{elog, log};

use crate::{
	StepError, labels,
	locate::{self, Cascade, Locator},
	report::StepOutcome,
};

static DAY_CELL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{1,2}$").expect("static regex"));

const DAY_ATTR: &str = "data-hilan-day";
const CLICK_GAP: Duration = Duration::from_millis(200);
const PASS_GAP: Duration = Duration::from_millis(500);

/// The month whose days get reported
#[derive(Clone, Copy, Debug, Eq, PartialEq, new)]
pub struct TargetMonth {
	pub year: i32,
	pub month: u32,
}

impl TargetMonth {
	/// Month before `today`'s; January rolls back to December of the previous year
	pub fn previous_of(today: NaiveDate) -> Self {
		let first = today.with_day(1).unwrap_or(today);
		let prev = first.checked_sub_months(Months::new(1)).unwrap_or(first);
		Self::new(prev.year(), prev.month())
	}

	/// `None` when `day` does not exist in this month
	pub fn day_kind(&self, day: u32) -> Option<DayKind> {
		let date = NaiveDate::from_ymd_opt(self.year, self.month, day)?;
		Some(DayKind::of(date.weekday()))
	}
}

impl std::fmt::Display for TargetMonth {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:04}-{:02}", self.year, self.month)
	}
}

/// Sunday-Thursday work week
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DayKind {
	Workday,
	Weekend,
}

impl DayKind {
	pub fn of(weekday: Weekday) -> Self {
		match weekday {
			Weekday::Fri | Weekday::Sat => DayKind::Weekend,
			_ => DayKind::Workday,
		}
	}
}

/// What was read off one day cell
#[derive(Clone, Copy, Debug, Eq, PartialEq, new)]
pub struct CellObservation {
	pub day: u32,
	pub selected: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CellAction {
	/// Weekend that is currently selected; one click clears it
	Deselect,
	/// Workday; always clicked
	Select,
	/// Weekend that is already clear
	Leave,
	/// Day number that doesn't exist in the target month
	Unclassifiable,
}

/// One action per observed cell, in the same order.
///
/// Re-planning after the deselect pass yields `Leave` for every weekend, so the cleanup is idempotent.
pub fn plan_cells(month: TargetMonth, cells: &[CellObservation]) -> Vec<CellAction> {
	cells
		.iter()
		.map(|cell| match month.day_kind(cell.day) {
			None => CellAction::Unclassifiable,
			Some(DayKind::Workday) => CellAction::Select,
			Some(DayKind::Weekend) if cell.selected => CellAction::Deselect,
			Some(DayKind::Weekend) => CellAction::Leave,
		})
		.collect()
}

/// Day number of a cell text, if it looks like one
pub fn parse_day(text: &str) -> Option<u32> {
	let text = text.trim();
	DAY_CELL.is_match(text).then(|| text.parse().ok()).flatten()
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SelectionSummary {
	pub deselected: usize,
	pub selected: usize,
	pub unclassifiable: usize,
	pub click_failures: usize,
}

#[derive(Deserialize)]
struct RawCell {
	text: String,
	selected: bool,
}

/// Tags every short-text `td` with its index and reports its text and selection indicators
const OBSERVE_JS: &str = r#"
(function() {
	document.querySelectorAll('td[data-hilan-day]').forEach(td => td.removeAttribute('data-hilan-day'));
	const isSelected = (td) => {
		if (td.classList.contains('selected') || td.classList.contains('active')) return true;
		if (td.style.backgroundColor) return true;
		if (td.querySelector('.selected')) return true;
		return window.getComputedStyle(td).backgroundColor !== 'rgba(0, 0, 0, 0)';
	};
	const out = [];
	document.querySelectorAll('td').forEach(td => {
		const text = (td.textContent || '').trim();
		if (text.length === 0 || text.length > 2) return;
		td.setAttribute('data-hilan-day', String(out.length));
		out.push({ text, selected: isSelected(td) });
	});
	return out;
})()
"#;

/// Deselect preselected weekends, then click every workday of `month`.
pub async fn select_workdays(page: &Page, month: TargetMonth) -> Result<SelectionSummary> {
	log!("Selecting workdays for {month}...");
	let raw: Vec<RawCell> = page
		.evaluate(OBSERVE_JS)
		.await
		.map_err(|e| eyre!("Failed to read calendar cells: {}", e))?
		.into_value()
		.map_err(|e| eyre!("Unexpected calendar cell data: {}", e))?;
	let tagged = page.find_elements(format!("td[{DAY_ATTR}]")).await.unwrap_or_default();
	if tagged.len() != raw.len() {
		elog!("Calendar changed while being read ({} cells observed, {} tagged)", raw.len(), tagged.len());
	}

	let (observations, elements): (Vec<_>, Vec<_>) = raw
		.iter()
		.zip(tagged)
		.filter_map(|(cell, element)| parse_day(&cell.text).map(|day| (CellObservation::new(day, cell.selected), element)))
		.unzip();
	log!("Found {} day cells", observations.len());
	if observations.is_empty() {
		return Err(StepError::not_found("calendar day cells").into());
	}

	let plan = plan_cells(month, &observations);
	let mut summary = SelectionSummary::default();

	// Pass 1: weekend cleanup
	for ((cell, element), action) in observations.iter().zip(&elements).zip(&plan) {
		match action {
			CellAction::Deselect => {
				log!("Deselecting weekend day {}", cell.day);
				match element.click().await {
					Ok(_) => summary.deselected += 1,
					Err(e) => {
						elog!("Failed to deselect day {}: {}", cell.day, e);
						summary.click_failures += 1;
					}
				}
				tokio::time::sleep(CLICK_GAP).await;
			}
			CellAction::Unclassifiable => {
				tracing::warn!(day = cell.day, %month, "day does not exist in target month, skipping");
				summary.unclassifiable += 1;
			}
			CellAction::Select | CellAction::Leave => {}
		}
	}
	tokio::time::sleep(PASS_GAP).await;

	// Pass 2: workdays
	for ((cell, element), action) in observations.iter().zip(&elements).zip(&plan) {
		if *action != CellAction::Select {
			continue;
		}
		match element.click().await {
			Ok(_) => summary.selected += 1,
			Err(e) => {
				elog!("Failed to select day {}: {}", cell.day, e);
				summary.click_failures += 1;
			}
		}
		tokio::time::sleep(CLICK_GAP).await;
	}

	log!("Selected {} workdays, deselected {} weekend days", summary.selected, summary.deselected);
	Ok(summary)
}

/// Click "Selected Days" to commit the selection and open the grid
pub async fn commit_selection(page: &Page, settle: Duration) -> StepOutcome {
	let cascade = Cascade::new(
		"'Selected Days' button",
		vec![Locator::text(labels::SELECTED_DAYS), Locator::has_text(r#"button, a, input[type="button"]"#, labels::SELECTED_DAYS)],
	);
	let result = async {
		let found = cascade.resolve(page).await?;
		locate::activate(&found.element, cascade.target()).await?;
		locate::wait_for_settle(page, Duration::from_secs(15), settle).await;
		Ok::<_, color_eyre::Report>(StepOutcome::succeeded(format!("activated via {}", found.locator)))
	}
	.await;
	StepOutcome::from_result(result)
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Sakamoto's method; 0 = Sunday
	fn reference_weekday(year: i32, month: u32, day: u32) -> u32 {
		const T: [i32; 12] = [0, 3, 2, 5, 0, 3, 5, 1, 4, 6, 2, 4];
		let y = if month < 3 { year - 1 } else { year };
		((y + y / 4 - y / 100 + y / 400 + T[month as usize - 1] + day as i32) % 7) as u32
	}

	#[test]
	fn classification_matches_reference_calendar() {
		for year in 2023..=2027 {
			for month in 1..=12 {
				let target = TargetMonth::new(year, month);
				for day in 1..=31 {
					let Some(kind) = target.day_kind(day) else {
						assert!(NaiveDate::from_ymd_opt(year, month, day).is_none());
						continue;
					};
					let expected = match reference_weekday(year, month, day) {
						5 | 6 => DayKind::Weekend,
						_ => DayKind::Workday,
					};
					assert_eq!(kind, expected, "{year}-{month}-{day}");
				}
			}
		}
	}

	#[test]
	fn target_month_rolls_back_over_new_year() {
		let jan = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
		assert_eq!(TargetMonth::previous_of(jan), TargetMonth::new(2024, 12));
		let mar31 = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
		assert_eq!(TargetMonth::previous_of(mar31), TargetMonth::new(2024, 2));
	}

	#[test]
	fn november_2024_plan() {
		let month = TargetMonth::new(2024, 11);
		let cells: Vec<_> = (1..=30).map(|day| CellObservation::new(day, true)).collect();
		let plan = plan_cells(month, &cells);

		let days_with = |wanted: CellAction| -> Vec<u32> { cells.iter().zip(&plan).filter(|(_, a)| **a == wanted).map(|(c, _)| c.day).collect() };
		assert_eq!(days_with(CellAction::Deselect), vec![1, 2, 8, 9, 15, 16, 22, 23, 29, 30]);
		let selected = days_with(CellAction::Select);
		assert_eq!(selected.len(), 20);
		assert_eq!(&selected[..6], &[3, 4, 5, 6, 7, 10]);
		assert_eq!(selected.last(), Some(&28));
	}

	#[test]
	fn weekend_cleanup_is_idempotent() {
		let month = TargetMonth::new(2024, 11);
		let before = [CellObservation::new(1, true), CellObservation::new(2, true)];
		assert_eq!(plan_cells(month, &before), vec![CellAction::Deselect, CellAction::Deselect]);
		let after = [CellObservation::new(1, false), CellObservation::new(2, false)];
		assert_eq!(plan_cells(month, &after), vec![CellAction::Leave, CellAction::Leave]);
	}

	#[test]
	fn out_of_month_days_are_unclassifiable() {
		let plan = plan_cells(TargetMonth::new(2024, 11), &[CellObservation::new(31, false)]);
		assert_eq!(plan, vec![CellAction::Unclassifiable]);
		let plan = plan_cells(TargetMonth::new(2025, 2), &[CellObservation::new(29, true)]);
		assert_eq!(plan, vec![CellAction::Unclassifiable]);
	}

	#[test]
	fn only_short_numbers_are_day_cells() {
		assert_eq!(parse_day(" 7 "), Some(7));
		assert_eq!(parse_day("31"), Some(31));
		assert_eq!(parse_day("123"), None);
		assert_eq!(parse_day("א"), None);
		assert_eq!(parse_day(""), None);
	}
}
