use std::time::Duration;

use chromiumoxide::{Page, element::Element};
use color_eyre::{Result, eyre::eyre};
use derive_new::new;
use v_utils::{elog, log};

use crate::{StepError, config::AppConfig, labels, locate, report::RowCounts};

const ENTRY_INPUT: &str = r#"input[id*="ManualEntry"]"#;
const EXIT_INPUT: &str = r#"input[id*="ManualExit"]"#;

/// Tried in order; the first selector with any match wins
const ROW_SELECTORS: [&str; 3] = [
	r#"table.HReportsGrid [id$="_innerBody"] tr"#,
	r#"tr[id*="ctl00_mp_RG_Days"][id*="row_"]"#,
	r#"tr:has(input[id*="ManualEntry"])"#,
];
const TEXT_INPUT_ROWS: &str = r#"tr:has(input[type="text"])"#;

const KEY_GAP: Duration = Duration::from_millis(50);
const DROPDOWN_GAP: Duration = Duration::from_millis(200);
const ROW_GAP: Duration = Duration::from_millis(500);

/// What a grid row offers
#[derive(Clone, Copy, Debug, Eq, PartialEq, new)]
pub struct RowShape {
	pub entry_visible: bool,
	pub exit_visible: bool,
	pub dropdowns: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RowPlan {
	Fill,
	Skip(String),
}

impl RowShape {
	/// A day row has both time inputs visible and at least two dropdowns; anything else (headers, totals) is left untouched
	pub fn plan(&self) -> RowPlan {
		if !self.entry_visible || !self.exit_visible {
			return RowPlan::Skip("missing time inputs".into());
		}
		if self.dropdowns < 2 {
			return RowPlan::Skip(format!("not enough dropdowns ({})", self.dropdowns));
		}
		RowPlan::Fill
	}
}

/// Which option of a dropdown to pick, given its option labels.
///
/// Attendance beats work type beats "no clock installed"; failing all three, the first real option after the placeholder.
pub fn pick_dropdown_option(options: &[String]) -> Option<usize> {
	let first_containing = |needles: &[&str]| options.iter().position(|label| needles.iter().any(|n| label.contains(n)));
	first_containing(&[labels::ATTENDANCE])
		.or_else(|| first_containing(&[labels::WORK]))
		.or_else(|| first_containing(&[labels::NOT_INSTALLED, labels::ATTENDANCE_CLOCK]))
		.or_else(|| (options.len() >= 2).then_some(1))
}

/// Fill every qualifying grid row with entry/exit time and dropdown choices.
///
/// Failures are per-row: logged, counted, and never stop the remaining rows. Nothing is rolled back.
pub async fn fill_rows(page: &Page, config: &AppConfig) -> Result<RowCounts> {
	let rows = discover_rows(page).await;
	if rows.is_empty() {
		return Err(StepError::not_found("timesheet rows").into());
	}
	log!("Processing {} rows", rows.len());

	let mut counts = RowCounts::default();
	for (i, row) in rows.iter().enumerate() {
		let n = i + 1;
		let shape = read_shape(row).await;
		if let RowPlan::Skip(reason) = shape.plan() {
			log!("Skipping row {n}: {reason}");
			counts.skipped += 1;
			continue;
		}
		log!("Processing row {n}: 2 time inputs, {} dropdowns", shape.dropdowns);

		match fill_row(row, config).await {
			Ok(0) => counts.filled += 1,
			Ok(failures) => {
				elog!("Row {n}: {failures} field(s) could not be filled");
				counts.failed += 1;
			}
			Err(e) => {
				elog!("Error filling row {n}: {e}");
				counts.failed += 1;
			}
		}
		tokio::time::sleep(ROW_GAP).await;
	}

	tracing::info!(filled = counts.filled, skipped = counts.skipped, failed = counts.failed, "grid fill finished");
	Ok(counts)
}

async fn discover_rows(page: &Page) -> Vec<Element> {
	let mut rows = Vec::new();
	for (i, selector) in ROW_SELECTORS.iter().enumerate() {
		rows = page.find_elements(*selector).await.unwrap_or_default();
		log!("Method {}: Found {} rows with {}", i + 1, rows.len(), selector);
		if !rows.is_empty() {
			break;
		}
	}

	if rows.len() <= 1 {
		elog!("Only found {} rows, trying alternative detection...", rows.len());
		let with_text_inputs = page.find_elements(TEXT_INPUT_ROWS).await.unwrap_or_default();
		log!("Rows with text inputs: {}", with_text_inputs.len());
		if with_text_inputs.len() > rows.len() {
			rows = with_text_inputs;
		}
	}
	rows
}

async fn read_shape(row: &Element) -> RowShape {
	let visible = |selector: &'static str| async move {
		match row.find_element(selector).await {
			Ok(input) => locate::is_visible(&input).await,
			Err(_) => false,
		}
	};
	let dropdowns = row.find_elements("select").await.map(|s| s.len()).unwrap_or(0);
	RowShape::new(visible(ENTRY_INPUT).await, visible(EXIT_INPUT).await, dropdowns)
}

/// Returns how many fields of the row failed
async fn fill_row(row: &Element, config: &AppConfig) -> Result<usize> {
	let mut failures = 0;

	let entry = row.find_element(ENTRY_INPUT).await.map_err(|e| eyre!("Entry input vanished: {}", e))?;
	let exit = row.find_element(EXIT_INPUT).await.map_err(|e| eyre!("Exit input vanished: {}", e))?;
	for (input, what, digits) in [(&entry, "entry", config.entry_time.as_str()), (&exit, "exit", config.exit_time.as_str())] {
		if !fill_time(input, what, digits).await {
			failures += 1;
		}
		tokio::time::sleep(Duration::from_millis(300)).await;
	}

	let dropdowns = row.find_elements("select").await.unwrap_or_default();
	for (i, dropdown) in dropdowns.iter().enumerate() {
		if let Err(e) = choose_option(dropdown, i).await {
			elog!("Dropdown {i}: {e}");
			failures += 1;
		}
		tokio::time::sleep(DROPDOWN_GAP).await;
	}
	Ok(failures)
}

/// Typing digit by digit first, since the masked inputs ignore a bulk assignment; direct assignment if typing throws
async fn fill_time(input: &Element, what: &str, digits: &str) -> bool {
	match type_digits(input, digits).await {
		Ok(()) => {
			log!("{what} time filled (typed)");
			return true;
		}
		Err(e) => elog!("Typing {what} time failed: {e}"),
	}
	match locate::set_value(input, digits).await {
		Ok(()) => {
			log!("{what} time filled (assigned)");
			true
		}
		Err(e) => {
			elog!("All {what} time methods failed: {e}");
			false
		}
	}
}

async fn type_digits(input: &Element, digits: &str) -> Result<()> {
	input.click().await.map_err(|e| StepError::action("focus time input", e))?;
	tokio::time::sleep(Duration::from_millis(100)).await;
	input.call_js_fn("function() { this.select(); }", false).await.map_err(|e| StepError::action("select time input", e))?;
	tokio::time::sleep(KEY_GAP).await;
	input.press_key("Backspace").await.map_err(|e| StepError::action("clear time input", e))?;
	for digit in digits.chars() {
		tokio::time::sleep(KEY_GAP).await;
		input.type_str(digit.to_string()).await.map_err(|e| StepError::action("type digit", e))?;
	}
	Ok(())
}

async fn choose_option(dropdown: &Element, i: usize) -> Result<()> {
	let ret = dropdown
		.call_js_fn("function() { return JSON.stringify(Array.from(this.options).map(o => (o.textContent || '').trim())); }", false)
		.await
		.map_err(|e| StepError::action("read dropdown options", e))?;
	let raw = ret.result.value.and_then(|v| v.as_str().map(str::to_string)).unwrap_or_else(|| "[]".to_string());
	let options: Vec<String> = serde_json::from_str(&raw)?;
	log!("Dropdown {i} options: {options:?}");

	let Some(index) = pick_dropdown_option(&options) else {
		log!("Dropdown {i}: nothing to pick");
		return Ok(());
	};
	let script = format!("function() {{ this.selectedIndex = {index}; this.dispatchEvent(new Event('change', {{ bubbles: true }})); return this.selectedIndex; }}");
	dropdown.call_js_fn(script, false).await.map_err(|e| StepError::action("select dropdown option", e))?;
	log!("Dropdown {i}: selected {:?}", options[index]);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn labels(items: &[&str]) -> Vec<String> {
		items.iter().map(|s| s.to_string()).collect()
	}

	#[test]
	fn attendance_wins_over_everything() {
		let options = labels(&["", "עבודה", "נוכחות", "לא מותקן שעון נוכחות"]);
		assert_eq!(pick_dropdown_option(&options), Some(2));
	}

	#[test]
	fn work_type_when_no_attendance() {
		assert_eq!(pick_dropdown_option(&labels(&["בחר", "חופשה", "עבודה מהבית", "עבודה"])), Some(2));
	}

	#[test]
	fn clock_not_installed_as_third_choice() {
		assert_eq!(pick_dropdown_option(&labels(&["", "שכחתי", "לא מותקן"])), Some(2));
	}

	#[test]
	fn falls_back_to_first_real_option() {
		assert_eq!(pick_dropdown_option(&labels(&["", "a", "b"])), Some(1));
		assert_eq!(pick_dropdown_option(&labels(&["only"])), None);
		assert_eq!(pick_dropdown_option(&[]), None);
	}

	#[test]
	fn pick_is_deterministic() {
		let options = labels(&["", "עבודה", "נוכחות"]);
		let first = pick_dropdown_option(&options);
		assert!((0..10).all(|_| pick_dropdown_option(&options) == first));
	}

	#[test]
	fn rows_without_time_inputs_are_skipped() {
		assert_eq!(RowShape::new(true, true, 3).plan(), RowPlan::Fill);
		assert!(matches!(RowShape::new(false, true, 3).plan(), RowPlan::Skip(_)));
		assert!(matches!(RowShape::new(true, false, 3).plan(), RowPlan::Skip(_)));
		assert_eq!(RowShape::new(true, true, 1).plan(), RowPlan::Skip("not enough dropdowns (1)".into()));
	}

	#[test]
	fn skipping_one_row_does_not_affect_others() {
		let shapes = [RowShape::new(true, true, 2), RowShape::new(false, false, 0), RowShape::new(true, true, 4)];
		let plans: Vec<_> = shapes.iter().map(RowShape::plan).collect();
		assert_eq!(plans[0], RowPlan::Fill);
		assert!(matches!(plans[1], RowPlan::Skip(_)));
		assert_eq!(plans[2], RowPlan::Fill);
	}
}
