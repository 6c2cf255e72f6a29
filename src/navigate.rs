use std::time::Duration;

use chromiumoxide::Page;
use color_eyre::Result;
use v_utils::{elog, log};

use crate::{
	config::AppConfig,
	labels,
	locate::{self, Cascade, Locator},
	report::StepOutcome,
};

/// Clickable elements the "Report and Update" entry is searched among
const CLICKABLES: &str = r#"button, a, [role="button"]"#;

pub fn report_entry_cascade() -> Cascade {
	// Lives in a collapsed menu, so hidden matches count
	Cascade::new("'Report and Update' entry", vec![Locator::exact_text(CLICKABLES, labels::REPORT_AND_UPDATE)]).including_hidden()
}

pub fn previous_month_cascade() -> Cascade {
	let mut locators: Vec<Locator> = [labels::PREVIOUS, labels::BACK, "<", "<<"].into_iter().map(Locator::text).collect();
	locators.extend([
		Locator::has_text("button", labels::PREVIOUS),
		Locator::has_text("a", labels::PREVIOUS),
		Locator::has_text("button", "<"),
		Locator::has_text("a", "<"),
		Locator::attr("title", labels::PREVIOUS),
		Locator::attr("title", "previous"),
		Locator::css(".prev-month"),
		Locator::css(".previous"),
		Locator::attr("onclick", "prev"),
		Locator::attr("onclick", labels::PREVIOUS),
	]);
	Cascade::new("previous month button", locators)
}

/// Open the monthly calendar through "Report and Update".
///
/// A miss here is terminal for the pass: the runner stops and reports early termination.
pub async fn open_report_page(page: &Page, config: &AppConfig) -> StepOutcome {
	StepOutcome::from_result(try_open_report_page(page, config).await)
}

async fn try_open_report_page(page: &Page, config: &AppConfig) -> Result<StepOutcome> {
	log!("Looking for 'דיווח ועדכון' button...");
	let cascade = report_entry_cascade();
	let found = match cascade.resolve(page).await {
		Ok(found) => found,
		Err(e) => {
			elog!("'דיווח ועדכון' button not found");
			locate::dump_candidates(page, CLICKABLES, &["href", "id"], 20).await;
			return Err(e);
		}
	};

	let before = locate::current_url(page).await;
	locate::activate(&found.element, cascade.target()).await?;
	log!("Clicked 'דיווח ועדכון', waiting for navigation...");
	locate::wait_for_settle(page, Duration::from_secs(15), config.settle()).await;

	let after = locate::current_url(page).await;
	log!("Current URL: {after}");
	if before == after {
		elog!("URL did not change after clicking - may have opened in-page content");
	}
	Ok(StepOutcome::succeeded(format!("now at {after}")))
}

/// Step the calendar back one month. Missing is logged with a dump and recorded as skipped.
pub async fn previous_month(page: &Page, config: &AppConfig) -> StepOutcome {
	let cascade = previous_month_cascade();
	let result = async {
		let found = match cascade.resolve(page).await {
			Ok(found) => found,
			Err(e) => {
				elog!("Could not find previous month button. Available navigation elements:");
				locate::dump_candidates(page, "button, a, [onclick]", &["onclick", "title"], 20).await;
				return Err(e);
			}
		};
		locate::activate(&found.element, cascade.target()).await?;
		locate::wait_for_settle(page, Duration::from_secs(10), config.settle()).await;
		Ok(StepOutcome::succeeded(format!("clicked {}", found.locator)))
	}
	.await;
	StepOutcome::from_result(result)
}
