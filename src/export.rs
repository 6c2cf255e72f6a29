//! Save the grid, then walk Analyzed Sheet -> Report Summary -> Excel export.
//!
//! Every hop is optional: a miss records the hop as skipped and stops the branch, it never errors the run. The Excel
//! click can end four ways (file downloaded, a save dialog took it, it opened in a new tab, or nothing happened), and
//! which one it was is decided by [`ExportOutcome::resolve`] from what was observed.

use std::{
	collections::HashSet,
	path::{Path, PathBuf},
	time::Duration,
};

use chromiumoxide::{
	Page,
	cdp::browser_protocol::browser::{EventDownloadProgress, EventDownloadWillBegin},
	listeners::EventStream,
};
use color_eyre::{Result, eyre::eyre};
use futures::{Stream, StreamExt};
use v_utils::{elog, log};

use crate::{
	config::AppConfig,
	debug, labels,
	locate::{self, Cascade, Locator},
	report::{RunReport, Step, StepOutcome},
	session::Session,
};

const EXCEL_LINK: &str = "a#ctl00_mp_Strip_helpExcel";
/// How long the Excel click gets to show any sign of a download
const DOWNLOAD_WINDOW: Duration = Duration::from_secs(10);
/// How long a download that did start gets to finish
const COMPLETION_WINDOW: Duration = Duration::from_secs(60);
const HOP_SETTLE: Duration = Duration::from_secs(3);

/// What was seen after clicking the Excel link
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExportObservations {
	/// A new file that landed in the downloads dir
	pub download: Option<PathBuf>,
	/// The save-dialog button that was found and clicked
	pub dialog_button: Option<String>,
	/// URL of a page that opened next to the main one
	pub new_tab: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExportOutcome {
	Downloaded { path: PathBuf },
	SaveDialog { button: String },
	NewTab { url: String },
	NotFound,
}

impl ExportOutcome {
	/// A download beats a dialog beats a new tab; nothing at all is an explicit `NotFound`
	pub fn resolve(observed: &ExportObservations) -> Self {
		if let Some(path) = &observed.download {
			return ExportOutcome::Downloaded { path: path.clone() };
		}
		if let Some(button) = &observed.dialog_button {
			return ExportOutcome::SaveDialog { button: button.clone() };
		}
		if let Some(url) = &observed.new_tab {
			return ExportOutcome::NewTab { url: url.clone() };
		}
		ExportOutcome::NotFound
	}

	pub fn to_step_outcome(&self) -> StepOutcome {
		match self {
			ExportOutcome::Downloaded { path } => StepOutcome::succeeded(format!("saved {}", path.display())),
			ExportOutcome::SaveDialog { button } => StepOutcome::succeeded(format!("confirmed save dialog via {button}")),
			ExportOutcome::NewTab { url } => StepOutcome::skipped(format!("export opened in a new tab ({url}), no file saved")),
			ExportOutcome::NotFound => StepOutcome::failed("no download, save dialog or new tab after clicking the Excel link"),
		}
	}
}

pub fn save_cascade() -> Cascade {
	let mut locators: Vec<Locator> = labels::SAVE_WORDS.iter().map(|w| Locator::text(*w)).collect();
	locators.extend(labels::SAVE_WORDS.iter().filter(|w| **w != "סגור").map(|w| Locator::value(*w)));
	locators.extend([
		Locator::css(r#"button[type="submit"]"#),
		Locator::css(r#"input[type="submit"]"#),
		Locator::has_text("button", "save"),
		Locator::has_text("button", "submit"),
		Locator::has_text("a", "שמור"),
		Locator::has_text("a", "עדכן"),
		Locator::has_text("a", "שמירה"),
		Locator::attr("onclick", "save"),
		Locator::attr("onclick", "submit"),
		Locator::attr("onclick", "שמור"),
		Locator::attr("onclick", "שמירה"),
	]);
	Cascade::new("save button", locators)
}

/// Any clickable whose text or value mentions saving, visible or not
fn last_chance_save_cascade() -> Cascade {
	let scope = r#"button, input[type="submit"], input[type="button"], a"#;
	Cascade::new("save-like control", ["שמור", "עדכן", "אישור", "שלח"].into_iter().map(|w| Locator::has_text(scope, w)).collect()).including_hidden()
}

fn analyzed_sheet_cascade() -> Cascade {
	let label = labels::ANALYZED_SHEET;
	Cascade::new(
		"'Analyzed Sheet' button",
		vec![
			Locator::text(label),
			Locator::has_text("button", label),
			Locator::has_text("a", label),
			Locator::attr("title", label),
			Locator::attr("onclick", label),
		],
	)
}

fn report_summary_cascade() -> Cascade {
	let label = labels::REPORT_SUMMARY;
	Cascade::new(
		"'Report Summary' link",
		vec![
			Locator::has_text("a", label),
			Locator::css(r#"a[href*="AttendanceApproval.aspx"]"#),
			Locator::has_text("a.footer-links", label),
			Locator::text(label),
			Locator::has_text("button", label),
			Locator::attr("title", label),
			Locator::attr("onclick", label),
		],
	)
}

fn save_dialog_cascade() -> Cascade {
	Cascade::new(
		"save dialog button",
		vec![
			Locator::has_text("button", "Save"),
			Locator::css(r#"button[type="submit"]"#),
			Locator::css(r#"input[type="submit"]"#),
			Locator::has_text("button", "שמור"),
			Locator::has_text("button", "OK"),
			Locator::has_text("button", "Confirm"),
		],
	)
}

/// Run the save step and the export branch, recording each step into `report`.
pub async fn save_and_export(session: &mut Session, config: &AppConfig, report: &mut RunReport, run_id: &str) {
	let page = session.page.clone();

	let save = StepOutcome::from_result(click_save(&page, config).await);
	let saved = save.is_succeeded();
	report.record(Step::Save, save);
	if !saved {
		report.skip_rest(&[Step::AnalyzedSheet, Step::ReportSummary, Step::ExcelExport], Step::Save);
		return;
	}
	debug::log_location(&page, "After save").await;

	let outcome = hop(&page, &analyzed_sheet_cascade(), &config.debug_dir, "debug-gilion-munatach.png", &["href", "id"]).await;
	let reached = outcome.is_succeeded();
	report.record(Step::AnalyzedSheet, outcome);
	if !reached {
		report.skip_rest(&[Step::ReportSummary, Step::ExcelExport], Step::AnalyzedSheet);
		return;
	}
	debug::snapshot_html(&page, run_id).await;

	let outcome = hop(&page, &report_summary_cascade(), &config.debug_dir, "debug-rikuz-diyurim.png", &["href", "class"]).await;
	let reached = outcome.is_succeeded();
	report.record(Step::ReportSummary, outcome);
	if !reached {
		report.skip_rest(&[Step::ExcelExport], Step::ReportSummary);
		return;
	}
	debug::snapshot_html(&page, run_id).await;

	let outcome = match export_excel(session, config).await {
		Ok(resolved) => {
			if let ExportOutcome::Downloaded { path } = &resolved {
				report.exported = Some(path.clone());
			}
			resolved.to_step_outcome()
		}
		Err(e) => StepOutcome::from_result(Err(e)),
	};
	report.record(Step::ExcelExport, outcome);
}

async fn click_save(page: &Page, config: &AppConfig) -> Result<StepOutcome> {
	locate::dump_candidates(page, r#"button, input[type="submit"], input[type="button"], a"#, &["value", "onclick"], 30).await;

	let found = match save_cascade().resolve(page).await {
		Ok(found) => found,
		Err(_) => {
			elog!("No save button found with any selector, searching all buttons for save-like text...");
			// An unsaved grid is a failure, not a skip
			last_chance_save_cascade().resolve(page).await.map_err(|_| eyre!("No save control found, grid left unsaved"))?
		}
	};
	locate::activate(&found.element, "save button").await?;
	log!("Timesheet submitted via {}", found.locator);
	tokio::time::sleep(Duration::from_secs(2)).await;
	locate::wait_for_settle(page, Duration::from_secs(15), config.settle()).await;
	Ok(StepOutcome::succeeded(format!("clicked {}", found.locator)))
}

/// Click through to the next page of the branch and screenshot it
async fn hop(page: &Page, cascade: &Cascade, debug_dir: &Path, shot: &str, dump_attrs: &[&str]) -> StepOutcome {
	let result = async {
		let found = match cascade.resolve(page).await {
			Ok(found) => found,
			Err(e) => {
				elog!("{} not found", cascade.target());
				locate::dump_candidates(page, "a", dump_attrs, 20).await;
				return Err(e);
			}
		};
		locate::activate(&found.element, cascade.target()).await?;
		tokio::time::sleep(HOP_SETTLE).await;
		debug::log_location(page, cascade.target()).await;
		debug::screenshot(page, debug_dir, shot).await;
		Ok(StepOutcome::succeeded(format!("clicked {}", found.locator)))
	}
	.await;
	StepOutcome::from_result(result)
}

async fn export_excel(session: &mut Session, config: &AppConfig) -> Result<ExportOutcome> {
	let page = session.page.clone();
	let link = match page.find_element(EXCEL_LINK).await.ok() {
		Some(link) if locate::is_visible(&link).await => link,
		_ => {
			elog!("Excel export link not found");
			locate::dump_candidates(&page, "a", &["id", "title"], 20).await;
			return Err(crate::StepError::not_found("Excel export link").into());
		}
	};
	log!("Found Excel export link");

	let watch = DownloadWatch::arm(&page, &session.downloads_dir).await?;
	locate::activate(&link, "Excel export link").await?;
	log!("Clicked Excel export link");

	let mut observed = ExportObservations {
		download: watch.wait().await,
		..Default::default()
	};
	if observed.download.is_none() {
		log!("No download detected, checking for Save As dialog...");
		tokio::time::sleep(Duration::from_secs(2)).await;
		observed.dialog_button = confirm_save_dialog(&page).await;
	}
	if observed.download.is_none() && observed.dialog_button.is_none() {
		log!("No Save As dialog found, checking if Excel opened in new tab...");
		observed.new_tab = inspect_new_tab(session, &config.debug_dir).await;
	}

	let outcome = ExportOutcome::resolve(&observed);
	tracing::info!(?outcome, "excel export resolved");
	Ok(outcome)
}

async fn confirm_save_dialog(page: &Page) -> Option<String> {
	let found = save_dialog_cascade().find(page).await?;
	match found.element.click().await {
		Ok(_) => {
			tokio::time::sleep(Duration::from_secs(2)).await;
			log!("Clicked Save button in dialog");
			Some(found.locator.to_string())
		}
		Err(e) => {
			elog!("Failed to click dialog button: {e}");
			None
		}
	}
}

/// Screenshot and close the newest extra page, if any
async fn inspect_new_tab(session: &mut Session, debug_dir: &Path) -> Option<String> {
	let extra = session.extra_pages().await;
	let newest = extra.into_iter().last()?;
	if let Err(e) = newest.bring_to_front().await {
		elog!("Failed to switch to new page: {e}");
	}
	let url = locate::current_url(&newest).await;
	log!("Switched to new page: {url}");
	debug::screenshot(&newest, debug_dir, "debug-excel-opened.png").await;
	match newest.close().await {
		Ok(()) => log!("Closed Excel page"),
		Err(e) => elog!("Failed to close Excel page: {e}"),
	}
	Some(url)
}

/// Download listeners plus a directory snapshot, taken before the click that may trigger a download
struct DownloadWatch {
	begins: EventStream<EventDownloadWillBegin>,
	progress: EventStream<EventDownloadProgress>,
	dir: PathBuf,
	before: HashSet<PathBuf>,
}

impl DownloadWatch {
	async fn arm(page: &Page, dir: &Path) -> Result<Self> {
		let begins = page.event_listener::<EventDownloadWillBegin>().await.map_err(|e| eyre!("Failed to listen for downloads: {}", e))?;
		let progress = page.event_listener::<EventDownloadProgress>().await.map_err(|e| eyre!("Failed to listen for download progress: {}", e))?;
		Ok(Self {
			begins,
			progress,
			dir: dir.to_path_buf(),
			before: list_files(dir),
		})
	}

	/// A finished file in the downloads dir, or `None` once the window closes
	async fn wait(self) -> Option<PathBuf> {
		let begins = self.begins.map(|event| event.suggested_filename.clone());
		let finished = self.progress.map(|event| event.total_bytes > 0.0 && event.received_bytes >= event.total_bytes);
		await_download(begins, finished, &self.dir, &self.before, WatchWindows::default()).await
	}
}

#[derive(Clone, Copy, Debug)]
struct WatchWindows {
	initial: Duration,
	/// Replaces `initial` once a download has begun
	completion: Duration,
	poll: Duration,
}

impl Default for WatchWindows {
	fn default() -> Self {
		Self {
			initial: DOWNLOAD_WINDOW,
			completion: COMPLETION_WINDOW,
			poll: Duration::from_millis(500),
		}
	}
}

/// `begins` yields suggested filenames, `finished` whether a progress event reports completion
async fn await_download(
	begins: impl Stream<Item = String>,
	finished: impl Stream<Item = bool>,
	dir: &Path,
	before: &HashSet<PathBuf>,
	windows: WatchWindows,
) -> Option<PathBuf> {
	let mut begins = std::pin::pin!(begins);
	let mut finished = std::pin::pin!(finished);
	let mut deadline = tokio::time::Instant::now() + windows.initial;
	let mut suggested: Option<String> = None;
	let mut poll = tokio::time::interval(windows.poll);
	loop {
		tokio::select! {
			_ = tokio::time::sleep_until(deadline) => {
				if suggested.is_some() {
					elog!("Download started but did not finish within {:?}", windows.completion);
				}
				return None;
			}
			Some(name) = begins.next() => {
				log!("Excel download started: {name}");
				suggested = Some(name);
				deadline = tokio::time::Instant::now() + windows.completion;
			}
			Some(done) = finished.next() => {
				if let (true, Some(name)) = (done, &suggested) {
					let path = dir.join(name);
					if path.exists() {
						log!("Excel file saved to: {}", path.display());
						return Some(path);
					}
				}
			}
			_ = poll.tick() => {
				if let Some(path) = new_download(dir, before) {
					log!("New file detected: {}", path.display());
					return Some(path);
				}
			}
		}
	}
}

fn list_files(dir: &Path) -> HashSet<PathBuf> {
	std::fs::read_dir(dir).map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect()).unwrap_or_default()
}

/// A file in `dir` absent from `before`, excluding Chrome's in-progress `.crdownload` files
pub fn new_download(dir: &Path, before: &HashSet<PathBuf>) -> Option<PathBuf> {
	let mut fresh: Vec<PathBuf> = list_files(dir)
		.into_iter()
		.filter(|p| !before.contains(p) && p.is_file() && p.extension().is_none_or(|ext| ext != "crdownload"))
		.collect();
	fresh.sort();
	fresh.pop()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn nothing_observed_is_not_found() {
		assert_eq!(ExportOutcome::resolve(&ExportObservations::default()), ExportOutcome::NotFound);
		assert!(matches!(ExportOutcome::NotFound.to_step_outcome(), StepOutcome::Failed(_)));
	}

	#[test]
	fn download_wins_over_other_signals() {
		let observed = ExportObservations {
			download: Some(PathBuf::from("downloads/report.xlsx")),
			dialog_button: Some("button:has-text(\"Save\")".into()),
			new_tab: Some("https://example.com/x".into()),
		};
		assert_eq!(ExportOutcome::resolve(&observed), ExportOutcome::Downloaded {
			path: PathBuf::from("downloads/report.xlsx")
		});
	}

	#[test]
	fn new_tab_only_when_nothing_else() {
		let observed = ExportObservations {
			new_tab: Some("blob:excel".into()),
			..Default::default()
		};
		let outcome = ExportOutcome::resolve(&observed);
		assert_eq!(outcome, ExportOutcome::NewTab { url: "blob:excel".into() });
		assert!(matches!(outcome.to_step_outcome(), StepOutcome::Skipped(_)));
	}

	#[test]
	fn partial_downloads_are_ignored() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("old.xlsx"), b"old").unwrap();
		let before = list_files(dir.path());

		std::fs::write(dir.path().join("report.xlsx.crdownload"), b"partial").unwrap();
		assert_eq!(new_download(dir.path(), &before), None);

		std::fs::write(dir.path().join("report.xlsx"), b"done").unwrap();
		assert_eq!(new_download(dir.path(), &before), Some(dir.path().join("report.xlsx")));
	}

	fn short_windows() -> WatchWindows {
		WatchWindows {
			initial: Duration::from_millis(150),
			completion: Duration::from_millis(800),
			poll: Duration::from_millis(20),
		}
	}

	#[tokio::test]
	async fn quiet_click_gives_up_after_initial_window() {
		let dir = tempfile::tempdir().unwrap();
		let started = std::time::Instant::now();
		let found = await_download(futures::stream::pending::<String>(), futures::stream::empty::<bool>(), dir.path(), &HashSet::new(), short_windows()).await;
		assert_eq!(found, None);
		assert!(started.elapsed() < Duration::from_secs(2));
	}

	#[tokio::test]
	async fn begun_download_gets_the_completion_window() {
		let dir = tempfile::tempdir().unwrap();
		let sheet = dir.path().join("report.xlsx");
		let writer = {
			let sheet = sheet.clone();
			tokio::spawn(async move {
				tokio::time::sleep(Duration::from_millis(400)).await;
				std::fs::write(sheet, b"PK").unwrap();
			})
		};
		let begins = futures::stream::once(async { "report.xlsx".to_string() }).chain(futures::stream::pending());
		let found = await_download(begins, futures::stream::pending::<bool>(), dir.path(), &HashSet::new(), short_windows()).await;
		writer.await.unwrap();
		assert_eq!(found, Some(sheet));
	}

	#[test]
	fn save_cascade_tries_labels_before_generic_submits() {
		let cascade = save_cascade();
		let shown: Vec<String> = cascade.locators().iter().map(ToString::to_string).collect();
		assert_eq!(shown[0], r#"text="שמור""#);
		let first_value = shown.iter().position(|s| s.starts_with("input[value")).unwrap();
		let first_submit = shown.iter().position(|s| s == r#"button[type="submit"]"#).unwrap();
		assert_eq!(first_value, labels::SAVE_WORDS.len());
		assert!(first_value < first_submit);
		assert!(!shown.contains(&r#"input[value*="סגור"]"#.to_string()));
	}
}
