use std::time::Duration;

pub mod calendar;
pub mod config;
pub mod debug;
pub mod export;
pub mod locate;
pub mod login;
pub mod navigate;
pub mod report;
pub mod rows;
pub mod runner;
pub mod session;
pub mod webhook;

/// Failure taxonomy for a single automation step.
///
/// `ElementNotFound` and `Timeout` mean the step could not find what it was looking for and is recorded as skipped;
/// everything else is recorded as failed. See [`report::StepOutcome::from_result`].
#[derive(Debug, thiserror::Error)]
pub enum StepError {
	/// A selector cascade exhausted all of its candidates
	#[error("element not found: {target}")]
	ElementNotFound { target: String },
	/// A click/fill/type threw, after the fallback (if any) was attempted
	#[error("{action} failed: {reason}")]
	ActionFailed { action: String, reason: String },
	/// A bounded wait expired
	#[error("timed out after {after:?} waiting for {what}")]
	Timeout { what: String, after: Duration },
	/// Configuration does not match what the page offers
	#[error("configuration error: {0}")]
	Config(String),
}

impl StepError {
	pub fn not_found(target: impl Into<String>) -> Self {
		StepError::ElementNotFound { target: target.into() }
	}

	pub fn action(action: impl Into<String>, reason: impl ToString) -> Self {
		StepError::ActionFailed {
			action: action.into(),
			reason: reason.to_string(),
		}
	}

	/// Whether this error means "nothing to act on" rather than "acting went wrong"
	pub fn is_absence(&self) -> bool {
		matches!(self, StepError::ElementNotFound { .. } | StepError::Timeout { .. })
	}
}

/// Hebrew UI labels of the target application.
pub mod labels {
	/// "Report and Update" - entry point into the monthly calendar
	pub const REPORT_AND_UPDATE: &str = "דיווח ועדכון";
	/// "Previous"
	pub const PREVIOUS: &str = "הקודם";
	/// "Back"
	pub const BACK: &str = "חזרה";
	/// "Selected Days" - commits the calendar selection and opens the grid
	pub const SELECTED_DAYS: &str = "ימים נבחרים";
	/// "Analyzed Sheet"
	pub const ANALYZED_SHEET: &str = "גליון מנותח";
	/// "Report Summary"
	pub const REPORT_SUMMARY: &str = "ריכוז דיווחים";
	/// Dropdown keyword: "attendance"
	pub const ATTENDANCE: &str = "נוכחות";
	/// Dropdown keyword: "work"
	pub const WORK: &str = "עבודה";
	/// Dropdown keyword: "not installed"
	pub const NOT_INSTALLED: &str = "לא מותקן";
	/// Dropdown keyword: "attendance clock"
	pub const ATTENDANCE_CLOCK: &str = "שעון נוכחות";
	/// Words a save control may carry: save, update, confirm, send, close, saving
	pub const SAVE_WORDS: [&str; 6] = ["שמור", "עדכן", "אישור", "שלח", "סגור", "שמירה"];
}
