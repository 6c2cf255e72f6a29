use std::time::Duration;

use chromiumoxide::{Page, element::Element};
use color_eyre::{Result, eyre::eyre};
use v_utils::{elog, log};

use crate::{
	StepError,
	config::{AppConfig, LoginFields},
	locate::{self, Cascade, Locator},
	report::StepOutcome,
};

const INPUT_WAIT: Duration = Duration::from_secs(10);

/// The three login inputs, each of which may be missing
#[derive(Default)]
struct FormFields {
	username: Option<Element>,
	password: Option<Element>,
	employee_id: Option<Element>,
}

impl FormFields {
	fn all_present(&self) -> bool {
		self.username.is_some() && self.password.is_some() && self.employee_id.is_some()
	}
}

/// Which positions of the text/password input lists hold which field
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PositionalAssignment {
	pub username: Option<usize>,
	pub employee_id: Option<usize>,
	pub password: Option<usize>,
}

/// First text input is the username, second is the employee ID, first password input is the password.
///
/// With fewer than two text inputs neither username nor ID is assigned.
pub fn assign_by_position(text_inputs: usize, password_inputs: usize) -> PositionalAssignment {
	let (username, employee_id) = if text_inputs >= 2 { (Some(0), Some(1)) } else { (None, None) };
	PositionalAssignment {
		username,
		employee_id,
		password: (password_inputs >= 1).then_some(0),
	}
}

/// Open the login page, fill username/password/ID and submit.
pub async fn authenticate(page: &Page, config: &AppConfig) -> StepOutcome {
	StepOutcome::from_result(try_authenticate(page, config).await)
}

async fn try_authenticate(page: &Page, config: &AppConfig) -> Result<StepOutcome> {
	page.goto(config.login_url.as_str()).await.map_err(|e| eyre!("Failed to navigate to login page: {}", e))?;
	locate::wait_for_settle(page, Duration::from_secs(15), Duration::from_secs(1)).await;
	crate::debug::log_location(page, "Login page").await;

	start_new_session_if_offered(page, config).await;

	log!("Looking for login form fields...");
	if let Err(e) = locate::wait_for(page, "input", INPUT_WAIT).await {
		elog!("Error with login form: {e}");
		locate::dump_candidates(page, "input", &["id", "name", "type"], 30).await;
		return Err(e);
	}

	let fields = match config.login_fields() {
		Some(mapping) => fields_by_selector(page, &mapping).await?,
		None => fields_by_position(page).await?,
	};

	fill_field(fields.username.as_ref(), "username", &config.username).await;
	fill_field(fields.password.as_ref(), "password", &config.password).await;
	match fields.employee_id.as_ref() {
		Some(id_field) => {
			fill_field(Some(id_field), "ID", &config.employee_id).await;
			log!("ID field now contains: {:?}", locate::input_value(id_field).await.unwrap_or_default());
		}
		None => elog!("ID field not found!"),
	}

	if !fields.all_present() {
		elog!("Missing some required fields, not submitting");
		return Ok(StepOutcome::skipped("login form incomplete: not all of username/password/ID located"));
	}

	log!("Clicking login button...");
	let submit = submit_cascade().resolve(page).await?;
	submit.element.click().await.map_err(|e| StepError::action("click login button", e))?;

	log!("Waiting for dashboard to load...");
	locate::wait_for_settle(page, Duration::from_secs(20), config.settle()).await;
	crate::debug::log_location(page, "After login").await;

	Ok(StepOutcome::succeeded("credentials submitted"))
}

/// A bare `button` comes last: language toggles and the like are buttons too
fn submit_cascade() -> Cascade {
	Cascade::new(
		"login button",
		vec![Locator::css(r#"input[type="submit"]"#), Locator::css(r#"input[value="Logon"]"#), Locator::css("button")],
	)
}

fn new_session_cascade() -> Cascade {
	Cascade::new(
		"'click here' link",
		vec![
			Locator::has_text("a", "click here"),
			Locator::has_text("*", "click here"),
			Locator::has_text(r#"[href*="logout"], [onclick], a"#, "click here"),
		],
	)
}

/// The "click here" link that starts a new session when an old one is still around. Absence is normal.
async fn start_new_session_if_offered(page: &Page, config: &AppConfig) {
	let Some(link) = new_session_cascade().find(page).await else {
		log!("No 'click here' link found, proceeding with login...");
		return;
	};
	log!("Found 'click here' link ({}), starting new session...", link.locator);
	if let Err(e) = link.element.click().await {
		elog!("Failed to click 'click here' link: {e}");
		return;
	}
	locate::wait_for_settle(page, Duration::from_secs(10), config.settle()).await;
}

async fn fields_by_position(page: &Page) -> Result<FormFields> {
	let text_inputs = page.find_elements(r#"input[type="text"]"#).await.unwrap_or_default();
	let password_inputs = page.find_elements(r#"input[type="password"]"#).await.unwrap_or_default();
	log!("Text inputs: {}, Password inputs: {}", text_inputs.len(), password_inputs.len());

	for (i, field) in text_inputs.iter().enumerate() {
		let placeholder = field.attribute("placeholder").await.ok().flatten();
		let name = field.attribute("name").await.ok().flatten();
		let id = field.attribute("id").await.ok().flatten();
		log!("Text field {i}: placeholder={placeholder:?} name={name:?} id={id:?}");
	}

	let assignment = assign_by_position(text_inputs.len(), password_inputs.len());
	let mut text_inputs: Vec<Option<Element>> = text_inputs.into_iter().map(Some).collect();
	let mut password_inputs: Vec<Option<Element>> = password_inputs.into_iter().map(Some).collect();
	Ok(FormFields {
		username: take_at(&mut text_inputs, assignment.username),
		employee_id: take_at(&mut text_inputs, assignment.employee_id),
		password: take_at(&mut password_inputs, assignment.password),
	})
}

/// Element handles aren't `Clone`, so assigned positions are moved out of their slots
fn take_at<T>(slots: &mut [Option<T>], idx: Option<usize>) -> Option<T> {
	idx.and_then(|i| slots.get_mut(i)).and_then(Option::take)
}

/// Configured selectors must each match; a miss means the mapping is out of date
async fn fields_by_selector(page: &Page, mapping: &LoginFields) -> Result<FormFields> {
	let find = |selector: &str, what: &'static str| {
		let selector = selector.to_string();
		async move {
			page.find_element(selector.as_str())
				.await
				.map_err(|_| StepError::Config(format!("{what} selector {selector:?} matches nothing on the login page")))
		}
	};
	Ok(FormFields {
		username: Some(find(&mapping.username, "username").await?),
		password: Some(find(&mapping.password, "password").await?),
		employee_id: Some(find(&mapping.employee_id, "ID").await?),
	})
}

/// Failures are logged and swallowed so one bad field doesn't stop the others from being filled
async fn fill_field(field: Option<&Element>, what: &str, value: &str) {
	let Some(field) = field else {
		return;
	};
	log!("Filling {what} field...");
	let result = async {
		field.click().await.map_err(|e| StepError::action(format!("focus {what}"), e))?;
		locate::set_value(field, value).await
	}
	.await;
	match result {
		Ok(()) => log!("{what} filled successfully"),
		Err(e) => elog!("Error filling {what}: {e}"),
	}
}
