use std::{fmt, path::PathBuf, time::Duration};

use color_eyre::{Result, eyre::bail};
use v_utils::macros::{MyConfigPrimitives, Settings};

/// Explicit CSS selectors for the login form, replacing the positional guess
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoginFields {
	pub username: String,
	pub password: String,
	pub employee_id: String,
}

/// Sources layer as config file (`~/.config/hilan_headless.*` or `--config`) < `HILAN_HEADLESS_*` env < flags.
///
/// String fields also accept `{ env = "VAR" }` / `{ file = "PATH" }` in the config file, which is the way to keep the
/// password out of it.
#[derive(Clone, MyConfigPrimitives, Settings)]
pub struct AppConfig {
	/// Username for Hilan login
	#[serde(default)]
	pub username: String,
	/// Password for Hilan login. Used once per run, never logged
	#[serde(default)]
	pub password: String,
	/// Employee ID (the "ID" field on the login form)
	#[serde(default)]
	pub employee_id: String,
	/// Hilan login page
	#[serde(default)]
	pub login_url: String,
	/// Where the exported Excel file lands (default: ./downloads)
	#[settings(default = PathBuf::from("./downloads"))]
	pub downloads_dir: PathBuf,
	/// Where checkpoint screenshots are written (default: .)
	#[settings(default = PathBuf::from("."))]
	pub debug_dir: PathBuf,
	/// Run with visible browser window (non-headless mode)
	#[serde(default)]
	pub visible: bool,
	/// Digits typed into every entry-time field (default: 0900)
	#[settings(default = "0900".to_string())]
	pub entry_time: String,
	/// Digits typed into every exit-time field (default: 1730)
	#[settings(default = "1730".to_string())]
	pub exit_time: String,
	/// Settle delay in ms after navigation-like actions (default: 2000)
	#[serde(default = "default_settle_ms")]
	pub settle_ms: u64,
	/// Login field selectors. Given all three, they replace the positional guess
	#[serde(default)]
	pub username_selector: Option<String>,
	#[serde(default)]
	pub password_selector: Option<String>,
	#[serde(default)]
	pub id_selector: Option<String>,
}

fn default_settle_ms() -> u64 {
	2000
}

impl Default for AppConfig {
	fn default() -> Self {
		Self {
			username: String::new(),
			password: String::new(),
			employee_id: String::new(),
			login_url: String::new(),
			downloads_dir: PathBuf::from("./downloads"),
			debug_dir: PathBuf::from("."),
			visible: false,
			entry_time: "0900".to_string(),
			exit_time: "1730".to_string(),
			settle_ms: default_settle_ms(),
			username_selector: None,
			password_selector: None,
			id_selector: None,
		}
	}
}

impl fmt::Debug for AppConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AppConfig")
			.field("username", &self.username)
			.field("password", &if self.password.is_empty() { "<unset>" } else { "***" })
			.field("employee_id", &self.employee_id)
			.field("login_url", &self.login_url)
			.field("downloads_dir", &self.downloads_dir)
			.field("debug_dir", &self.debug_dir)
			.field("visible", &self.visible)
			.field("entry_time", &self.entry_time)
			.field("exit_time", &self.exit_time)
			.field("settle_ms", &self.settle_ms)
			.field("login_fields", &self.login_fields())
			.finish()
	}
}

impl SettingsFlags {
	/// Arguments that make a child `run` resolve the same config file. Env reaches it by inheritance.
	pub fn forwarded_args(&self) -> Vec<String> {
		match &self.config {
			Some(path) => vec!["--config".to_string(), path.0.display().to_string()],
			None => Vec::new(),
		}
	}
}

impl AppConfig {
	/// Resolve file, env and flags, then check the result is something a run can use
	pub fn load(flags: SettingsFlags) -> Result<Self> {
		let config = Self::try_build(flags)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.username.is_empty() {
			bail!("Missing username (set HILAN_HEADLESS_USERNAME or --username)");
		}
		if self.password.is_empty() {
			bail!("Missing password (set HILAN_HEADLESS_PASSWORD or --password)");
		}
		if self.employee_id.is_empty() {
			bail!("Missing employee ID (set HILAN_HEADLESS_EMPLOYEE_ID or --employee-id)");
		}
		if self.login_url.is_empty() {
			bail!("Missing login page URL (set HILAN_HEADLESS_LOGIN_URL or --login-url)");
		}
		validate_time_digits("entry time", &self.entry_time)?;
		validate_time_digits("exit time", &self.exit_time)?;
		match (&self.username_selector, &self.password_selector, &self.id_selector) {
			(None, None, None) => {}
			(Some(username), Some(password), Some(employee_id)) =>
				if [username, password, employee_id].iter().any(|s| s.trim().is_empty()) {
					bail!("Login field selectors must not be empty");
				},
			_ => bail!("Login field selectors must be given all together (username, password, ID) or not at all"),
		}
		Ok(())
	}

	/// The hardened field mapping, when all three selectors are set
	pub fn login_fields(&self) -> Option<LoginFields> {
		match (&self.username_selector, &self.password_selector, &self.id_selector) {
			(Some(username), Some(password), Some(employee_id)) => Some(LoginFields {
				username: username.clone(),
				password: password.clone(),
				employee_id: employee_id.clone(),
			}),
			_ => None,
		}
	}

	pub fn settle(&self) -> Duration {
		Duration::from_millis(self.settle_ms)
	}
}

/// Time fields are typed digit by digit, so the value must be exactly HHMM
fn validate_time_digits(what: &str, value: &str) -> Result<()> {
	if value.len() != 4 || !value.chars().all(|c| c.is_ascii_digit()) {
		bail!("Invalid {what} {value:?}: expected four digits HHMM");
	}
	let hours: u32 = value[..2].parse()?;
	let minutes: u32 = value[2..].parse()?;
	if hours > 23 || minutes > 59 {
		bail!("Invalid {what} {value:?}: out of range");
	}
	Ok(())
}
