//! Element resolution over ordered selector cascades.
//!
//! The target UI is a legacy ASP.NET app whose markup drifts between sessions, so almost nothing is located by a
//! single selector. A [`Cascade`] is an ordered list of [`Locator`] strategies evaluated lazily in-page; the first one
//! that resolves wins. Text strategies (which plain CSS can't express) run as JavaScript that tags the hit with a
//! unique `data-hilan-mark` attribute, which is then fetched back as a CDP element handle.

use std::{
	fmt,
	sync::atomic::{AtomicU64, Ordering},
	time::{Duration, Instant},
};

use chromiumoxide::{Page, element::Element};
use color_eyre::{Result, eyre::eyre};
use serde::Serialize;
use v_utils::{elog, log};

use crate::StepError;

const MARK_ATTR: &str = "data-hilan-mark";
static NEXT_MARK: AtomicU64 = AtomicU64::new(1);

/// One strategy for finding an element
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
	/// Plain CSS selector
	Css { selector: String },
	/// Elements under `scope` whose trimmed text (or value) equals `text`
	ExactText { scope: String, text: String },
	/// Elements under `scope` whose text (or value) contains `text`
	HasText { scope: String, text: String },
	/// Elements whose `attr` attribute contains `contains`
	Attr { attr: String, contains: String },
	/// Inputs whose value contains `contains`
	Value { contains: String },
}

impl Locator {
	pub fn css(selector: impl Into<String>) -> Self {
		Locator::Css { selector: selector.into() }
	}

	/// Any element with exactly this text
	pub fn text(text: impl Into<String>) -> Self {
		Locator::ExactText {
			scope: "*".into(),
			text: text.into(),
		}
	}

	pub fn exact_text(scope: impl Into<String>, text: impl Into<String>) -> Self {
		Locator::ExactText {
			scope: scope.into(),
			text: text.into(),
		}
	}

	pub fn has_text(scope: impl Into<String>, text: impl Into<String>) -> Self {
		Locator::HasText {
			scope: scope.into(),
			text: text.into(),
		}
	}

	pub fn attr(attr: impl Into<String>, contains: impl Into<String>) -> Self {
		Locator::Attr {
			attr: attr.into(),
			contains: contains.into(),
		}
	}

	pub fn value(contains: impl Into<String>) -> Self {
		Locator::Value { contains: contains.into() }
	}

	/// In-page expression that tags the first match with `mark` and returns whether anything matched
	pub(crate) fn resolve_script(&self, mark: &str, visible_only: bool) -> String {
		// Serializing through serde_json yields valid JS literals, so no manual escaping
		let locator = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
		let mark = serde_json::to_string(mark).unwrap_or_else(|_| "\"\"".to_string());
		format!("{RESOLVE_JS}({locator}, {mark}, {visible_only})")
	}
}

impl fmt::Display for Locator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Locator::Css { selector } => write!(f, "{selector}"),
			Locator::ExactText { scope, text } if scope == "*" => write!(f, "text=\"{text}\""),
			Locator::ExactText { scope, text } => write!(f, "{scope}:text-is(\"{text}\")"),
			Locator::HasText { scope, text } => write!(f, "{scope}:has-text(\"{text}\")"),
			Locator::Attr { attr, contains } => write!(f, "[{attr}*=\"{contains}\"]"),
			Locator::Value { contains } => write!(f, "input[value*=\"{contains}\"]"),
		}
	}
}

const RESOLVE_JS: &str = r#"
(function(locator, mark, visibleOnly) {
	const isVisible = (el) => {
		const style = window.getComputedStyle(el);
		if (style.display === 'none' || style.visibility === 'hidden') return false;
		const rect = el.getBoundingClientRect();
		return rect.width > 0 || rect.height > 0;
	};
	const textOf = (el) => ((el.textContent || '').trim() || (el.value || '').trim());
	const all = (scope) => Array.from(document.querySelectorAll(scope));
	const innermost = (els) => els.filter(el => !els.some(other => other !== el && el.contains(other)));

	let candidates = [];
	switch (locator.kind) {
		case 'css':
			candidates = all(locator.selector);
			break;
		case 'exact_text':
			candidates = innermost(all(locator.scope).filter(el => textOf(el) === locator.text));
			break;
		case 'has_text':
			candidates = innermost(all(locator.scope).filter(el => textOf(el).includes(locator.text)));
			break;
		case 'attr':
			candidates = all('[' + locator.attr + ']').filter(el => (el.getAttribute(locator.attr) || '').includes(locator.contains));
			break;
		case 'value':
			candidates = all('input').filter(el => (el.value || '').includes(locator.contains));
			break;
	}

	const hit = candidates.find(el => !visibleOnly || isVisible(el));
	if (!hit) return false;
	hit.setAttribute('data-hilan-mark', mark);
	return true;
})
"#;

/// An element found by a cascade, together with the strategy that found it
pub struct Resolved {
	pub element: Element,
	pub locator: Locator,
}

/// Ordered locator strategies for one UI target
#[derive(Clone, Debug)]
pub struct Cascade {
	target: String,
	locators: Vec<Locator>,
	visible_only: bool,
}

impl Cascade {
	pub fn new(target: impl Into<String>, locators: Vec<Locator>) -> Self {
		Self {
			target: target.into(),
			locators,
			visible_only: true,
		}
	}

	/// Also accept hidden matches (e.g. items of a collapsed dropdown menu, which still take a dispatched click)
	pub fn including_hidden(mut self) -> Self {
		self.visible_only = false;
		self
	}

	pub fn target(&self) -> &str {
		&self.target
	}

	pub fn locators(&self) -> &[Locator] {
		&self.locators
	}

	/// Resolve or fail with [`StepError::ElementNotFound`]
	pub async fn resolve(&self, page: &Page) -> Result<Resolved> {
		for locator in &self.locators {
			match try_locator(page, locator, self.visible_only).await {
				Ok(Some(element)) => {
					log!("Found {} with selector: {}", self.target, locator);
					return Ok(Resolved {
						element,
						locator: locator.clone(),
					});
				}
				Ok(None) => {}
				// A malformed selector for this page is just a miss
				Err(e) => tracing::debug!(target = %self.target, %locator, "locator errored: {e}"),
			}
		}
		Err(StepError::not_found(&self.target).into())
	}

	/// Like [`Cascade::resolve`], but absence is `None`
	pub async fn find(&self, page: &Page) -> Option<Resolved> {
		self.resolve(page).await.ok()
	}
}

async fn try_locator(page: &Page, locator: &Locator, visible_only: bool) -> Result<Option<Element>> {
	let mark = NEXT_MARK.fetch_add(1, Ordering::Relaxed).to_string();
	let result = page
		.evaluate(locator.resolve_script(&mark, visible_only))
		.await
		.map_err(|e| eyre!("Failed to evaluate locator {}: {}", locator, e))?;
	if result.value().and_then(|v| v.as_bool()) != Some(true) {
		return Ok(None);
	}
	let element = page
		.find_element(format!(r#"[{MARK_ATTR}="{mark}"]"#))
		.await
		.map_err(|e| eyre!("Marked element vanished for {}: {}", locator, e))?;
	Ok(Some(element))
}

/// Fire a synthetic click event on the element, bypassing pointer hit-testing
pub async fn dispatch_click(element: &Element) -> Result<()> {
	element
		.call_js_fn(
			"function() { this.dispatchEvent(new MouseEvent('click', { bubbles: true, cancelable: true, view: window })); return true; }",
			false,
		)
		.await
		.map_err(|e| StepError::action("dispatch click", e))?;
	Ok(())
}

/// Dispatch-click first; on failure, retry once with a physical click
pub async fn activate(element: &Element, what: &str) -> Result<()> {
	match dispatch_click(element).await {
		Ok(()) => Ok(()),
		Err(dispatch_err) => {
			elog!("Dispatch click on {what} failed: {dispatch_err}. Trying regular click as fallback...");
			element.click().await.map_err(|e| StepError::action(format!("click on {what}"), e))?;
			Ok(())
		}
	}
}

pub async fn is_visible(element: &Element) -> bool {
	let script = r#"
		function() {
			const style = window.getComputedStyle(this);
			if (style.display === 'none' || style.visibility === 'hidden') return false;
			const rect = this.getBoundingClientRect();
			return rect.width > 0 || rect.height > 0;
		}
	"#;
	match element.call_js_fn(script, false).await {
		Ok(ret) => ret.result.value.and_then(|v| v.as_bool()).unwrap_or(false),
		Err(_) => false,
	}
}

/// Text of the element, trimmed; falls back to its `value` for inputs
pub async fn text_of(element: &Element) -> Option<String> {
	let ret = element
		.call_js_fn("function() { return ((this.textContent || '').trim() || (this.value || '').trim()); }", false)
		.await
		.ok()?;
	ret.result.value.and_then(|v| v.as_str().map(str::to_string))
}

/// Assign the value directly and fire the events a masked input listens for
pub async fn set_value(element: &Element, value: &str) -> Result<()> {
	let literal = serde_json::to_string(value)?;
	let script = format!(
		r#"
		function() {{
			this.focus();
			this.value = {literal};
			this.dispatchEvent(new Event('input', {{ bubbles: true }}));
			this.dispatchEvent(new Event('change', {{ bubbles: true }}));
			this.blur();
			return this.value;
		}}
		"#
	);
	element.call_js_fn(script, false).await.map_err(|e| StepError::action("fill", e))?;
	Ok(())
}

pub async fn input_value(element: &Element) -> Option<String> {
	let ret = element.call_js_fn("function() { return this.value; }", false).await.ok()?;
	ret.result.value.and_then(|v| v.as_str().map(str::to_string))
}

/// Poll until `selector` matches at least one element, or fail with [`StepError::Timeout`]
pub async fn wait_for(page: &Page, selector: &str, timeout: Duration) -> Result<()> {
	let start = Instant::now();
	loop {
		if page.find_elements(selector).await.map(|els| !els.is_empty()).unwrap_or(false) {
			return Ok(());
		}
		if start.elapsed() >= timeout {
			return Err(StepError::Timeout {
				what: format!("elements matching {selector}"),
				after: timeout,
			}
			.into());
		}
		tokio::time::sleep(Duration::from_millis(250)).await;
	}
}

/// Wait for `document.readyState == "complete"` (bounded by `max`), then give the UI `settle` to finish its scripts.
///
/// Returns whether the ready state was actually observed; a `false` is logged but not an error.
pub async fn wait_for_settle(page: &Page, max: Duration, settle: Duration) -> bool {
	let start = Instant::now();
	let ready = loop {
		let state = page.evaluate("document.readyState").await.ok().and_then(|r| r.value().and_then(|v| v.as_str().map(str::to_string)));
		if state.as_deref() == Some("complete") {
			break true;
		}
		if start.elapsed() >= max {
			break false;
		}
		tokio::time::sleep(Duration::from_millis(200)).await;
	};
	if !ready {
		elog!("Page did not report readyState=complete within {:?}, continuing", max);
	}
	tokio::time::sleep(settle).await;
	ready
}

pub async fn current_url(page: &Page) -> String {
	page.url().await.ok().flatten().unwrap_or_default()
}

/// Log the text/attributes of the first `limit` elements matching `selector`, for diagnosing a cascade miss
pub async fn dump_candidates(page: &Page, selector: &str, attrs: &[&str], limit: usize) {
	let Ok(elements) = page.find_elements(selector).await else {
		return;
	};
	log!("Found {} elements matching {}", elements.len(), selector);
	for (i, element) in elements.iter().take(limit).enumerate() {
		let text = text_of(element).await.unwrap_or_default();
		let mut described = Vec::new();
		for attr in attrs {
			if let Ok(Some(value)) = element.attribute(*attr).await {
				described.push(format!("{attr}=\"{}\"", value.chars().take(50).collect::<String>()));
			}
		}
		if !text.is_empty() || !described.is_empty() {
			log!("  {i}: text=\"{}\" {}", text.chars().take(60).collect::<String>(), described.join(" "));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn locators_display_like_selectors() {
		assert_eq!(Locator::text("הקודם").to_string(), r#"text="הקודם""#);
		assert_eq!(Locator::has_text("a", "<").to_string(), r#"a:has-text("<")"#);
		assert_eq!(Locator::attr("title", "previous").to_string(), r#"[title*="previous"]"#);
		assert_eq!(Locator::css(".prev-month").to_string(), ".prev-month");
		assert_eq!(Locator::value("שמור").to_string(), r#"input[value*="שמור"]"#);
	}

	#[test]
	fn resolve_script_embeds_escaped_literals() {
		let script = Locator::text(r#"say "hi" \ bye"#).resolve_script("7", true);
		assert!(script.trim_start().starts_with("(function(locator, mark, visibleOnly)"));
		assert!(script.ends_with(r#"({"kind":"exact_text","scope":"*","text":"say \"hi\" \\ bye"}, "7", true)"#));
	}

	#[test]
	fn resolve_script_respects_visibility_flag() {
		let script = Locator::css("a").resolve_script("1", false);
		assert!(script.ends_with(r#"({"kind":"css","selector":"a"}, "1", false)"#));
	}

	#[test]
	fn hidden_matches_are_opt_in() {
		let cascade = Cascade::new("report button", vec![Locator::text("x")]);
		assert!(cascade.visible_only);
		let cascade = cascade.including_hidden();
		assert!(!cascade.visible_only);
		assert_eq!(cascade.target(), "report button");
	}
}
