//! Checkpoint artifacts. Informational only; nothing reads them back, so failures are logged and swallowed.

use std::path::{Path, PathBuf};

use chromiumoxide::{Page, page::ScreenshotParams};
#[cfg(feature = "xdg")]
use color_eyre::{Result, eyre::eyre};
#[cfg(feature = "xdg")]
use v_utils::xdg_state_dir;
use v_utils::{elog, log};

pub async fn screenshot(page: &Page, dir: &Path, name: &str) -> Option<PathBuf> {
	let path = dir.join(name);
	if let Err(e) = std::fs::create_dir_all(dir) {
		elog!("Failed to create debug dir {}: {}", dir.display(), e);
		return None;
	}
	match page.save_screenshot(ScreenshotParams::builder().full_page(true).build(), &path).await {
		Ok(_) => {
			log!("Screenshot saved as {}", path.display());
			Some(path)
		}
		Err(e) => {
			elog!("Failed to save screenshot {}: {}", path.display(), e);
			None
		}
	}
}

/// Log URL and title, the two things worth knowing after every hop
pub async fn log_location(page: &Page, label: &str) {
	let url = page.url().await.ok().flatten().unwrap_or_default();
	let title = page.get_title().await.ok().flatten().unwrap_or_default();
	log!("{label}: url={url} title={title:?}");
}

/// Save the current page's HTML to disk for debugging
/// Uses the page URL as the filename label
#[cfg(feature = "xdg")]
pub async fn save_page_html(page: &Page, session_id: &str) -> Result<PathBuf> {
	let html_dir = xdg_state_dir!("persist_htmls").join(session_id);
	std::fs::create_dir_all(&html_dir).map_err(|e| eyre!("Failed to create HTML dir: {}", e))?;

	let url = page.url().await.ok().flatten().unwrap_or_default();
	let label = url.replace("https://", "").replace("http://", "");

	let html = page.content().await.map_err(|e| eyre!("Failed to get page HTML: {}", e))?;

	let timestamp = chrono::Local::now().format("%H%M%S%3f");
	let safe_label: String = label.chars().take(80).map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect();

	let filepath = html_dir.join(format!("{timestamp}_{safe_label}.html"));
	std::fs::write(&filepath, html).map_err(|e| eyre!("Failed to write HTML file: {}", e))?;

	log!("Saved page HTML to: {}", filepath.display());
	Ok(filepath)
}

/// Snapshot the page HTML when built with `xdg`; a no-op otherwise
#[allow(unused_variables)]
pub async fn snapshot_html(page: &Page, session_id: &str) {
	#[cfg(feature = "xdg")]
	if let Err(e) = save_page_html(page, session_id).await {
		elog!("Failed to save page HTML: {e}");
	}
}
