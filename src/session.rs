use std::path::PathBuf;

use chromiumoxide::{
	Page,
	browser::{Browser, BrowserConfig},
	cdp::browser_protocol::{
		browser::{SetDownloadBehaviorBehavior, SetDownloadBehaviorParams},
		target::{CreateBrowserContextParams, CreateTargetParams},
	},
};
use color_eyre::{Result, eyre::eyre};
use futures::StreamExt;
use tokio::task::JoinHandle;
use v_utils::{elog, log};

use crate::config::AppConfig;

/// One browser, one isolated context, one page. Lives for exactly one run.
pub struct Session {
	pub browser: Browser,
	pub page: Page,
	/// Absolute path downloads are routed into
	pub downloads_dir: PathBuf,
	handler: JoinHandle<()>,
}

impl Session {
	pub async fn launch(config: &AppConfig) -> Result<Self> {
		log!("Visible mode: {}", config.visible);

		let builder = BrowserConfig::builder().window_size(1366, 900).arg("--no-sandbox").arg("--disable-dev-shm-usage");
		// Configure browser based on visibility flag
		let builder = if config.visible { builder.with_head() } else { builder };
		let browser_config = builder.build().map_err(|e| eyre!("Failed to build browser config: {}", e))?;

		let (browser, mut handler) = Browser::launch(browser_config).await.map_err(|e| eyre!("Failed to launch browser: {}", e))?;

		// Spawn a task to handle browser events (suppress errors as they're mostly noise)
		let handler = tokio::spawn(async move {
			while let Some(_event) = handler.next().await {
				// Silently consume events to prevent the browser from hanging
			}
		});

		let context_id = browser
			.create_browser_context(CreateBrowserContextParams::default())
			.await
			.map_err(|e| eyre!("Failed to create browser context: {}", e))?;

		let target = CreateTargetParams::builder()
			.url("about:blank")
			.browser_context_id(context_id.clone())
			.build()
			.map_err(|e| eyre!("Failed to build page target: {}", e))?;
		let page = browser.new_page(target).await.map_err(|e| eyre!("Failed to create new page: {}", e))?;

		std::fs::create_dir_all(&config.downloads_dir).map_err(|e| eyre!("Failed to create downloads dir {}: {}", config.downloads_dir.display(), e))?;
		let downloads_dir = std::fs::canonicalize(&config.downloads_dir).map_err(|e| eyre!("Failed to resolve downloads dir: {}", e))?;

		let download_params = SetDownloadBehaviorParams::builder()
			.behavior(SetDownloadBehaviorBehavior::Allow)
			.browser_context_id(context_id)
			.download_path(downloads_dir.to_string_lossy().to_string())
			.events_enabled(true)
			.build()
			.map_err(|e| eyre!("Failed to build download params: {}", e))?;
		page.execute(download_params).await.map_err(|e| eyre!("Failed to set download behavior: {}", e))?;
		log!("Download directory set to: {}", downloads_dir.display());

		Ok(Self {
			browser,
			page,
			downloads_dir,
			handler,
		})
	}

	/// Pages other than the main one
	pub async fn extra_pages(&mut self) -> Vec<Page> {
		let _ = self.browser.fetch_targets().await;
		let main = self.page.target_id().clone();
		self.browser.pages().await.unwrap_or_default().into_iter().filter(|p| *p.target_id() != main).collect()
	}

	pub async fn close(mut self) {
		if let Err(e) = self.browser.close().await {
			elog!("Failed to close browser: {}", e);
		}
		let _ = self.browser.wait().await;
		self.handler.abort();
	}
}
