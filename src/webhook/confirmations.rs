use std::{
	collections::HashMap,
	time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A messaging-channel reply to "run the timesheet now?"
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConfirmation {
	pub confirmed: bool,
	pub response: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub phone_number: Option<String>,
	pub timestamp: DateTime<Utc>,
}

impl PendingConfirmation {
	/// Any reply containing "yes" (case-insensitive) confirms
	pub fn from_reply(response: impl Into<String>, phone_number: Option<String>) -> Self {
		let response = response.into();
		Self {
			confirmed: response.to_lowercase().contains("yes"),
			response,
			phone_number,
			timestamp: Utc::now(),
		}
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConfirmationError {
	#[error("Confirmation not received or expired")]
	NotFound,
	#[error("Confirmation was declined")]
	Declined,
}

struct Entry {
	confirmation: PendingConfirmation,
	stored_at: Instant,
}

/// Confirmations keyed by id, each valid for `ttl` after it was stored
pub struct ConfirmationStore {
	entries: RwLock<HashMap<String, Entry>>,
	ttl: Duration,
}

impl ConfirmationStore {
	pub fn new(ttl: Duration) -> Self {
		Self {
			entries: RwLock::new(HashMap::new()),
			ttl,
		}
	}

	fn is_expired(&self, entry: &Entry) -> bool {
		entry.stored_at.elapsed() >= self.ttl
	}

	/// Store (or replace) a confirmation. Expired entries are dropped on the way.
	pub async fn insert(&self, id: impl Into<String>, confirmation: PendingConfirmation) {
		let mut entries = self.entries.write().await;
		entries.retain(|_, entry| !self.is_expired(entry));
		entries.insert(
			id.into(),
			Entry {
				confirmation,
				stored_at: Instant::now(),
			},
		);
	}

	pub async fn get(&self, id: &str) -> Option<PendingConfirmation> {
		let entries = self.entries.read().await;
		entries.get(id).filter(|entry| !self.is_expired(entry)).map(|entry| entry.confirmation.clone())
	}

	/// Consume a confirmed entry. A declined one stays in place, so a later "yes" can replace it.
	pub async fn take_confirmed(&self, id: &str) -> Result<PendingConfirmation, ConfirmationError> {
		let mut entries = self.entries.write().await;
		let Some(entry) = entries.get(id) else {
			return Err(ConfirmationError::NotFound);
		};
		if self.is_expired(entry) {
			entries.remove(id);
			return Err(ConfirmationError::NotFound);
		}
		if !entry.confirmation.confirmed {
			return Err(ConfirmationError::Declined);
		}
		entries.remove(id).map(|entry| entry.confirmation).ok_or(ConfirmationError::NotFound)
	}

	/// Returns how many entries were dropped
	pub async fn purge_expired(&self) -> usize {
		let mut entries = self.entries.write().await;
		let before = entries.len();
		entries.retain(|_, entry| !self.is_expired(entry));
		before - entries.len()
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn yes_anywhere_in_reply_confirms() {
		assert!(PendingConfirmation::from_reply("Yes please", None).confirmed);
		assert!(PendingConfirmation::from_reply("YES", None).confirmed);
		assert!(!PendingConfirmation::from_reply("no", Some("+972500000000".into())).confirmed);
	}

	#[tokio::test]
	async fn confirmed_entry_is_consumed_once() {
		let store = ConfirmationStore::new(Duration::from_secs(60));
		store.insert("abc", PendingConfirmation::from_reply("yes", None)).await;

		assert!(store.get("abc").await.is_some());
		assert!(store.take_confirmed("abc").await.is_ok());
		assert_eq!(store.take_confirmed("abc").await, Err(ConfirmationError::NotFound));
		assert!(store.is_empty().await);
	}

	#[tokio::test]
	async fn declined_entry_is_kept_but_refused() {
		let store = ConfirmationStore::new(Duration::from_secs(60));
		store.insert("abc", PendingConfirmation::from_reply("no thanks", None)).await;

		assert_eq!(store.take_confirmed("abc").await, Err(ConfirmationError::Declined));
		assert_eq!(store.len().await, 1);

		store.insert("abc", PendingConfirmation::from_reply("ok yes", None)).await;
		assert!(store.take_confirmed("abc").await.is_ok());
	}

	#[tokio::test]
	async fn expired_entries_are_invisible_and_purged() {
		let store = ConfirmationStore::new(Duration::ZERO);
		store.insert("old", PendingConfirmation::from_reply("yes", None)).await;

		assert!(store.get("old").await.is_none());
		assert_eq!(store.take_confirmed("old").await, Err(ConfirmationError::NotFound));

		store.insert("older", PendingConfirmation::from_reply("yes", None)).await;
		assert_eq!(store.purge_expired().await, 1);
		assert!(store.is_empty().await);
	}

	#[tokio::test]
	async fn unknown_id_is_not_found() {
		let store = ConfirmationStore::new(Duration::from_secs(60));
		assert_eq!(store.take_confirmed("nope").await, Err(ConfirmationError::NotFound));
	}
}
