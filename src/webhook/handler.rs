//! HTTP endpoints for triggering a run from an automation platform or a messaging confirmation flow.

use std::sync::Arc;

use axum::{
	Router,
	body::Bytes,
	extract::{Path, State},
	http::StatusCode,
	response::Json,
	routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{
	confirmations::{ConfirmationStore, PendingConfirmation},
	executor::{AutomationExecutor, ExecutionOutput},
};
use crate::report::RunReport;

type ErrorResponse = (StatusCode, Json<Value>);

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
	pub confirmations: Arc<ConfirmationStore>,
	pub executor: Arc<dyn AutomationExecutor>,
}

impl WebhookState {
	pub fn new(confirmations: ConfirmationStore, executor: impl AutomationExecutor + 'static) -> Self {
		Self {
			confirmations: Arc::new(confirmations),
			executor: Arc::new(executor),
		}
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRequest {
	pub trigger: Option<Value>,
	pub timestamp: Option<String>,
	pub source: Option<String>,
	pub confirmation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRequest {
	pub confirmation_id: Option<String>,
	pub response: Option<String>,
	pub phone_number: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationResponse {
	pub success: bool,
	pub message: String,
	pub timestamp: DateTime<Utc>,
	pub output: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub excel_file: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub excel_data: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub excel_size: Option<u64>,
	/// The run report the child printed, if it got far enough to print one
	#[serde(skip_serializing_if = "Option::is_none")]
	pub report: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub source: Option<String>,
}

impl AutomationResponse {
	fn from_output(output: ExecutionOutput, source: Option<String>) -> Self {
		let report = RunReport::extract_from_output(&output.stdout);
		let (excel_file, excel_data, excel_size) = match output.excel {
			Some(file) => (Some(file.name), Some(file.data), Some(file.size)),
			None => (None, None, None),
		};
		Self {
			success: true,
			message: "Hilan automation completed successfully".to_string(),
			timestamp: Utc::now(),
			output: output.stdout,
			excel_file,
			excel_data,
			excel_size,
			report,
			source,
		}
	}
}

/// Create the webhook router
pub fn webhook_router(state: WebhookState) -> Router {
	Router::new()
		.route("/health", get(health_check))
		.route("/trigger", post(manual_trigger))
		.route("/webhook/hilan-automation", post(automation_webhook))
		.route("/webhook/whatsapp-confirmation", post(whatsapp_confirmation))
		.route("/confirmation/{id}", get(confirmation_status))
		.with_state(state)
}

async fn health_check() -> Json<Value> {
	Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

async fn manual_trigger(State(state): State<WebhookState>) -> Result<Json<AutomationResponse>, ErrorResponse> {
	info!("Manual trigger received");
	run_automation(&state, None).await
}

async fn automation_webhook(State(state): State<WebhookState>, body: Bytes) -> Result<Json<AutomationResponse>, ErrorResponse> {
	// Some platforms post an empty body
	let request: AutomationRequest = if body.iter().all(u8::is_ascii_whitespace) {
		AutomationRequest::default()
	} else {
		serde_json::from_slice(&body).map_err(|e| bad_request(format!("Invalid request body: {e}")))?
	};
	info!(source = ?request.source, confirmation_id = ?request.confirmation_id, trigger = ?request.trigger, "Webhook received");

	if request.source.as_deref() == Some("whatsapp") {
		let Some(id) = request.confirmation_id.as_deref() else {
			warn!("whatsapp trigger without confirmationId");
			return Err(bad_request("Missing confirmationId for whatsapp trigger"));
		};
		if let Err(e) = state.confirmations.take_confirmed(id).await {
			warn!(confirmation_id = %id, error = %e, "whatsapp trigger refused");
			return Err((
				StatusCode::BAD_REQUEST,
				Json(json!({ "success": false, "error": e.to_string(), "confirmationId": id })),
			));
		}
	}

	let source = request.source.unwrap_or_else(|| "direct".to_string());
	run_automation(&state, Some(source)).await
}

async fn run_automation(state: &WebhookState, source: Option<String>) -> Result<Json<AutomationResponse>, ErrorResponse> {
	match state.executor.execute().await {
		Ok(output) => {
			info!(source = ?source, excel = ?output.excel.as_ref().map(|f| &f.name), "Hilan automation executed successfully");
			Ok(Json(AutomationResponse::from_output(output, source)))
		}
		Err(failure) => {
			warn!(source = ?source, error = %failure, "Hilan automation failed");
			Err((
				StatusCode::INTERNAL_SERVER_ERROR,
				Json(json!({
					"success": false,
					"error": failure.to_string(),
					"stdout": failure.stdout(),
					"stderr": failure.stderr(),
				})),
			))
		}
	}
}

async fn whatsapp_confirmation(State(state): State<WebhookState>, Json(request): Json<ConfirmationRequest>) -> Result<Json<Value>, ErrorResponse> {
	let (Some(id), Some(response)) = (request.confirmation_id, request.response) else {
		return Err(bad_request("Missing confirmationId or response"));
	};
	info!(confirmation_id = %id, %response, "WhatsApp confirmation received");

	let confirmation = PendingConfirmation::from_reply(response, request.phone_number);
	let confirmed = confirmation.confirmed;
	state.confirmations.insert(id.clone(), confirmation).await;

	Ok(Json(json!({
		"success": true,
		"message": "Confirmation stored",
		"confirmed": confirmed,
		"confirmationId": id,
	})))
}

async fn confirmation_status(State(state): State<WebhookState>, Path(id): Path<String>) -> Result<Json<Value>, ErrorResponse> {
	match state.confirmations.get(&id).await {
		Some(confirmation) => Ok(Json(json!({ "success": true, "confirmation": confirmation }))),
		None => Err((
			StatusCode::NOT_FOUND,
			Json(json!({ "success": false, "error": "Confirmation not found or expired" })),
		)),
	}
}

fn bad_request(error: impl Into<String>) -> ErrorResponse {
	(StatusCode::BAD_REQUEST, Json(json!({ "success": false, "error": error.into() })))
}

#[cfg(test)]
mod tests {
	use std::{
		sync::atomic::{AtomicUsize, Ordering},
		time::Duration,
	};

	use async_trait::async_trait;
	use axum::{body::Body, http::Request};
	use tower::ServiceExt;

	use super::*;
	use crate::webhook::executor::{ExcelFile, ExecutionFailure};

	#[derive(Clone)]
	struct CountingExecutor {
		calls: Arc<AtomicUsize>,
		fail: bool,
	}

	#[async_trait]
	impl AutomationExecutor for CountingExecutor {
		async fn execute(&self) -> Result<ExecutionOutput, ExecutionFailure> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			if self.fail {
				return Err(ExecutionFailure::Exited {
					code: Some(1),
					stdout: "Starting...\n".into(),
					stderr: "Failed to launch browser\n".into(),
				});
			}
			Ok(ExecutionOutput {
				stdout: "Starting...\nrun report: {\"rows\":{\"filled\":20,\"skipped\":3,\"failed\":0}}\n".into(),
				stderr: String::new(),
				excel: Some(ExcelFile {
					name: "report.xlsx".into(),
					size: 4,
					data: "UEsDBA==".into(),
				}),
			})
		}
	}

	fn app(fail: bool) -> (Router, Arc<AtomicUsize>) {
		let calls = Arc::new(AtomicUsize::new(0));
		let executor = CountingExecutor { calls: Arc::clone(&calls), fail };
		let state = WebhookState::new(ConfirmationStore::new(Duration::from_secs(60)), executor);
		(webhook_router(state), calls)
	}

	fn post_json(uri: &str, body: &str) -> Request<Body> {
		Request::builder()
			.method("POST")
			.uri(uri)
			.header("Content-Type", "application/json")
			.body(Body::from(body.to_string()))
			.unwrap()
	}

	async fn body_json(response: axum::response::Response) -> Value {
		let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
		serde_json::from_slice(&body).unwrap()
	}

	#[tokio::test]
	async fn health_reports_ok() {
		let (app, _) = app(false);
		let response = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(body_json(response).await["status"], "ok");
	}

	#[tokio::test]
	async fn whatsapp_trigger_with_unknown_confirmation_never_runs() {
		let (app, calls) = app(false);
		let response = app
			.oneshot(post_json("/webhook/hilan-automation", r#"{"source": "whatsapp", "confirmationId": "nope"}"#))
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		let body = body_json(response).await;
		assert_eq!(body["success"], false);
		assert_eq!(body["confirmationId"], "nope");
		assert_eq!(calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn whatsapp_trigger_without_confirmation_id_never_runs() {
		let (app, calls) = app(false);
		let response = app.oneshot(post_json("/webhook/hilan-automation", r#"{"source": "whatsapp"}"#)).await.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		assert_eq!(calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn declined_confirmation_never_runs() {
		let (app, calls) = app(false);
		let response = app
			.clone()
			.oneshot(post_json("/webhook/whatsapp-confirmation", r#"{"confirmationId": "c1", "response": "no"}"#))
			.await
			.unwrap();
		assert_eq!(body_json(response).await["confirmed"], false);

		let response = app
			.oneshot(post_json("/webhook/hilan-automation", r#"{"source": "whatsapp", "confirmationId": "c1"}"#))
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		assert_eq!(calls.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn confirmed_trigger_runs_once_and_consumes_confirmation() {
		let (app, calls) = app(false);
		let response = app
			.clone()
			.oneshot(post_json("/webhook/whatsapp-confirmation", r#"{"confirmationId": "c1", "response": "Yes!", "phoneNumber": "+972"}"#))
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		let body = body_json(response).await;
		assert_eq!(body["confirmed"], true);
		assert_eq!(body["confirmationId"], "c1");

		let response = app
			.clone()
			.oneshot(post_json("/webhook/hilan-automation", r#"{"source": "whatsapp", "confirmationId": "c1"}"#))
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		let body = body_json(response).await;
		assert_eq!(body["success"], true);
		assert_eq!(body["source"], "whatsapp");
		assert_eq!(body["excelFile"], "report.xlsx");
		assert_eq!(body["excelSize"], 4);
		assert_eq!(body["report"]["rows"]["filled"], 20);
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		let response = app
			.oneshot(post_json("/webhook/hilan-automation", r#"{"source": "whatsapp", "confirmationId": "c1"}"#))
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn direct_webhook_defaults_source_and_accepts_empty_body() {
		let (app, calls) = app(false);
		let response = app.oneshot(post_json("/webhook/hilan-automation", "")).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(body_json(response).await["source"], "direct");
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn confirmation_missing_response_is_rejected() {
		let (app, _) = app(false);
		let response = app.oneshot(post_json("/webhook/whatsapp-confirmation", r#"{"confirmationId": "c1"}"#)).await.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn confirmation_status_lookup() {
		let (app, _) = app(false);
		let response = app.clone().oneshot(Request::builder().uri("/confirmation/unknown").body(Body::empty()).unwrap()).await.unwrap();
		assert_eq!(response.status(), StatusCode::NOT_FOUND);

		app.clone()
			.oneshot(post_json("/webhook/whatsapp-confirmation", r#"{"confirmationId": "c2", "response": "yes"}"#))
			.await
			.unwrap();
		let response = app.oneshot(Request::builder().uri("/confirmation/c2").body(Body::empty()).unwrap()).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		let body = body_json(response).await;
		assert_eq!(body["confirmation"]["confirmed"], true);
		assert_eq!(body["confirmation"]["response"], "yes");
	}

	#[tokio::test]
	async fn executor_failure_is_500_with_output() {
		let (app, calls) = app(true);
		let response = app.oneshot(post_json("/trigger", "")).await.unwrap();
		assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
		let body = body_json(response).await;
		assert_eq!(body["success"], false);
		assert_eq!(body["stderr"], "Failed to launch browser\n");
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
