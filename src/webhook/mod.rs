//! Webhook server: lets an automation platform (or a messaging bot, after an explicit confirmation) trigger a run.
//!
//! Each accepted trigger runs the automation as a child process of this same binary. The response carries the child's
//! stdout, the parsed run report, and the exported Excel file (base64) when one was produced.

pub mod confirmations;
pub mod executor;
pub mod handler;
pub mod server;

pub use confirmations::{ConfirmationError, ConfirmationStore, PendingConfirmation};
pub use executor::{AutomationExecutor, ExcelFile, ExecutionFailure, ExecutionOutput, ProcessExecutor};
pub use handler::{WebhookState, webhook_router};
pub use server::{ServeArgs, serve};
