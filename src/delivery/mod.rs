//! Fan-out delivery of a run's final artifact.
//!
//! Each configured channel receives the same artifact on its own task, so one
//! slow, failing or panicking channel cannot hold up or hide the others.
//!
//! ## Usage
//!
//! ```no_run
//! use conductor::delivery::{DeliveryConfig, DeliveryFanOut, FnChannel, DeliveryChannel};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let console: Arc<dyn DeliveryChannel> = Arc::new(FnChannel::new("console", |artifact| async move {
//!     println!("{artifact}");
//!     Ok("printed".to_string())
//! }));
//!
//! let report = DeliveryFanOut::new(DeliveryConfig::default())
//!     .dispatch(&json!({"alert": "frost"}), &[console])
//!     .await;
//! assert!(!report.any_failed);
//! # }
//! ```

pub mod channel;
pub mod dispatcher;

pub use channel::{DeliveryChannel, FnChannel, RetryingChannel};
pub use dispatcher::{DeliveryConfig, DeliveryFanOut, DeliveryReport, DeliveryResult};
