//! Terminal rendering for runs started from the CLI.

pub mod icons;
pub mod progress;

pub use progress::{RunUI, UiMode, format_duration};
