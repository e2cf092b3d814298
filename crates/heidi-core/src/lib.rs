pub mod completion;
pub mod config;
pub mod events;
pub mod prompt;
pub mod redact;
pub mod types;

pub use config::Config;
pub use redact::{redact, redact_json};
pub use types::*;
