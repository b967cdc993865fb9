pub mod checkpoint;
pub mod config;
pub mod error;
pub mod observability;
pub mod server;
pub mod waf;

pub use config::Config;
pub use error::{Result, WafError};
pub use waf::{Action, Decision, DecisionPipeline, RequestRecord};
