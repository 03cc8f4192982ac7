pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CallflowConfig;
pub use error::{CallflowError, Result};
pub use events::DomainEvent;
pub use store::CallflowStore;
pub use types::*;
