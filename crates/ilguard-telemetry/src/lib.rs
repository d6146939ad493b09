//! Observability plumbing shared by every ILGuard component.

mod event_bus;
mod logging;

pub use event_bus::EventBus;
pub use logging::{init_logging, LoggingError};
