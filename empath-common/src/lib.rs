pub mod logging;
pub mod signal;

pub use signal::Signal;
pub use tracing;
