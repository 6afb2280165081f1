pub mod bootstrap;
pub mod cancel;

pub use cancel::{cancellation, run_until_cancelled, CancelHandle, CancelSignal};
