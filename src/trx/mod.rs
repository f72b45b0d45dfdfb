//! Transaction handles and their state machine.

mod state;
pub use state::TrxState;

mod handle;
pub use handle::{TrxGuard, TrxHandle};
