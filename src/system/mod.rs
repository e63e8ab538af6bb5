//! Host prerequisites and process-wide signals.
//!
//! Before anything is launched the namespace engine (and, when used, the
//! guest runtime) must be present on the search path; see
//! [`check_all`]. Keyboard interrupts are turned into a [`CancelToken`] so
//! that waits can unwind cleanly.

mod interrupt;
mod requirements;

pub use interrupt::CancelToken;
pub use requirements::{
    ENGINE_COMMAND, GUEST_RUNTIME_COMMAND, REQUIRED_ENGINE_FLAG, Requirements, check_all,
    check_engine, require_binary,
};
