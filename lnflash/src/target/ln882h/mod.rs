//! LN882H support.

pub mod protocol;
pub mod session;

pub use protocol::{Command, FlashBlock, FlashRegion};
pub use session::{BootloaderSession, SessionConfig, SessionState};
