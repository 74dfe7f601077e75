mod log;
mod messages;
mod session_state;

pub use log::*;
pub use messages::*;
pub use session_state::*;
