mod backend;
mod logging;
mod session_log;
mod settings;
mod store;

pub use backend::*;
pub use logging::*;
pub use session_log::*;
pub use settings::*;
pub use store::*;
