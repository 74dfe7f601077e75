pub mod cli;
pub mod domain;
pub mod infra;
pub mod server;
pub mod util;
