pub mod analysis;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod state;
pub mod stream;
pub mod timing;
pub mod worker;
