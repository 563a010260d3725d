// Public API
pub mod config;
pub use config::Builder;

pub mod driver;
pub use driver::{destroy, init, now_ms, poll_fd, refresh_clock, run, run_once, waited_fd_count};

pub mod repeater;
pub use repeater::Repeater;

pub mod sleeper;
pub use sleeper::{Sleeper, sleep};
