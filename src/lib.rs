pub mod bridge;
pub mod config;
pub mod robot;
pub mod rtcopy;
pub mod tape;
pub mod util;
pub mod test_util;
