mod latch;
mod time;

pub use latch::{acquire, LatchGuard};
pub use time::now_millis;
