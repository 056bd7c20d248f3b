pub mod logging;
pub mod timestamp;

pub use logging::truncate_text;
pub use timestamp::{parse_timestamp, SENTINEL};
