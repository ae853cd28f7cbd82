pub mod time;

pub use time::TimeNormalizer;
