pub mod data;
pub mod error;
pub mod timeframes;
pub mod window;

pub use data::*;
pub use error::*;
pub use window::*;

pub type DataResult<T> = std::result::Result<T, error::DataError>;
pub type TimestampMs = i64;
pub type Symbol = bytestring::ByteString;
