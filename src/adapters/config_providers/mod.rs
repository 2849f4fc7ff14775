pub mod file;
pub mod http;

pub use file::FileConfigProvider;
pub use http::HttpConfigProvider;
