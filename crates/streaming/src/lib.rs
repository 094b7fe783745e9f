pub mod cache;
pub mod config;
pub mod fetch;
pub mod pipeline;
pub mod protocol;
pub mod residency;
pub mod source;
pub mod worker;

pub use cache::*;
pub use config::*;
pub use fetch::*;
pub use pipeline::*;
pub use protocol::*;
pub use residency::*;
pub use source::*;
pub use worker::*;
