pub mod compile;

pub use compile::*;
