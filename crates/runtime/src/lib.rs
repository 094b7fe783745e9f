pub mod clock;
pub mod frame;
pub mod scheduler;

pub use clock::*;
pub use frame::*;
pub use scheduler::*;
