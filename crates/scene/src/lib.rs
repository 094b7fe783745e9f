pub mod interpolate;
pub mod live;
pub mod trip;

pub use interpolate::*;
pub use live::*;
pub use trip::*;
