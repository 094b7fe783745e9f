pub mod geodesy;
pub mod polyline;

pub use geodesy::*;
pub use polyline::*;
