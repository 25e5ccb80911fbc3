pub mod heap;
pub mod phys;

pub use phys::*;
