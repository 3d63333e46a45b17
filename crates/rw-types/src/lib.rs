pub mod errors;
pub mod space;
pub mod trial;

pub use errors::*;
pub use space::*;
pub use trial::*;
