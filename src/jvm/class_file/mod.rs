mod attribute;
mod class;
mod constants;
mod member;

pub use attribute::*;
pub use class::*;
pub use constants::*;
pub use member::*;
