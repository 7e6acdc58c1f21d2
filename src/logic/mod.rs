pub mod diff;
pub mod flags;
pub mod resolution;
pub mod sync;

pub use diff::*;
pub use flags::*;
pub use resolution::*;
pub use sync::*;
