pub mod conclusion;
pub mod event;
pub mod model;
pub mod rules;
pub mod tier;

pub use conclusion::*;
pub use event::*;
pub use model::*;
pub use rules::*;
pub use tier::*;
