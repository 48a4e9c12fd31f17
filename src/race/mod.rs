pub use item_policy::*;
pub use setup::*;
pub use tyres::*;
pub use world::*;

pub mod item_policy;
pub mod setup;
pub mod tyres;
pub mod world;
