pub mod placement;

pub use placement::{Assignment, PlacementScheduler, PlacementScore};
