pub mod assets;
pub mod events;
pub mod plan;
pub mod runs;
