pub mod clips;
pub mod keyframes;
pub mod summary;
