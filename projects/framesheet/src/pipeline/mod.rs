// Sprite sheet pipeline: sampling, normalization, layout and composition

pub mod atlas;
pub mod error;
pub mod layout;
pub mod normalize;
pub mod orchestrator;
pub mod params;
pub mod sampler;
