pub mod radius;

pub use radius::{RadiusClient, RadiusError};
