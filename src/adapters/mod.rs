pub mod dues;
pub mod water;

pub use dues::DuesAdapter;
pub use water::WaterAdapter;
