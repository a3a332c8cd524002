pub mod checkpoint;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod trainer;
