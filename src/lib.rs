// Character-level network that learns online from streamed text, widens its
// hidden layer as it reads, and consolidates itself during sleep.

pub mod brain;
pub mod common;
pub mod config;
pub mod corpus;
pub mod error;
pub mod growth;
pub mod maintenance;
pub mod model;
pub mod model_loader;
pub mod params;
pub mod runtime_interface;
pub mod text_generator;
pub mod tokenizer;
pub mod training;

pub use brain::{Brain, BrainStats};
pub use config::{GenerationConfig, NetConfig};
pub use error::{NetError, Result};
pub use maintenance::MaintenanceReport;
pub use model::GrowingNetwork;
pub use model_loader::{NetworkSnapshot, SnapshotFormat};
