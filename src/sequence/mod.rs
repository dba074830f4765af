//! Sequence authoring: parameter ranges, measurement points and the sequence
//! definition that ties them to the plugins to run.
//!
//! # Lifecycle
//!
//! ```text
//! SequenceDefinition::new
//!    │
//!    ├── add_parameter_range (1+)
//!    │
//!    ├── generate_points  → Cartesian product, Point_1..Point_N
//!    │
//!    ├── save_to_file / load_from_file (JSON document)
//!    │
//!    └── handed to RunEngine::start (read-mostly during the run)
//! ```

pub mod definition;
pub mod point;
pub mod range;

pub use definition::SequenceDefinition;
pub use point::MeasurementPoint;
pub use range::ParameterRange;
