pub mod config;
pub mod paths;
pub mod registry;

pub use config::LaunchConfig;
pub use registry::{discover, is_program_name, serialize_listing, Origin, ProgramDescriptor};
