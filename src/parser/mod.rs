// ABOUTME: Parser module for YAML task graph definitions
// ABOUTME: Exports graph parsing, validation, and definition data structures

pub mod error;
pub mod graph;
pub mod task;
pub mod validation;

pub use error::{ParserError, ValidationError};
pub use graph::{GraphDefinition, GraphHandlerDefinition, GraphMode, GraphParser, OutputBinding};
pub use task::{LinkEndpoint, TaskDefinition, TaskHandlerDefinition, OUTPUTS_SOCKET, WAIT_SOCKET};
pub use validation::{GraphValidator, ValidationReport};
