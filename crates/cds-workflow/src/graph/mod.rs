pub mod definition;
pub mod label;
pub mod model;
pub mod parser;

pub use definition::{StepDefinition, WorkflowDefinition};
pub use label::EdgeLabel;
pub use model::{Edge, Graph, END, START};
pub use parser::parse_graph;
