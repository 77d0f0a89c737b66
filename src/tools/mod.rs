pub mod executor;
pub mod handoff;
pub mod registry;
pub mod schema;
pub mod think;

pub use executor::ToolExecutor;
pub use handoff::{HandoffInput, HandoffTool};
pub use registry::{Tool, ToolRegistry};
pub use schema::tool_call_schema_json;
pub use think::{ThinkInput, ThinkTool};
