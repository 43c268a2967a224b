pub mod executor;
pub mod narrative;
pub mod registry;

pub use executor::{dispatch_failure_message, ToolExecutor};
pub use narrative::{
    build_registry, memory_tools, narrative_tools, AddMemoriesTool, AddMemoryTool, CreateCharacterTool, ReadStateTool,
    StagedEdits, TurnScratch, UpdateStateTool, UpdateWorldTool,
};
pub use registry::{Tool, ToolRegistry};
