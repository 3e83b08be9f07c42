// Casework - human-gated consulting analysis pipeline
// Library exports

pub mod agents;
pub mod config;
pub mod deliverables;
pub mod error;
pub mod llm;
pub mod parse;
pub mod pipeline;
pub mod rag;
pub mod scenario;
pub mod server;
pub mod stage;
pub mod store;
