pub mod desktop;
pub mod engine;
pub mod gemini;
pub mod omni;

pub use desktop::{NativeInput, NativeScreen};
pub use engine::{EngineConfig, Orchestrator, TaskOutcome};
pub use gemini::{GeminiClient, GeminiConfig};
pub use omni::{OmniClient, OmniConfig};
