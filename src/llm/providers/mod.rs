//! Concrete provider clients (§6 collaborator, out of scope as a production
//! integration surface but needed to give the Gateway's fallback chain
//! something real to drive). Each client owns its own `reqwest::Client`,
//! builds its own headers, and converts its own JSON shape — grounded on the
//! teacher's per-provider client modules, trimmed of streaming, function
//! calling, and cost tracking, none of which §4.C asks for.

pub mod anthropic;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use ollama::OllamaClient;
pub use openai::OpenAIClient;
