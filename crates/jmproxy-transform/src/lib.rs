//! Pure transformations between the chat protocol and the session backend.

pub mod prompt;
pub mod stream;

pub use prompt::{PromptCompiler, elide_middle, elision_marker};
pub use stream::{ChatStreamTranslator, DONE_FRAME, TranslateStats, sse_json_bytes};
