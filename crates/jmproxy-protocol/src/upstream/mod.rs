pub mod completion;
pub mod session;

pub use completion::CompletionRequest;
pub use session::{BackendEnvelope, DeleteSessionRequest, SaveSessionRequest, SessionId};
