//! Wire types for both sides of the proxy.
//!
//! `openai` is the inbound chat-completion protocol served to callers,
//! `upstream` is the session-oriented backend protocol, and `sse` splits the
//! backend's line-oriented event stream into frames. Nothing here performs IO.

pub mod openai;
pub mod sse;
pub mod upstream;
