use bytes::Bytes;
use serde::Serialize;

use jmproxy_protocol::openai::chat_completions::{
    ChatCompletionChunk, ChatCompletionChunkObjectType, ChatCompletionFinishReason,
    ChatCompletionStreamChoice, ChatCompletionStreamDelta,
};
use jmproxy_protocol::sse::{BackendFrame, parse_frame};

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

pub fn sse_json_bytes<T: Serialize>(value: &T) -> Option<Bytes> {
    let payload = serde_json::to_vec(value).ok()?;
    let mut data = Vec::with_capacity(payload.len() + 8);
    data.extend_from_slice(b"data: ");
    data.extend_from_slice(&payload);
    data.extend_from_slice(b"\n\n");
    Some(Bytes::from(data))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslateStats {
    pub text: u64,
    pub skipped: u64,
    pub malformed: u64,
}

/// Re-frames backend lines as chat-completion chunks.
///
/// Every text delta becomes one `data: <chunk>\n\n` frame; blank, control,
/// sentinel, non-text and malformed frames produce nothing. `finish` emits
/// the terminal `finish_reason: "stop"` chunk and the `[DONE]` sentinel
/// exactly once; anything fed after that is ignored.
#[derive(Debug, Clone)]
pub struct ChatStreamTranslator {
    id_prefix: String,
    model: String,
    created: i64,
    next_seq: u64,
    finished: bool,
    stats: TranslateStats,
}

impl ChatStreamTranslator {
    pub fn new(id_prefix: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id_prefix: id_prefix.into(),
            model: model.into(),
            created,
            next_seq: 0,
            finished: false,
            stats: TranslateStats::default(),
        }
    }

    pub fn stats(&self) -> TranslateStats {
        self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn translate_line(&mut self, line: &str) -> Option<Bytes> {
        self.translate_frame(parse_frame(line))
    }

    pub fn translate_frame(&mut self, frame: BackendFrame) -> Option<Bytes> {
        if self.finished {
            return None;
        }
        match frame {
            BackendFrame::Text(text) => {
                self.stats.text += 1;
                let chunk = self.chunk(
                    ChatCompletionStreamDelta {
                        content: Some(text),
                    },
                    None,
                );
                sse_json_bytes(&chunk)
            }
            BackendFrame::Malformed(_) => {
                self.stats.malformed += 1;
                None
            }
            BackendFrame::NonText(_) => {
                self.stats.skipped += 1;
                None
            }
            BackendFrame::Blank | BackendFrame::Control | BackendFrame::Done => None,
        }
    }

    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let terminal = self.chunk(
            ChatCompletionStreamDelta::default(),
            Some(ChatCompletionFinishReason::Stop),
        );
        let mut frames = Vec::with_capacity(2);
        if let Some(bytes) = sse_json_bytes(&terminal) {
            frames.push(bytes);
        }
        frames.push(Bytes::from_static(DONE_FRAME));
        frames
    }

    fn chunk(
        &mut self,
        delta: ChatCompletionStreamDelta,
        finish_reason: Option<ChatCompletionFinishReason>,
    ) -> ChatCompletionChunk {
        let id = format!("{}-{}", self.id_prefix, self.next_seq);
        self.next_seq += 1;
        ChatCompletionChunk {
            id,
            object: ChatCompletionChunkObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatCompletionStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}
