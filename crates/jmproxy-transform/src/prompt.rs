use std::borrow::Cow;

use jmproxy_protocol::openai::chat_completions::ChatMessage;

/// Flattens a chat history into the single text blob the backend accepts.
///
/// Each message becomes `"<Role>: <content>"`; `system` messages are emitted
/// without a label. Messages are separated by a blank line. Any message longer
/// than `ceiling` characters keeps its first and last `ceiling / 2` characters
/// and has the middle replaced by an elision marker.
#[derive(Debug, Clone)]
pub struct PromptCompiler {
    ceiling: usize,
}

impl PromptCompiler {
    pub fn new(ceiling: usize) -> Self {
        Self { ceiling }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn compile(&self, messages: &[ChatMessage]) -> String {
        messages
            .iter()
            .map(|message| self.render(message))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn render(&self, message: &ChatMessage) -> String {
        let text = message.text();
        let content = elide_middle(&text, self.ceiling);
        match role_label(&message.role) {
            Some(label) => format!("{label}: {content}"),
            None => content.into_owned(),
        }
    }
}

/// Marker inserted where `elided` characters were removed.
pub fn elision_marker(elided: usize) -> String {
    format!("\n[... {elided} characters elided ...]\n")
}

/// Lengths are counted in chars, never bytes, so slicing stays on char boundaries.
pub fn elide_middle(content: &str, ceiling: usize) -> Cow<'_, str> {
    let total = content.chars().count();
    if total <= ceiling {
        return Cow::Borrowed(content);
    }

    let keep = ceiling / 2;
    let elided = total - keep * 2;
    let head_end = byte_offset(content, keep);
    let tail_start = byte_offset(content, total - keep);

    let marker = elision_marker(elided);
    let mut out = String::with_capacity(head_end + marker.len() + content.len() - tail_start);
    out.push_str(&content[..head_end]);
    out.push_str(&marker);
    out.push_str(&content[tail_start..]);
    Cow::Owned(out)
}

fn byte_offset(content: &str, chars: usize) -> usize {
    content
        .char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(content.len())
}

fn role_label(role: &str) -> Option<String> {
    let role = role.trim();
    if role.eq_ignore_ascii_case("system") {
        return None;
    }
    let mut chars = role.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().chain(chars).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_user_message() {
        let compiler = PromptCompiler::new(1500);
        assert_eq!(compiler.compile(&[ChatMessage::new("user", "hi")]), "User: hi");
    }

    #[test]
    fn system_has_no_label_and_messages_are_blank_line_separated() {
        let compiler = PromptCompiler::new(1500);
        let prompt = compiler.compile(&[
            ChatMessage::new("system", "Be brief."),
            ChatMessage::new("user", "hi"),
            ChatMessage::new("assistant", "hello"),
        ]);
        assert_eq!(prompt, "Be brief.\n\nUser: hi\n\nAssistant: hello");
    }

    #[test]
    fn short_content_is_borrowed() {
        assert!(matches!(elide_middle("abc", 3), Cow::Borrowed("abc")));
    }

    #[test]
    fn long_content_keeps_head_and_tail() {
        let content: String = (0..2000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let out = elide_middle(&content, 1500);
        let marker = elision_marker(500);
        assert!(out.chars().count() <= 1500 + marker.chars().count());
        assert!(out.starts_with(&content[..750]));
        assert!(out.ends_with(&content[1250..]));
        assert!(out.contains(&marker));
    }

    #[test]
    fn each_long_message_gets_its_own_marker() {
        let first = "x".repeat(750) + &"m".repeat(500) + &"y".repeat(750);
        let second = "p".repeat(750) + &"q".repeat(500) + &"r".repeat(750);
        let compiler = PromptCompiler::new(1500);
        let prompt = compiler.compile(&[
            ChatMessage::new("user", first),
            ChatMessage::new("assistant", second),
        ]);

        let marker = elision_marker(500);
        assert_eq!(prompt.matches(&marker).count(), 2);
        assert_eq!(
            prompt,
            format!(
                "User: {}{marker}{}\n\nAssistant: {}{marker}{}",
                "x".repeat(750),
                "y".repeat(750),
                "p".repeat(750),
                "r".repeat(750)
            )
        );
        assert!(!prompt.contains('m') && !prompt.contains('q'));
    }

    #[test]
    fn odd_ceiling_rounds_down_on_both_sides() {
        let out = elide_middle("abcdefghij", 5);
        assert_eq!(out, format!("ab{}ij", elision_marker(6)));
    }

    #[test]
    fn multibyte_content_is_sliced_by_char() {
        let content = "你好世界和平万岁";
        let out = elide_middle(content, 4);
        assert_eq!(out, format!("你好{}万岁", elision_marker(4)));
    }

    #[test]
    fn unknown_roles_are_capitalized() {
        let compiler = PromptCompiler::new(100);
        assert_eq!(compiler.compile(&[ChatMessage::new("tool", "ok")]), "Tool: ok");
    }
}
