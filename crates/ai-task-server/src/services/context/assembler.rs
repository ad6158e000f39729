use super::types::Message;

const CONTEXT_OPEN: &str = "<CONTEXT>\n";
const CONTEXT_CLOSE: &str = "\n</CONTEXT>\n";

/// Renders buffered history plus a new prompt into one model-ready string.
/// Pure and lock-free.
pub struct PromptAssembler;

impl PromptAssembler {
    pub fn assemble<'a, I>(history: I, prompt: &str) -> String
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let context = history
            .into_iter()
            .map(|message| message.to_string())
            .collect::<Vec<_>>()
            .join("\n");

        let capacity = CONTEXT_OPEN.len() + context.len() + CONTEXT_CLOSE.len() + prompt.len();
        let mut out = String::with_capacity(capacity);
        out.push_str(CONTEXT_OPEN);
        out.push_str(&context);
        out.push_str(CONTEXT_CLOSE);
        out.push_str(prompt);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_history() {
        let prompt = PromptAssembler::assemble(std::iter::empty(), "p");
        assert_eq!(prompt, "<CONTEXT>\n\n</CONTEXT>\np");
    }

    #[test]
    fn test_history_in_order() {
        let history = vec![
            Message::new("first").with_response("one"),
            Message::new("second").with_response("two"),
        ];

        let prompt = PromptAssembler::assemble(&history, "third?");
        assert_eq!(
            prompt,
            "<CONTEXT>\nUser: first\nModel: one\nUser: second\nModel: two\n</CONTEXT>\nthird?"
        );
    }

    #[test]
    fn test_deterministic() {
        let history = vec![Message::new("a")];
        assert_eq!(
            PromptAssembler::assemble(&history, "b"),
            PromptAssembler::assemble(&history, "b")
        );
    }
}
