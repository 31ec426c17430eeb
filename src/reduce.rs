//! Token budgeting: estimation, reduction, and the hard limit.
//!
//! Reduction shrinks a log that exceeds its soft budget by truncating
//! codeblocks in the longest messages; the limit pass then drops whole
//! messages oldest-first if the log still does not fit. Pinned messages and
//! the leading system messages are never touched by either pass.

use crate::codeblock::Codeblock;
use crate::message::{Message, Role};

/// Pluggable token counting.
///
/// Provider-specific tokenizers can be slotted in behind this trait; the
/// deterministic [`ApproxCounter`] keeps reduction testable without network
/// access or tokenizer data files.
pub trait TokenCounter: Send + Sync {
    fn estimate(&self, messages: &[Message], model: &str) -> usize;

    fn estimate_one(&self, message: &Message, model: &str) -> usize {
        self.estimate(std::slice::from_ref(message), model)
    }
}

/// Character-based approximation: one token per three characters of
/// content, rounded up per message.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxCounter;

impl TokenCounter for ApproxCounter {
    fn estimate(&self, messages: &[Message], _model: &str) -> usize {
        messages
            .iter()
            .map(|msg| msg.content.len().div_ceil(3))
            .sum()
    }
}

/// Number of codeblock lines kept at each end when truncating.
const TRUNCATE_LINES_PRE: usize = 10;
const TRUNCATE_LINES_POST: usize = 10;

/// Truncates each codeblock in a message to its first and last ten lines,
/// separated by `[...]`. Returns `None` when nothing was long enough to
/// truncate.
pub fn truncate_msg(msg: &Message) -> Option<Message> {
    let mut content = msg.content.clone();

    for codeblock in msg.codeblocks() {
        let lines: Vec<&str> = codeblock.content.split('\n').collect();
        if lines.len() <= TRUNCATE_LINES_PRE + TRUNCATE_LINES_POST + 1 {
            continue;
        }

        let mut kept: Vec<&str> = Vec::with_capacity(TRUNCATE_LINES_PRE + TRUNCATE_LINES_POST + 1);
        kept.extend(&lines[..TRUNCATE_LINES_PRE]);
        kept.push("[...]");
        kept.extend(&lines[lines.len() - TRUNCATE_LINES_POST..]);

        let mut truncated = Codeblock::new(codeblock.lang.clone(), kept.join("\n"));
        truncated.args = codeblock.args.clone();
        content = content.replace(&codeblock.to_markdown(), &truncated.to_markdown());
    }

    (content != msg.content).then(|| msg.replace_content(content))
}

/// Length of the leading system-message run; those messages are exempt
/// from reduction and limiting.
fn leading_system_len(msgs: &[Message]) -> usize {
    msgs.iter()
        .take_while(|msg| msg.role == Role::System)
        .count()
}

/// Reduces the log below `limit` tokens by repeatedly truncating the
/// codeblocks of the longest unpinned message. Stops when under the limit
/// or when a pass makes no progress.
pub fn reduce_log(
    msgs: &[Message],
    limit: usize,
    counter: &dyn TokenCounter,
    model: &str,
) -> Vec<Message> {
    let mut msgs = msgs.to_vec();
    let protected = leading_system_len(&msgs);
    let mut prev_tokens = None;

    loop {
        let tokens = counter.estimate(&msgs, model);
        if tokens <= limit {
            return msgs;
        }
        if prev_tokens == Some(tokens) {
            tracing::warn!(tokens, limit, "reduction is not making progress");
            return msgs;
        }
        prev_tokens = Some(tokens);

        let longest = msgs
            .iter()
            .enumerate()
            .skip(protected)
            .filter(|(_, msg)| !msg.pinned)
            .max_by_key(|(_, msg)| counter.estimate_one(msg, model));

        let Some((index, msg)) = longest else {
            return msgs;
        };
        if let Some(truncated) = truncate_msg(msg) {
            msgs[index] = truncated;
        }
        // An untruncatable longest message leaves the estimate unchanged
        // and the no-progress guard terminates the loop.
    }
}

/// Walks the log in reverse accumulating messages until the budget is
/// exceeded, then drops the message that tipped over and everything older.
/// Leading system messages and pinned messages are always kept.
pub fn limit_log(
    msgs: &[Message],
    context: usize,
    counter: &dyn TokenCounter,
    model: &str,
) -> Vec<Message> {
    let protected = leading_system_len(msgs);
    let mut keep: Vec<bool> = msgs
        .iter()
        .enumerate()
        .map(|(i, msg)| i < protected || msg.pinned)
        .collect();

    let mut total: usize = msgs
        .iter()
        .zip(&keep)
        .filter(|(_, kept)| **kept)
        .map(|(msg, _)| counter.estimate_one(msg, model))
        .sum();

    for (i, msg) in msgs.iter().enumerate().rev() {
        if keep[i] {
            continue;
        }
        total += counter.estimate_one(msg, model);
        if total > context {
            break;
        }
        keep[i] = true;
    }

    let result: Vec<Message> = msgs
        .iter()
        .zip(&keep)
        .filter(|(_, kept)| **kept)
        .map(|(msg, _)| msg.clone())
        .collect();

    if result.len() < msgs.len() {
        tracing::warn!(
            dropped = msgs.len() - result.len(),
            "context over budget, dropped oldest messages"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> ApproxCounter {
        ApproxCounter
    }

    fn long_block_msg(lines: usize) -> Message {
        let body: Vec<String> = (0..lines).map(|i| format!("line {i}")).collect();
        Message::assistant(format!("```python\n{}\n```", body.join("\n")))
    }

    #[test]
    fn test_truncate_keeps_ends() {
        let msg = long_block_msg(100);
        let truncated = truncate_msg(&msg).unwrap();
        assert!(truncated.content.contains("line 0"));
        assert!(truncated.content.contains("line 99"));
        assert!(truncated.content.contains("[...]"));
        assert!(!truncated.content.contains("line 50"));
    }

    #[test]
    fn test_truncate_short_block_unchanged() {
        let msg = long_block_msg(5);
        assert!(truncate_msg(&msg).is_none());
    }

    #[test]
    fn test_reduce_reaches_limit() {
        let msgs = vec![
            Message::system("prompt"),
            Message::user("question"),
            long_block_msg(10_000),
        ];
        let limit = 500;
        let reduced = reduce_log(&msgs, limit, &counter(), "test");
        assert!(counter().estimate(&reduced, "test") <= limit);
        assert!(reduced[2].content.contains("[...]"));
        // Leading system message untouched.
        assert_eq!(reduced[0], msgs[0]);
    }

    #[test]
    fn test_reduce_never_touches_pinned() {
        let msgs = vec![
            Message::system("prompt"),
            long_block_msg(10_000).pinned(),
            Message::user("q"),
        ];
        let reduced = reduce_log(&msgs, 10, &counter(), "test");
        // Pinned message survives verbatim even though over budget.
        assert_eq!(reduced[1].content, msgs[1].content);
    }

    #[test]
    fn test_reduce_no_progress_terminates() {
        // A single huge message with no codeblock cannot be truncated.
        let msgs = vec![Message::user("x".repeat(10_000))];
        let reduced = reduce_log(&msgs, 10, &counter(), "test");
        assert_eq!(reduced.len(), 1);
    }

    #[test]
    fn test_limit_drops_oldest_first() {
        let msgs = vec![
            Message::system("sys"),
            Message::user("a".repeat(300)),
            Message::user("b".repeat(300)),
            Message::user("c".repeat(300)),
        ];
        // Budget fits system + roughly two of the large messages.
        let limited = limit_log(&msgs, 220, &counter(), "test");
        assert_eq!(limited[0].role, Role::System);
        assert!(limited.len() < msgs.len());
        // The newest message is always present.
        assert_eq!(limited.last().unwrap().content, msgs[3].content);
    }

    #[test]
    fn test_limit_keeps_everything_when_under_budget() {
        let msgs = vec![Message::system("s"), Message::user("hi")];
        let limited = limit_log(&msgs, 10_000, &counter(), "test");
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_limit_never_drops_pinned() {
        let msgs = vec![
            Message::system("sys"),
            Message::user("old but important".repeat(50)).pinned(),
            Message::user("filler ".repeat(100)),
            Message::user("latest"),
        ];
        let limited = limit_log(&msgs, 300, &counter(), "test");
        assert!(limited.iter().any(|m| m.pinned));
        assert_eq!(limited.last().unwrap().content, "latest");
    }
}
