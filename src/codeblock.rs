//! Fenced-codeblock extraction from markdown.
//!
//! The tool-use parser depends on robust extraction of codeblocks from
//! free-form assistant text, including blocks that themselves contain
//! triple-backtick fences (e.g. the model writing a markdown file). The
//! scanner is line-based and keeps a stack of open fences: only the
//! outermost pair delimits a block, everything nested is content.

/// A lexical codeblock: the infostring split into language tag and args,
/// plus the raw body.
#[derive(Debug, Clone)]
pub struct Codeblock {
    /// First whitespace-separated token of the infostring. May be a
    /// filename-style tag (`src/main.py`), in which case `path` is set.
    pub lang: String,
    /// Remaining infostring tokens.
    pub args: Vec<String>,
    /// The block body, without the fences.
    pub content: String,
    /// Filename the block targets, when the language tag looks like a path.
    pub path: Option<String>,
    /// Byte offset of the opening fence in the scanned text. Not part of
    /// block identity.
    pub start: Option<usize>,
}

impl PartialEq for Codeblock {
    fn eq(&self, other: &Self) -> bool {
        self.lang == other.lang && self.args == other.args && self.content == other.content
    }
}

impl Eq for Codeblock {}

impl Codeblock {
    pub fn new(lang: impl Into<String>, content: impl Into<String>) -> Self {
        let lang = lang.into();
        let path = is_filename(&lang).then(|| lang.clone());
        Self {
            lang,
            args: Vec::new(),
            content: content.into(),
            path,
            start: None,
        }
    }

    fn from_infostring(infostring: &str, content: String, start: usize) -> Self {
        let mut tokens = infostring.split_whitespace();
        let lang = tokens.next().unwrap_or_default().to_string();
        let args = tokens.map(str::to_string).collect();
        let path = is_filename(&lang).then(|| lang.clone());
        Self {
            lang,
            args,
            content,
            path,
            start: Some(start),
        }
    }

    /// The full infostring as written after the opening fence.
    pub fn infostring(&self) -> String {
        if self.args.is_empty() {
            self.lang.clone()
        } else {
            format!("{} {}", self.lang, self.args.join(" "))
        }
    }

    /// Renders the block back to fenced markdown.
    pub fn to_markdown(&self) -> String {
        format!("```{}\n{}\n```", self.infostring(), self.content)
    }
}

/// A language tag that names a file rather than a language.
pub fn is_filename(lang: &str) -> bool {
    lang.contains('.') || lang.contains('/')
}

/// Extracts all outermost fenced codeblocks from markdown.
///
/// Scan rules: a fence line opens a block when no block is open; inside a
/// block, a fence line with a new non-empty infostring opens a *nested*
/// fence (kept as content), and a bare closing fence closes the innermost
/// one. Only closing the outermost fence yields a block.
pub fn extract_codeblocks(markdown: &str) -> Vec<Codeblock> {
    // Cheap early exit: no pair of fences, no blocks.
    if markdown.matches("```").count() < 2 {
        return Vec::new();
    }

    let mut blocks = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_infostring = String::new();
    let mut offset = 0usize;
    let mut block_start = 0usize;

    for line in markdown.split('\n') {
        let stripped = line.trim();
        if let Some(infostring) = stripped.strip_prefix("```") {
            if stack.is_empty() {
                // Opening fence of a new outermost block.
                stack.push(infostring.to_string());
                current_infostring = infostring.to_string();
                block_start = offset;
            } else if !infostring.is_empty() && stack.last().map(String::as_str) != Some(infostring)
            {
                // A nested fence opening inside the block; part of content.
                current.push(line);
                stack.push(infostring.to_string());
            } else if stack.len() == 1 {
                // Closing the outermost fence.
                blocks.push(Codeblock::from_infostring(
                    &current_infostring,
                    current.join("\n"),
                    block_start,
                ));
                current.clear();
                current_infostring.clear();
                stack.pop();
            } else {
                // Closing a nested fence; part of content.
                current.push(line);
                stack.pop();
            }
        } else if !stack.is_empty() {
            current.push(line);
        }
        offset += line.len() + 1;
    }

    blocks
}

/// Push-based codeblock parser for token streams.
///
/// The agent loop feeds it chunks as they arrive; each completed line is
/// run through the same fence state machine as [`extract_codeblocks`], so
/// every byte is examined once regardless of how often the loop polls.
/// Blocks are yielded as soon as their outermost fence closes.
#[derive(Debug, Default)]
pub struct CodeblockStream {
    stack: Vec<String>,
    current: Vec<String>,
    infostring: String,
    partial_line: String,
}

impl CodeblockStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of streamed text, returning any codeblocks completed
    /// by it. Lines are only processed once terminated by a newline.
    pub fn push(&mut self, chunk: &str) -> Vec<Codeblock> {
        let mut completed = Vec::new();
        self.partial_line.push_str(chunk);

        while let Some(newline) = self.partial_line.find('\n') {
            let line: String = self.partial_line.drain(..=newline).collect();
            self.feed_line(line.trim_end_matches('\n'), &mut completed);
        }

        completed
    }

    fn feed_line(&mut self, line: &str, completed: &mut Vec<Codeblock>) {
        let stripped = line.trim();
        if let Some(infostring) = stripped.strip_prefix("```") {
            if self.stack.is_empty() {
                self.stack.push(infostring.to_string());
                self.infostring = infostring.to_string();
            } else if !infostring.is_empty()
                && self.stack.last().map(String::as_str) != Some(infostring)
            {
                self.current.push(line.to_string());
                self.stack.push(infostring.to_string());
            } else if self.stack.len() == 1 {
                completed.push(Codeblock::from_infostring(
                    &self.infostring,
                    self.current.join("\n"),
                    0,
                ));
                self.current.clear();
                self.infostring.clear();
                self.stack.pop();
            } else {
                self.current.push(line.to_string());
                self.stack.pop();
            }
        } else if !self.stack.is_empty() {
            self.current.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_simple() {
        let md = "Some text\n```python\nprint('hi')\n```\ntrailing";
        let blocks = extract_codeblocks(md);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].lang, "python");
        assert_eq!(blocks[0].content, "print('hi')");
    }

    #[test]
    fn test_extract_infostring_args() {
        let md = "```shell -x flag\nls\n```";
        let blocks = extract_codeblocks(md);
        assert_eq!(blocks[0].lang, "shell");
        assert_eq!(blocks[0].args, vec!["-x", "flag"]);
    }

    #[test]
    fn test_extract_empty_infostring() {
        let md = "```\nplain\n```";
        let blocks = extract_codeblocks(md);
        assert_eq!(blocks[0].lang, "");
        assert_eq!(blocks[0].content, "plain");
    }

    #[test]
    fn test_extract_nested_fences_are_content() {
        let md = "```README.md\n# Title\n```python\nprint('hi')\n```\ndone\n```";
        let blocks = extract_codeblocks(md);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].lang, "README.md");
        assert!(blocks[0].content.contains("```python"));
        assert!(blocks[0].content.contains("print('hi')"));
        assert!(blocks[0].content.ends_with("done"));
    }

    #[test]
    fn test_extract_multiple_blocks() {
        let md = "```a\n1\n```\nbetween\n```b\n2\n```";
        let blocks = extract_codeblocks(md);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].lang, "a");
        assert_eq!(blocks[1].lang, "b");
    }

    #[test]
    fn test_unclosed_block_not_yielded() {
        let md = "```python\nprint('hi')";
        assert!(extract_codeblocks(md).is_empty());
    }

    #[test]
    fn test_filename_lang_sets_path() {
        let blocks = extract_codeblocks("```src/main.rs\nfn main() {}\n```");
        assert_eq!(blocks[0].path.as_deref(), Some("src/main.rs"));
        assert!(is_filename("file.txt"));
        assert!(is_filename("dir/file"));
        assert!(!is_filename("python"));
    }

    #[test]
    fn test_roundtrip() {
        let md = "```shell arg1\nls -la\n```";
        let blocks = extract_codeblocks(md);
        assert_eq!(blocks.len(), 1);
        let again = extract_codeblocks(&blocks[0].to_markdown());
        assert_eq!(again, blocks);
    }

    #[test]
    fn test_start_offset_points_at_fence() {
        let md = "abc\n```python\nx\n```";
        let blocks = extract_codeblocks(md);
        assert_eq!(blocks[0].start, Some(4));
    }

    #[test]
    fn test_stream_yields_on_closing_fence() {
        let mut stream = CodeblockStream::new();
        assert!(stream.push("I'll run it:\n\n```shell\n").is_empty());
        assert!(stream.push("ls -la\n").is_empty());
        // Closing fence not yet terminated by newline.
        assert!(stream.push("```").is_empty());
        let blocks = stream.push("\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].lang, "shell");
        assert_eq!(blocks[0].content, "ls -la");
    }

    #[test]
    fn test_stream_matches_batch_extraction() {
        let md = "intro\n```a\n1\n```\n```README.md\nnested:\n```python\nx\n```\nend\n```\n";
        let mut stream = CodeblockStream::new();
        let mut streamed = Vec::new();
        // Feed in awkward chunk sizes to exercise the line buffer.
        for chunk in md.as_bytes().chunks(3) {
            streamed.extend(stream.push(std::str::from_utf8(chunk).unwrap()));
        }
        assert_eq!(streamed, extract_codeblocks(md));
    }
}
