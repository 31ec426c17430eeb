//! Parsed tool invocations and their three wire forms.
//!
//! Assistants invoke tools by embedding blocks in their replies. Three
//! syntaxes are supported, selected by [`ToolFormat`]:
//!
//! - markdown: a fenced codeblock whose language tag routes to a tool,
//!   `` ```shell\nls\n``` ``
//! - xml: `<tool-use><shell args=''>ls</shell></tool-use>`
//! - tool: the provider's native tool-call objects, re-serialised into the
//!   transcript as `@shell(call_1): {"code": "ls"}` lines
//!
//! Parsing and rendering are symmetric: a [`ToolUse`] parsed from any form
//! renders back to an equivalent invocation in that form.

use crate::codeblock::{Codeblock, CodeblockStream, extract_codeblocks, is_filename};
use crate::tools::ToolRegistry;
use serde::{Deserialize, Serialize};

/// Which syntax the assistant uses to invoke tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolFormat {
    /// Fenced markdown codeblocks (default).
    #[default]
    Markdown,
    /// `<tool-use>` XML elements.
    Xml,
    /// Native provider tool calls.
    Tool,
}

impl std::str::FromStr for ToolFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "markdown" => Ok(ToolFormat::Markdown),
            "xml" => Ok(ToolFormat::Xml),
            "tool" => Ok(ToolFormat::Tool),
            other => Err(crate::Error::invalid_input(format!(
                "unknown tool format: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ToolFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolFormat::Markdown => "markdown",
            ToolFormat::Xml => "xml",
            ToolFormat::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

/// One parsed tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    /// Registered tool name.
    pub tool: String,
    /// Positional arguments from the infostring (or XML `args` attribute).
    pub args: Vec<String>,
    /// The invocation body (code to run, file contents to save, ...).
    pub content: String,
    /// Keyword arguments, present only for native tool calls.
    pub kwargs: Option<serde_json::Map<String, serde_json::Value>>,
    /// Provider call id, present only for native tool calls.
    pub call_id: Option<String>,
}

impl ToolUse {
    pub fn new(tool: impl Into<String>, args: Vec<String>, content: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args,
            content: content.into(),
            kwargs: None,
            call_id: None,
        }
    }

    /// Whether this invocation resolves to a registered, available tool.
    pub fn is_runnable(&self, registry: &ToolRegistry) -> bool {
        registry
            .get_tool(&self.tool)
            .map(|spec| spec.available)
            .unwrap_or(false)
    }

    /// Derives a ToolUse from a codeblock whose language tag routes to a
    /// registered tool (directly or as a filename-style tag).
    pub fn from_codeblock(codeblock: &Codeblock, registry: &ToolRegistry) -> Option<Self> {
        let spec = registry.get_tool_for_langtag(&codeblock.lang)?;
        // Filename-style tags route to the file writer; the tag itself is
        // the argument (the filename must be preserved).
        let args = if spec.is_file_writer() && is_filename(&codeblock.lang) {
            vec![codeblock.lang.clone()]
        } else {
            codeblock.args.clone()
        };
        Some(Self::new(spec.name.clone(), args, codeblock.content.clone()))
    }

    /// Maps a provider-native tool call directly.
    ///
    /// A `code` or `content` key becomes the body; remaining keys are kept
    /// as kwargs.
    pub fn from_tool_call(
        name: impl Into<String>,
        call_id: impl Into<String>,
        arguments: &serde_json::Value,
    ) -> Self {
        let mut content = String::new();
        let mut kwargs = serde_json::Map::new();
        if let Some(obj) = arguments.as_object() {
            for (key, value) in obj {
                if content.is_empty() && (key == "code" || key == "content") {
                    content = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                } else {
                    kwargs.insert(key.clone(), value.clone());
                }
            }
        } else {
            content = arguments.to_string();
        }

        Self {
            tool: name.into(),
            args: Vec::new(),
            content,
            kwargs: (!kwargs.is_empty()).then_some(kwargs),
            call_id: Some(call_id.into()),
        }
    }

    /// Parses all tool-uses from assistant text, trying XML, native-call
    /// lines, and markdown codeblocks.
    pub fn iter_from_content(content: &str, registry: &ToolRegistry) -> Vec<Self> {
        if content.contains("<tool-use>") {
            return Self::iter_from_xml(content);
        }

        let mut uses: Vec<Self> = content
            .lines()
            .filter_map(Self::from_native_line)
            .collect();

        uses.extend(
            extract_codeblocks(content)
                .iter()
                .filter_map(|cb| Self::from_codeblock(cb, registry)),
        );
        uses
    }

    /// Parses `<tool-use>` XML: each child element is one invocation, its
    /// tag the tool name, its `args` attribute the positional arguments.
    pub fn iter_from_xml(content: &str) -> Vec<Self> {
        let mut uses = Vec::new();
        if !content.contains("<tool-use>") {
            return uses;
        }

        let mut reader = quick_xml::Reader::from_str(content);
        let mut in_tooluse = false;
        loop {
            match reader.read_event() {
                Ok(quick_xml::events::Event::Start(e)) if e.name().as_ref() == b"tool-use" => {
                    in_tooluse = true;
                }
                Ok(quick_xml::events::Event::End(e)) if e.name().as_ref() == b"tool-use" => {
                    in_tooluse = false;
                }
                Ok(quick_xml::events::Event::Start(e)) if in_tooluse => {
                    let tool = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    let args: Vec<String> = e
                        .try_get_attribute("args")
                        .ok()
                        .flatten()
                        .and_then(|attr| attr.unescape_value().ok())
                        .map(|value| value.split_whitespace().map(str::to_string).collect())
                        .unwrap_or_default();
                    let name = e.name().as_ref().to_vec();
                    let body = reader
                        .read_text(quick_xml::name::QName(&name))
                        .unwrap_or_default();
                    uses.push(Self::new(tool, args, body.trim()));
                }
                Ok(quick_xml::events::Event::Eof) | Err(_) => break,
                _ => {}
            }
        }
        uses
    }

    /// Parses one `@tool(call_id): {json}` line, the form native tool calls
    /// take in the transcript.
    fn from_native_line(line: &str) -> Option<Self> {
        let rest = line.strip_prefix('@')?;
        let open = rest.find('(')?;
        let close = rest.find(')')?;
        let name = &rest[..open];
        if name.is_empty() || close < open {
            return None;
        }
        let call_id = &rest[open + 1..close];
        let json = rest[close + 1..].strip_prefix(':')?.trim();
        let arguments: serde_json::Value = serde_json::from_str(json).ok()?;
        Some(Self::from_tool_call(name, call_id, &arguments))
    }

    /// Renders in the given format.
    pub fn to_output(&self, format: ToolFormat) -> String {
        match format {
            ToolFormat::Markdown => self.to_markdown(),
            ToolFormat::Xml => self.to_xml(),
            ToolFormat::Tool => self.to_native_line(),
        }
    }

    pub fn to_markdown(&self) -> String {
        let infostring = if self.args.is_empty() {
            self.tool.clone()
        } else {
            format!("{} {}", self.tool, self.args.join(" "))
        };
        format!("```{}\n{}\n```", infostring, self.content)
    }

    pub fn to_xml(&self) -> String {
        format!(
            "<tool-use>\n<{tool} args='{args}'>\n{content}\n</{tool}>\n</tool-use>",
            tool = self.tool,
            args = self.args.join(" "),
            content = self.content,
        )
    }

    fn to_native_line(&self) -> String {
        let mut arguments = self.kwargs.clone().unwrap_or_default();
        arguments.insert(
            "code".to_string(),
            serde_json::Value::String(self.content.clone()),
        );
        format!(
            "@{}({}): {}",
            self.tool,
            self.call_id.as_deref().unwrap_or(""),
            serde_json::Value::Object(arguments),
        )
    }
}

/// Incremental tool-use detector for token streams.
///
/// Fed chunk by chunk; reports the first complete, runnable invocation as
/// soon as its closing line arrives. Internally line-buffered so no text is
/// scanned twice.
pub struct ToolUseScanner {
    blocks: CodeblockStream,
    partial_line: String,
    xml_buffer: String,
}

impl ToolUseScanner {
    pub fn new() -> Self {
        Self {
            blocks: CodeblockStream::new(),
            partial_line: String::new(),
            xml_buffer: String::new(),
        }
    }

    /// Feeds a chunk; returns the first runnable tool-use completed by it.
    pub fn push(&mut self, chunk: &str, registry: &ToolRegistry) -> Option<ToolUse> {
        // Markdown blocks complete at their closing fence.
        let mut found = self
            .blocks
            .push(chunk)
            .iter()
            .filter_map(|cb| ToolUse::from_codeblock(cb, registry))
            .find(|tu| tu.is_runnable(registry));

        // Native-call and XML forms complete at line boundaries.
        self.partial_line.push_str(chunk);
        while let Some(newline) = self.partial_line.find('\n') {
            let line: String = self.partial_line.drain(..=newline).collect();
            let line = line.trim_end_matches('\n');
            self.xml_buffer.push_str(line);
            self.xml_buffer.push('\n');

            if found.is_none() {
                found = ToolUse::from_native_line(line).filter(|tu| tu.is_runnable(registry));
            }
            if found.is_none() && line.trim() == "</tool-use>" {
                found = ToolUse::iter_from_xml(&self.xml_buffer)
                    .into_iter()
                    .find(|tu| tu.is_runnable(registry));
            }
        }

        found
    }
}

impl Default for ToolUseScanner {
    fn default() -> Self {
        Self::new()
    }
}
