//! The intermediate block model.
//!
//! A [`Document`] is a forest of [`Block`]s, independent of the markup it was
//! parsed from and of the remote wire format. Children are owned by their
//! parent; the model is a strict tree.

use pagesync_common::{Fingerprint, UploadId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One page worth of blocks, as handed over by the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl Document {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self { blocks }
    }

    /// Deepest nesting level, counting top-level blocks as depth 1.
    pub fn depth(&self) -> usize {
        self.blocks.iter().map(Block::depth).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    /// Inline content. Toggles use it as their summary, media as caption.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<InlineRun>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Block>,
}

impl Block {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            runs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::new(BlockKind::Paragraph).with_runs(vec![InlineRun::plain(text)])
    }

    pub fn heading(level: u8, text: impl Into<String>) -> Self {
        Self::new(BlockKind::Heading { level }).with_runs(vec![InlineRun::plain(text)])
    }

    pub fn bulleted(text: impl Into<String>) -> Self {
        Self::new(BlockKind::BulletedItem).with_runs(vec![InlineRun::plain(text)])
    }

    pub fn numbered(text: impl Into<String>) -> Self {
        Self::new(BlockKind::NumberedItem).with_runs(vec![InlineRun::plain(text)])
    }

    pub fn with_runs(mut self, runs: Vec<InlineRun>) -> Self {
        self.runs = runs;
        self
    }

    pub fn with_children(mut self, children: Vec<Block>) -> Self {
        self.children = children;
        self
    }

    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(Block::depth).max().unwrap_or(0)
    }

    /// Concatenated text of the inline runs, equations as their source.
    pub fn plain_text(&self) -> String {
        self.runs.iter().map(InlineRun::as_str).collect()
    }

    /// Visit every block depth-first, parents before children.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Block)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    pub fn walk_mut(&mut self, visit: &mut impl FnMut(&mut Block)) {
        visit(self);
        for child in &mut self.children {
            child.walk_mut(visit);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph,
    Heading {
        level: u8,
    },
    BulletedItem,
    NumberedItem,
    ToDo {
        #[serde(default)]
        checked: bool,
    },
    Quote,
    Callout {
        #[serde(default)]
        icon: Option<String>,
        #[serde(default)]
        color: Color,
    },
    Toggle,
    Code {
        #[serde(default)]
        language: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        caption: Vec<InlineRun>,
    },
    Table {
        rows: Vec<TableRow>,
        #[serde(default)]
        header_rows: u32,
        #[serde(default)]
        stub_columns: u32,
    },
    Media {
        media: MediaKind,
        source: MediaReference,
    },
    Equation {
        latex: String,
    },
    Divider,
    Embed {
        url: String,
    },
    TableOfContents,
}

impl BlockKind {
    /// Whether the remote accepts nested blocks under this kind.
    ///
    /// Tables do carry rows, but those live in the kind's payload.
    pub fn accepts_children(&self) -> bool {
        matches!(
            self,
            BlockKind::Paragraph
                | BlockKind::Heading { .. }
                | BlockKind::BulletedItem
                | BlockKind::NumberedItem
                | BlockKind::ToDo { .. }
                | BlockKind::Quote
                | BlockKind::Callout { .. }
                | BlockKind::Toggle
        )
    }

    /// Whether the kind has an inline rich-text body.
    pub fn has_text(&self) -> bool {
        !matches!(
            self,
            BlockKind::Table { .. }
                | BlockKind::Equation { .. }
                | BlockKind::Divider
                | BlockKind::Embed { .. }
                | BlockKind::TableOfContents
        )
    }

    pub fn media_source(&self) -> Option<&MediaReference> {
        match self {
            BlockKind::Media { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn media_source_mut(&mut self) -> Option<&mut MediaReference> {
        match self {
            BlockKind::Media { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub cells: Vec<Vec<InlineRun>>,
}

impl TableRow {
    pub fn new(cells: Vec<Vec<InlineRun>>) -> Self {
        Self { cells }
    }

    pub fn plain(cells: &[&str]) -> Self {
        Self {
            cells: cells.iter().map(|c| vec![InlineRun::plain(*c)]).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
    Pdf,
}

impl MediaKind {
    /// Remote block type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::File => "file",
            MediaKind::Pdf => "pdf",
        }
    }

    pub fn from_block_type(block_type: &str) -> Option<Self> {
        Some(match block_type {
            "image" => MediaKind::Image,
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            "file" => MediaKind::File,
            "pdf" => MediaKind::Pdf,
            _ => return None,
        })
    }
}

/// Where a media block's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaReference {
    /// A public URL the remote links to directly.
    External { url: String },
    /// A file on disk that still has to be uploaded.
    Local {
        path: PathBuf,
        /// blake3 of the file contents, stamped before planning.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        digest: Option<Fingerprint>,
    },
    /// A completed upload, ready to attach.
    Uploaded {
        upload_id: UploadId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        digest: Option<Fingerprint>,
    },
    /// A file stored by the remote, as read back from a published page.
    /// The URL is short-lived and says nothing about the content.
    Hosted { url: String },
}

impl MediaReference {
    pub fn external(url: impl Into<String>) -> Self {
        MediaReference::External { url: url.into() }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        MediaReference::Local {
            path: path.into(),
            digest: None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MediaReference::Local { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InlineRun {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Annotations::is_plain")]
        annotations: Annotations,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        link: Option<String>,
    },
    Equation {
        expression: String,
    },
}

impl InlineRun {
    pub fn plain(text: impl Into<String>) -> Self {
        InlineRun::Text {
            text: text.into(),
            annotations: Annotations::default(),
            link: None,
        }
    }

    pub fn styled(text: impl Into<String>, annotations: Annotations) -> Self {
        InlineRun::Text {
            text: text.into(),
            annotations,
            link: None,
        }
    }

    pub fn link(text: impl Into<String>, url: impl Into<String>) -> Self {
        InlineRun::Text {
            text: text.into(),
            annotations: Annotations::default(),
            link: Some(url.into()),
        }
    }

    pub fn equation(expression: impl Into<String>) -> Self {
        InlineRun::Equation {
            expression: expression.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            InlineRun::Text { text, .. } => text,
            InlineRun::Equation { expression } => expression,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Annotations {
    pub bold: bool,
    pub italic: bool,
    pub strikethrough: bool,
    pub underline: bool,
    pub code: bool,
    pub color: Color,
    pub background: Color,
}

impl Annotations {
    pub const BOLD: Self = Self {
        bold: true,
        italic: false,
        strikethrough: false,
        underline: false,
        code: false,
        color: Color::Default,
        background: Color::Default,
    };

    pub const ITALIC: Self = Self {
        italic: true,
        bold: false,
        ..Self::BOLD
    };

    pub const CODE: Self = Self {
        code: true,
        bold: false,
        ..Self::BOLD
    };

    pub fn is_plain(&self) -> bool {
        *self == Self::default()
    }

    /// The remote keeps one color per segment, either a foreground or a
    /// background. A background wins when both are set.
    pub fn canonical(self) -> Self {
        if self.background != Color::Default {
            Self {
                color: Color::Default,
                ..self
            }
        } else {
            self
        }
    }

    /// The remote color string (`"red"`, `"red_background"`, `"default"`).
    pub fn remote_color(&self) -> String {
        let canonical = self.canonical();
        if canonical.background != Color::Default {
            format!("{}_background", canonical.background.as_str())
        } else {
            canonical.color.as_str().to_string()
        }
    }

    /// Set color or background from a remote color string.
    pub fn with_remote_color(mut self, remote: &str) -> Self {
        match remote.strip_suffix("_background") {
            Some(base) => {
                self.color = Color::Default;
                self.background = Color::parse(base).unwrap_or_default();
            }
            None => {
                self.color = Color::parse(remote).unwrap_or_default();
                self.background = Color::Default;
            }
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    #[default]
    Default,
    Gray,
    Brown,
    Orange,
    Yellow,
    Green,
    Blue,
    Purple,
    Pink,
    Red,
}

impl Color {
    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Default => "default",
            Color::Gray => "gray",
            Color::Brown => "brown",
            Color::Orange => "orange",
            Color::Yellow => "yellow",
            Color::Green => "green",
            Color::Blue => "blue",
            Color::Purple => "purple",
            Color::Pink => "pink",
            Color::Red => "red",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "default" => Color::Default,
            "gray" => Color::Gray,
            "brown" => Color::Brown,
            "orange" => Color::Orange,
            "yellow" => Color::Yellow,
            "green" => Color::Green,
            "blue" => Color::Blue,
            "purple" => Color::Purple,
            "pink" => Color::Pink,
            "red" => Color::Red,
            _ => return None,
        })
    }
}

/// Dotted key for a structural position, e.g. `[0, 3, 1]` is `"0.3.1"`.
pub fn path_key(path: &[usize]) -> String {
    let mut key = String::new();
    for (i, idx) in path.iter().enumerate() {
        if i > 0 {
            key.push('.');
        }
        key.push_str(&idx.to_string());
    }
    key
}

/// Code languages the remote knows about, sorted for binary search.
const REMOTE_LANGUAGES: &[&str] = &[
    "abap",
    "arduino",
    "bash",
    "basic",
    "c",
    "c#",
    "c++",
    "clojure",
    "coffeescript",
    "css",
    "dart",
    "diff",
    "docker",
    "elixir",
    "elm",
    "erlang",
    "f#",
    "flow",
    "fortran",
    "gherkin",
    "glsl",
    "go",
    "graphql",
    "groovy",
    "haskell",
    "html",
    "java",
    "javascript",
    "json",
    "julia",
    "kotlin",
    "latex",
    "less",
    "lisp",
    "livescript",
    "lua",
    "makefile",
    "markdown",
    "markup",
    "matlab",
    "mermaid",
    "nix",
    "objective-c",
    "ocaml",
    "pascal",
    "perl",
    "php",
    "plain text",
    "powershell",
    "prolog",
    "protobuf",
    "python",
    "r",
    "reason",
    "ruby",
    "rust",
    "sass",
    "scala",
    "scheme",
    "scss",
    "shell",
    "sql",
    "swift",
    "typescript",
    "vb.net",
    "verilog",
    "vhdl",
    "visual basic",
    "webassembly",
    "xml",
    "yaml",
];

/// Map a source-side language name onto the remote's list.
pub fn canonical_language(language: &str) -> &'static str {
    let lower = language.trim().to_ascii_lowercase();
    let aliased = match lower.as_str() {
        "" | "text" | "txt" | "none" | "default" | "plaintext" => "plain text",
        "py" | "python3" | "py3" | "pycon" | "ipython" => "python",
        "rs" => "rust",
        "sh" | "console" | "shell-session" | "zsh" | "shellsession" => "shell",
        "yml" => "yaml",
        "js" | "jsx" | "node" => "javascript",
        "ts" | "tsx" => "typescript",
        "cpp" | "cxx" | "hpp" => "c++",
        "cs" | "csharp" => "c#",
        "fsharp" => "f#",
        "dockerfile" => "docker",
        "md" => "markdown",
        "tex" => "latex",
        "ps1" | "pwsh" | "ps" => "powershell",
        "kt" => "kotlin",
        "rb" => "ruby",
        "golang" => "go",
        "objc" | "objectivec" => "objective-c",
        "hs" => "haskell",
        "proto" => "protobuf",
        "make" => "makefile",
        "wasm" | "wat" => "webassembly",
        "htm" | "xhtml" => "html",
        "udiff" | "patch" => "diff",
        "jsonc" | "json5" => "json",
        other => other,
    };
    match REMOTE_LANGUAGES.binary_search(&aliased) {
        Ok(idx) => REMOTE_LANGUAGES[idx],
        Err(_) => "plain text",
    }
}
