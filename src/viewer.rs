//! Submission file viewer state machine.
//!
//! The UI drives it: every selection change goes through
//! [`FileViewer::on_selection_changed`], which hands back the effect to run
//! (a fetch or a HEIC transcode). Each effect carries a [`Ticket`]; results
//! arriving with an old ticket are dropped, so a slow fetch for a previous
//! file can never overwrite the current one.

use serde::Deserialize;

pub const MAX_SIZE_DEFAULT: u64 = 100_000;
pub const MAX_SIZE_TEXT: u64 = 100_000;
pub const MAX_SIZE_BINARY: u64 = 100_000;
pub const MAX_SIZE_RENDERED: u64 = 50_000_000;

pub const TYPE_IMAGE: &str = "image";
pub const TYPE_PDF: &str = "pdf";
pub const TYPE_NOTEBOOK: &str = "jupyter-notebook";
pub const TYPE_BINARY: &str = "binary";
pub const TYPE_URL: &str = "markusurl";

pub fn max_file_size(file_type: &str) -> u64 {
    match file_type {
        TYPE_IMAGE | TYPE_PDF | TYPE_NOTEBOOK => MAX_SIZE_RENDERED,
        "text" => MAX_SIZE_TEXT,
        TYPE_BINARY => MAX_SIZE_BINARY,
        _ => MAX_SIZE_DEFAULT,
    }
}

pub fn is_file_too_large(size: u64, file_type: &str) -> bool {
    size > max_file_size(file_type)
}

fn is_rendered(file_type: &str) -> bool {
    matches!(file_type, TYPE_IMAGE | TYPE_PDF | TYPE_NOTEBOOK)
}

fn needs_transcode(mime_type: Option<&str>) -> bool {
    matches!(mime_type, Some("image/heic") | Some("image/heif"))
}

fn normalize_newlines(s: &str) -> String {
    s.replace("\r\n", "\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    pub course_id: String,
    pub assignment_id: String,
    pub submission_id: String,
    pub file_id: Option<String>,
    /// Set when the file lives behind an external URL instead of a
    /// submission file record.
    pub file_url: Option<String>,
    /// Declared type for URL-backed files (the metadata endpoint is skipped).
    pub file_type: Option<String>,
    pub mime_type: Option<String>,
}

impl Selection {
    fn download_url(&self, file_id: &str) -> String {
        match &self.file_url {
            Some(url) => url.clone(),
            None => format!(
                "/courses/{}/assignments/{}/submissions/{}/download_file?select_file_id={}&show_in_browser=true&from_codeviewer=true",
                self.course_id, self.assignment_id, self.submission_id, file_id
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

/// Body of the file metadata endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileMeta {
    pub size: u64,
    #[serde(rename = "type")]
    pub file_type: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    None,
    FetchMeta {
        ticket: Ticket,
        submission_id: String,
        file_id: String,
        force_text: bool,
        max_content_size: u64,
    },
    FetchPreview {
        ticket: Ticket,
        url: String,
    },
    Transcode {
        ticket: Ticket,
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerState {
    Empty,
    Loading,
    TooLarge { size: u64, file_type: String },
    Image { url: String },
    Pdf { url: String },
    Notebook { url: String },
    Text { file_type: String, content: String },
    Binary { content: String },
    Url { external_url: String },
    Failed { message: String },
}

#[derive(Debug, Default)]
pub struct FileViewer {
    selection: Option<Selection>,
    state: Option<ViewerState>,
    next_ticket: u64,
    pending: Option<Ticket>,
}

impl FileViewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ViewerState {
        self.state.as_ref().unwrap_or(&ViewerState::Empty)
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Single entry point for file, submission and URL changes. Re-selecting
    /// the current file is a no-op unless the last fetch failed.
    pub fn on_selection_changed(&mut self, selection: Option<Selection>) -> Effect {
        let unchanged = selection.is_some() && selection == self.selection;
        if unchanged && !matches!(self.state(), ViewerState::Failed { .. }) {
            return Effect::None;
        }
        self.selection = selection;
        self.load(false)
    }

    /// "Get anyway" for binary files: refetch as text.
    pub fn force_fetch(&mut self) -> Effect {
        if self.selection.is_none() {
            return Effect::None;
        }
        self.load(true)
    }

    fn issue(&mut self) -> Ticket {
        self.next_ticket += 1;
        let ticket = Ticket(self.next_ticket);
        self.pending = Some(ticket);
        ticket
    }

    fn is_current(&self, ticket: Ticket) -> bool {
        self.pending == Some(ticket)
    }

    fn load(&mut self, force_text: bool) -> Effect {
        self.pending = None;
        let Some(sel) = self.selection.clone() else {
            self.state = Some(ViewerState::Empty);
            return Effect::None;
        };

        if let Some(url) = sel.file_url.clone() {
            let file_type = sel.file_type.clone().unwrap_or_default();
            let ticket = self.issue();
            self.state = Some(ViewerState::Loading);
            if is_rendered(&file_type) {
                return self.show_rendered(ticket, &file_type, url);
            }
            return Effect::FetchPreview {
                ticket,
                url: format!("{url}&preview=true&force_text={force_text}"),
            };
        }

        let Some(file_id) = sel.file_id.clone() else {
            self.state = Some(ViewerState::Empty);
            return Effect::None;
        };
        let ticket = self.issue();
        self.state = Some(ViewerState::Loading);
        Effect::FetchMeta {
            ticket,
            submission_id: sel.submission_id,
            file_id,
            force_text,
            max_content_size: MAX_SIZE_TEXT,
        }
    }

    fn show_rendered(&mut self, ticket: Ticket, file_type: &str, url: String) -> Effect {
        let mime = self.selection.as_ref().and_then(|s| s.mime_type.as_deref());
        if file_type == TYPE_IMAGE && needs_transcode(mime) {
            return Effect::Transcode { ticket, url };
        }
        self.pending = None;
        self.state = Some(match file_type {
            TYPE_IMAGE => ViewerState::Image { url },
            TYPE_PDF => ViewerState::Pdf { url },
            _ => ViewerState::Notebook { url },
        });
        Effect::None
    }

    /// Metadata fetch finished. Returns the follow-up effect; stale tickets
    /// are ignored.
    pub fn on_meta(&mut self, ticket: Ticket, meta: FileMeta) -> Effect {
        if !self.is_current(ticket) {
            tracing::debug!(?ticket, "discarding stale file metadata");
            return Effect::None;
        }
        if is_file_too_large(meta.size, &meta.file_type) {
            self.pending = None;
            self.state = Some(ViewerState::TooLarge {
                size: meta.size,
                file_type: meta.file_type,
            });
            return Effect::None;
        }
        if is_rendered(&meta.file_type) {
            let file_id = self
                .selection
                .as_ref()
                .and_then(|s| s.file_id.clone())
                .unwrap_or_default();
            let url = self
                .selection
                .as_ref()
                .map(|s| s.download_url(&file_id))
                .unwrap_or_default();
            return self.show_rendered(ticket, &meta.file_type, url);
        }

        self.pending = None;
        let content = normalize_newlines(meta.content.as_deref().unwrap_or(""));
        self.state = Some(content_state(meta.file_type, content));
        Effect::None
    }

    /// Preview body for a URL-backed selection.
    pub fn on_preview(&mut self, ticket: Ticket, body: &str) {
        if !self.is_current(ticket) {
            return;
        }
        self.pending = None;
        let file_type = self
            .selection
            .as_ref()
            .and_then(|s| s.file_type.clone())
            .unwrap_or_default();
        self.state = Some(content_state(file_type, normalize_newlines(body)));
    }

    /// HEIC/HEIF image converted to a displayable object URL.
    pub fn on_transcoded(&mut self, ticket: Ticket, object_url: String) {
        if !self.is_current(ticket) {
            return;
        }
        self.pending = None;
        self.state = Some(ViewerState::Image { url: object_url });
    }

    pub fn on_fetch_failed(&mut self, ticket: Ticket, message: impl Into<String>) {
        if !self.is_current(ticket) {
            return;
        }
        self.pending = None;
        self.state = Some(ViewerState::Failed {
            message: message.into(),
        });
    }
}

fn content_state(file_type: String, content: String) -> ViewerState {
    match file_type.as_str() {
        TYPE_BINARY => ViewerState::Binary { content },
        TYPE_URL => ViewerState::Url {
            external_url: content,
        },
        "" => ViewerState::Empty,
        _ => ViewerState::Text { file_type, content },
    }
}
