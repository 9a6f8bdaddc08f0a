//! Diagnostic records, the per-call sink that collects them, and the
//! caller-facing callback set.
//!
//! A running script reports non-result output through six categories. Each
//! category has an append-only log; emitting a record appends to the log and
//! sends a [`DiagnosticNotice`] carrying the category and the record's index.
//! The dispatcher resolves the notice against the log and calls the matching
//! callback.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// The six diagnostic channels a script can write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticCategory {
    /// Verbose tracing output.
    Verbose,
    /// Debug output.
    Debug,
    /// Informational messages.
    Information,
    /// Warnings.
    Warning,
    /// Non-terminating errors.
    Error,
    /// Progress updates.
    Progress,
}

impl DiagnosticCategory {
    /// Number of categories.
    pub const COUNT: usize = 6;

    /// All categories, in table order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Verbose,
        Self::Debug,
        Self::Information,
        Self::Warning,
        Self::Error,
        Self::Progress,
    ];

    /// Slot of this category in per-category tables.
    pub const fn index(self) -> usize {
        match self {
            Self::Verbose => 0,
            Self::Debug => 1,
            Self::Information => 2,
            Self::Warning => 3,
            Self::Error => 4,
            Self::Progress => 5,
        }
    }

    /// Lowercase name of the category.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verbose => "verbose",
            Self::Debug => "debug",
            Self::Information => "information",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Progress => "progress",
        }
    }
}

impl fmt::Display for DiagnosticCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload shared by the verbose, debug and warning categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformationalRecord {
    /// The message text.
    pub message: String,
}

impl InformationalRecord {
    /// Create a record with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for InformationalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Payload of the information category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformationRecord {
    /// The message text.
    pub message: String,
    /// What produced the message (`print`, a command name, ...).
    pub source: Option<String>,
    /// Free-form tags attached by the producer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl InformationRecord {
    /// Create a record with the given message and no source.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            tags: Vec::new(),
        }
    }

    /// Set the source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

impl fmt::Display for InformationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Payload of the error category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The error message.
    pub message: String,
    /// Location in the script, when available.
    pub location: Option<String>,
}

impl ErrorRecord {
    /// Create a record without a location.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} ({location})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Whether a progress record reports ongoing work or the end of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressRecordType {
    /// The activity is still running.
    #[default]
    Processing,
    /// The activity has finished.
    Completed,
}

impl fmt::Display for ProgressRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Processing => "Processing",
            Self::Completed => "Completed",
        })
    }
}

/// Payload of the progress category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Identifier distinguishing concurrent activities.
    pub activity_id: i64,
    /// Name of the activity.
    pub activity: String,
    /// Percentage complete, 0 through 100.
    pub percent_complete: u8,
    /// Current status of the activity.
    pub status_description: String,
    /// The operation currently being performed.
    pub current_operation: Option<String>,
    /// Processing or completed.
    pub record_type: ProgressRecordType,
}

impl ProgressRecord {
    /// Create a processing record.
    pub fn new(activity: impl Into<String>, percent_complete: u8) -> Self {
        Self {
            activity_id: 0,
            activity: activity.into(),
            percent_complete: percent_complete.min(100),
            status_description: String::new(),
            current_operation: None,
            record_type: ProgressRecordType::Processing,
        }
    }

    /// Create a completed record for the activity.
    pub fn completed(activity: impl Into<String>) -> Self {
        Self {
            record_type: ProgressRecordType::Completed,
            ..Self::new(activity, 100)
        }
    }

    /// Set the status description.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status_description = status.into();
        self
    }

    /// Set the current operation.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.current_operation = Some(operation.into());
        self
    }

    /// True when this record ends its activity.
    pub fn is_final(&self) -> bool {
        self.percent_complete >= 100 || self.record_type == ProgressRecordType::Completed
    }
}

impl fmt::Display for ProgressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>3}% {}", self.percent_complete, self.activity)?;
        if !self.status_description.is_empty() {
            write!(f, " ({})", self.status_description)?;
        }
        if let Some(operation) = &self.current_operation {
            write!(f, " {operation}")?;
        }
        Ok(())
    }
}

/// A diagnostic record tagged with its category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", content = "record", rename_all = "lowercase")]
pub enum DiagnosticRecord {
    /// Verbose output.
    Verbose(InformationalRecord),
    /// Debug output.
    Debug(InformationalRecord),
    /// Informational output.
    Information(InformationRecord),
    /// A warning.
    Warning(InformationalRecord),
    /// A non-terminating error.
    Error(ErrorRecord),
    /// A progress update.
    Progress(ProgressRecord),
}

impl DiagnosticRecord {
    /// The category this record belongs to.
    pub fn category(&self) -> DiagnosticCategory {
        match self {
            Self::Verbose(_) => DiagnosticCategory::Verbose,
            Self::Debug(_) => DiagnosticCategory::Debug,
            Self::Information(_) => DiagnosticCategory::Information,
            Self::Warning(_) => DiagnosticCategory::Warning,
            Self::Error(_) => DiagnosticCategory::Error,
            Self::Progress(_) => DiagnosticCategory::Progress,
        }
    }
}

impl fmt::Display for DiagnosticRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verbose(r) | Self::Debug(r) | Self::Warning(r) => r.fmt(f),
            Self::Information(r) => r.fmt(f),
            Self::Error(r) => r.fmt(f),
            Self::Progress(r) => r.fmt(f),
        }
    }
}

/// Untyped notification that a record was appended to a category log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticNotice {
    /// The category the record was appended to.
    pub category: DiagnosticCategory,
    /// Index of the record in that category's log.
    pub index: usize,
}

/// Append-only per-category logs for one call.
#[derive(Debug, Default)]
pub struct DiagnosticStreams {
    logs: [Vec<DiagnosticRecord>; DiagnosticCategory::COUNT],
}

impl DiagnosticStreams {
    /// Look up a record by category and index.
    pub fn get(&self, category: DiagnosticCategory, index: usize) -> Option<&DiagnosticRecord> {
        self.logs[category.index()].get(index)
    }

    /// Number of records logged in a category.
    pub fn len(&self, category: DiagnosticCategory) -> usize {
        self.logs[category.index()].len()
    }

    /// True when no category has any record.
    pub fn is_empty(&self) -> bool {
        self.logs.iter().all(Vec::is_empty)
    }

    fn append(&mut self, record: DiagnosticRecord) -> DiagnosticNotice {
        let category = record.category();
        let log = &mut self.logs[category.index()];
        log.push(record);
        DiagnosticNotice {
            category,
            index: log.len() - 1,
        }
    }
}

/// Logs shared between a sink and its feed.
pub type SharedStreams = Arc<Mutex<DiagnosticStreams>>;

/// Sending half handed to an interpreter context for one invocation.
///
/// Dropping every clone of the sink ends the feed, which is how the executor
/// knows that all diagnostics of a call have been dispatched.
#[derive(Debug, Clone)]
pub struct DiagnosticSink {
    streams: SharedStreams,
    notices: mpsc::UnboundedSender<DiagnosticNotice>,
}

/// Receiving half consumed by the dispatcher.
#[derive(Debug)]
pub struct DiagnosticFeed {
    pub(crate) streams: SharedStreams,
    pub(crate) notices: mpsc::UnboundedReceiver<DiagnosticNotice>,
}

impl DiagnosticFeed {
    /// The logs this feed's notices index into.
    pub fn streams(&self) -> &SharedStreams {
        &self.streams
    }
}

impl DiagnosticSink {
    /// Create a connected sink and feed.
    pub fn channel() -> (Self, DiagnosticFeed) {
        let streams = SharedStreams::default();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        (
            Self {
                streams: streams.clone(),
                notices: notices_tx,
            },
            DiagnosticFeed {
                streams,
                notices: notices_rx,
            },
        )
    }

    /// Append a record and notify the feed.
    ///
    /// The log lock is held while the notice is sent, so notices for one
    /// category leave in the same order their records were appended.
    pub fn emit(&self, record: DiagnosticRecord) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let notice = streams.append(record);
        if self.notices.send(notice).is_err() {
            tracing::trace!("diagnostic feed closed, {} record not dispatched", notice.category);
        }
    }

    /// Emit a verbose message.
    pub fn verbose(&self, message: impl Into<String>) {
        self.emit(DiagnosticRecord::Verbose(InformationalRecord::new(message)));
    }

    /// Emit a debug message.
    pub fn debug(&self, message: impl Into<String>) {
        self.emit(DiagnosticRecord::Debug(InformationalRecord::new(message)));
    }

    /// Emit an informational message.
    pub fn information(&self, record: InformationRecord) {
        self.emit(DiagnosticRecord::Information(record));
    }

    /// Emit a warning.
    pub fn warning(&self, message: impl Into<String>) {
        self.emit(DiagnosticRecord::Warning(InformationalRecord::new(message)));
    }

    /// Emit a non-terminating error.
    pub fn error(&self, record: ErrorRecord) {
        self.emit(DiagnosticRecord::Error(record));
    }

    /// Emit a progress update.
    pub fn progress(&self, record: ProgressRecord) {
        self.emit(DiagnosticRecord::Progress(record));
    }
}

/// A caller-supplied handler for one category.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// One optional handler per diagnostic category.
///
/// Categories without a handler are dropped.
#[derive(Clone, Default)]
pub struct DiagnosticCallbacks {
    /// Handler for verbose records.
    pub on_verbose: Option<Callback<InformationalRecord>>,
    /// Handler for debug records.
    pub on_debug: Option<Callback<InformationalRecord>>,
    /// Handler for information records.
    pub on_information: Option<Callback<InformationRecord>>,
    /// Handler for warning records.
    pub on_warning: Option<Callback<InformationalRecord>>,
    /// Handler for error records.
    pub on_error: Option<Callback<ErrorRecord>>,
    /// Handler for progress records.
    pub on_progress: Option<Callback<ProgressRecord>>,
}

impl DiagnosticCallbacks {
    /// A callback set with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the verbose handler.
    pub fn with_verbose(
        mut self,
        f: impl Fn(&InformationalRecord) + Send + Sync + 'static,
    ) -> Self {
        self.on_verbose = Some(Arc::new(f));
        self
    }

    /// Set the debug handler.
    pub fn with_debug(
        mut self,
        f: impl Fn(&InformationalRecord) + Send + Sync + 'static,
    ) -> Self {
        self.on_debug = Some(Arc::new(f));
        self
    }

    /// Set the information handler.
    pub fn with_information(
        mut self,
        f: impl Fn(&InformationRecord) + Send + Sync + 'static,
    ) -> Self {
        self.on_information = Some(Arc::new(f));
        self
    }

    /// Set the warning handler.
    pub fn with_warning(
        mut self,
        f: impl Fn(&InformationalRecord) + Send + Sync + 'static,
    ) -> Self {
        self.on_warning = Some(Arc::new(f));
        self
    }

    /// Set the error handler.
    pub fn with_error(mut self, f: impl Fn(&ErrorRecord) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Set the progress handler.
    pub fn with_progress(mut self, f: impl Fn(&ProgressRecord) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Whether a handler is registered for the category.
    pub fn handles(&self, category: DiagnosticCategory) -> bool {
        match category {
            DiagnosticCategory::Verbose => self.on_verbose.is_some(),
            DiagnosticCategory::Debug => self.on_debug.is_some(),
            DiagnosticCategory::Information => self.on_information.is_some(),
            DiagnosticCategory::Warning => self.on_warning.is_some(),
            DiagnosticCategory::Error => self.on_error.is_some(),
            DiagnosticCategory::Progress => self.on_progress.is_some(),
        }
    }
}

impl fmt::Debug for DiagnosticCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<_> = DiagnosticCategory::ALL
            .into_iter()
            .filter(|c| self.handles(*c))
            .map(DiagnosticCategory::as_str)
            .collect();
        f.debug_struct("DiagnosticCallbacks")
            .field("registered", &registered)
            .finish()
    }
}
