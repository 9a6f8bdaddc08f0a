//! Routing of untyped diagnostic notices to typed callbacks.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use tokio_util::sync::CancellationToken;

use crate::{
    diagnostics::{
        DiagnosticCallbacks, DiagnosticCategory, DiagnosticFeed, DiagnosticNotice,
        DiagnosticRecord, DiagnosticStreams,
    },
    error::CallbackFault,
};

/// Type-erased handler stored in the dispatch table.
type Handler = Arc<dyn Fn(&DiagnosticRecord) + Send + Sync>;

/// Adapt a typed callback to the table's handler shape.
macro_rules! handler {
    ($callback:expr, $variant:ident) => {
        $callback.clone().map(|f| -> Handler {
            Arc::new(move |record: &DiagnosticRecord| {
                if let DiagnosticRecord::$variant(payload) = record {
                    f(payload)
                }
            })
        })
    };
}

/// Delivers notices from one call's feed to the registered callbacks.
///
/// The callbacks are resolved once into a table indexed by
/// [`DiagnosticCategory::index`]. Notices for categories without a callback are
/// dropped. A panicking callback is recorded as a [`CallbackFault`] and
/// delivery continues with the next notice.
pub struct DiagnosticDispatcher {
    table: [Option<Handler>; DiagnosticCategory::COUNT],
    faults: Vec<CallbackFault>,
}

impl DiagnosticDispatcher {
    /// Build the dispatch table from a callback set.
    pub fn new(callbacks: &DiagnosticCallbacks) -> Self {
        Self {
            table: [
                handler!(callbacks.on_verbose, Verbose),
                handler!(callbacks.on_debug, Debug),
                handler!(callbacks.on_information, Information),
                handler!(callbacks.on_warning, Warning),
                handler!(callbacks.on_error, Error),
                handler!(callbacks.on_progress, Progress),
            ],
            faults: Vec::new(),
        }
    }

    /// Deliver a single notice, resolving it against `streams`.
    pub fn dispatch(&mut self, streams: &Mutex<DiagnosticStreams>, notice: DiagnosticNotice) {
        let Some(handler) = &self.table[notice.category.index()] else {
            tracing::trace!(
                "no callback for {} record {}, dropping",
                notice.category,
                notice.index
            );
            return;
        };

        // Copy the record out so the log is not locked while the callback runs.
        let record = {
            let streams = streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.get(notice.category, notice.index).cloned()
        };
        let Some(record) = record else {
            tracing::warn!(
                "notice for missing {} record {}",
                notice.category,
                notice.index
            );
            return;
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(&record))) {
            let message = panic_message(payload.as_ref());
            tracing::debug!("{} callback panicked: {}", notice.category, message);
            self.faults.push(CallbackFault {
                category: notice.category,
                index: notice.index,
                message,
            });
        }
    }

    /// Faults captured so far.
    pub fn faults(&self) -> &[CallbackFault] {
        &self.faults
    }

    /// Deliver notices until the feed closes or `stop` fires.
    ///
    /// On `stop`, the notices queued at that moment are still delivered;
    /// anything emitted afterwards is left undelivered.
    pub async fn run(
        mut self,
        mut feed: DiagnosticFeed,
        stop: CancellationToken,
    ) -> Vec<CallbackFault> {
        loop {
            tokio::select! {
                biased;

                () = stop.cancelled() => {
                    let queued = feed.notices.len();
                    for _ in 0..queued {
                        let Ok(notice) = feed.notices.try_recv() else {
                            break;
                        };
                        self.dispatch(&feed.streams, notice);
                    }
                    break;
                }

                notice = feed.notices.recv() => match notice {
                    Some(notice) => self.dispatch(&feed.streams, notice),
                    None => break,
                },
            }
        }
        self.faults
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
