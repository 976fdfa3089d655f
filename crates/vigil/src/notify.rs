//! Violation notifications: a broadcast-only channel to userspace listeners.
//!
//! Every verification failure (except an interrupted measurement, which is
//! not a violation) produces one textual record and broadcasts it to all
//! subscribers. Delivery is fire-and-forget: a full or disconnected
//! listener is skipped silently and disconnected listeners are pruned. The
//! engine never reads from this channel; the gateway refuses userspace
//! sends on the notification protocol number.
//!
//! Record format (the leading newline is part of the format):
//!
//! ```text
//! \nFail: <code> (<message>)\nMethod: <hook>\nProcess: <name>\nFile: <path>\n
//! ```
//!
//! Newlines and backslashes inside the path are escaped as three-digit
//! octal (`\012`, `\134`) so a record always spans exactly five lines.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use log::error;

use crate::types::{Hook, Reason};

/// Protocol number of the notification channel. Userspace sends on this
/// protocol are rejected by the gateway.
pub const NOTIFY_PROTOCOL: u32 = 25;

/// Records buffered per listener before new ones are dropped.
const LISTENER_QUEUE: usize = 64;

/// Broadcast sender for violation records.
pub struct Notifier {
    listeners: Mutex<Vec<SyncSender<String>>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. Each record is delivered to every receiver
    /// alive at notification time.
    pub fn subscribe(&self) -> Receiver<String> {
        let (tx, rx) = mpsc::sync_channel(LISTENER_QUEUE);
        self.listeners
            .lock()
            .expect("notifier lock poisoned")
            .push(tx);
        rx
    }

    /// Broadcast a violation. Interrupted measurements are suppressed — the
    /// caller may retry and nothing wrong happened.
    pub fn notify(&self, reason: Reason, hook: Hook, process: &str, path: Option<&Path>) {
        if reason == Reason::Interrupted {
            return;
        }
        let path = match path {
            Some(path) => escape_path(&path.to_string_lossy()),
            None => {
                error!("violation notification dropped: file path unavailable");
                return;
            }
        };
        let record = format!(
            "\nFail: {} ({})\nMethod: {}\nProcess: {}\nFile: {}\n",
            reason.code(),
            reason.message(),
            hook.code(),
            process,
            path,
        );
        let mut listeners = self.listeners.lock().expect("notifier lock poisoned");
        listeners.retain(|listener| match listener.try_send(record.clone()) {
            Ok(()) => true,
            // Slow listener: drop this record, keep the listener.
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Number of live listeners (for tests and diagnostics).
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().expect("notifier lock poisoned").len()
    }
}

/// Escape newline and backslash as three-digit octal sequences.
pub fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for ch in path.chars() {
        match ch {
            '\n' => out.push_str("\\012"),
            '\\' => out.push_str("\\134"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_violation_record_format() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe();
        notifier.notify(
            Reason::BadHash,
            Hook::Exec,
            "sh",
            Some(&PathBuf::from("/bin/app")),
        );
        let record = rx.try_recv().expect("record delivered");
        assert_eq!(
            record,
            "\nFail: 4 (incorrect hash)\nMethod: 3\nProcess: sh\nFile: /bin/app\n"
        );
    }

    #[test]
    fn test_interrupted_is_not_broadcast() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe();
        notifier.notify(
            Reason::Interrupted,
            Hook::Exec,
            "sh",
            Some(&PathBuf::from("/bin/app")),
        );
        assert!(rx.try_recv().is_err(), "interrupted must not be reported");
    }

    #[test]
    fn test_missing_path_drops_record() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe();
        notifier.notify(Reason::BadHash, Hook::Exec, "sh", None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_reaches_all_listeners() {
        let notifier = Notifier::new();
        let rx1 = notifier.subscribe();
        let rx2 = notifier.subscribe();
        notifier.notify(
            Reason::SourceId,
            Hook::Mmap,
            "loader",
            Some(&PathBuf::from("/lib/libx.so")),
        );
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_disconnected_listener_is_pruned() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe();
        drop(rx);
        assert_eq!(notifier.listener_count(), 1);
        notifier.notify(
            Reason::BadHash,
            Hook::Exec,
            "sh",
            Some(&PathBuf::from("/bin/app")),
        );
        assert_eq!(notifier.listener_count(), 0, "gone listeners are dropped");
    }

    #[test]
    fn test_no_listeners_is_fine() {
        let notifier = Notifier::new();
        notifier.notify(
            Reason::BadHash,
            Hook::Exec,
            "sh",
            Some(&PathBuf::from("/bin/app")),
        );
    }

    #[test]
    fn test_path_escaping() {
        assert_eq!(escape_path("/plain/path"), "/plain/path");
        assert_eq!(escape_path("/evil\nname"), "/evil\\012name");
        assert_eq!(escape_path("back\\slash"), "back\\134slash");
    }

    #[test]
    fn test_escaped_record_spans_five_lines() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe();
        notifier.notify(
            Reason::Attribute,
            Hook::DataOpen,
            "cat",
            Some(&PathBuf::from("/tmp/has\nnewline")),
        );
        let record = rx.try_recv().expect("record delivered");
        // Leading newline plus four field lines.
        assert_eq!(record.matches('\n').count(), 5, "record was: {record:?}");
    }
}
