//! Read side of a store as seen by other applications.

use std::fmt;
use std::sync::Arc;

use crate::error::StorageError;
use crate::event::Notification;
use crate::storage::EventStorage;

/// The globally ordered log of every event in one store, published under an
/// application name.
///
/// Positions never change once assigned and have no gaps, so a consumer
/// that remembers the last position it handled can always resume exactly
/// where it left off.
#[derive(Clone)]
pub struct NotificationLog {
    name: Arc<str>,
    storage: Arc<dyn EventStorage>,
}

impl fmt::Debug for NotificationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationLog")
            .field("name", &self.name)
            .finish()
    }
}

impl NotificationLog {
    /// Publish `storage`'s events under `name`.
    pub fn new(name: impl Into<String>, storage: Arc<dyn EventStorage>) -> Self {
        Self {
            name: Arc::from(name.into()),
            storage,
        }
    }

    /// Name of the application that owns this log.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read up to `limit` notifications with `position > after_position`,
    /// in position order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend read fails.
    pub fn read_notifications(
        &self,
        after_position: u64,
        limit: usize,
    ) -> Result<Vec<Notification>, StorageError> {
        let events = self.storage.read_notifications(after_position, limit)?;
        Ok(events.into_iter().map(Notification::from).collect())
    }

    /// Position of the newest notification (0 when the log is empty).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend read fails.
    pub fn head(&self) -> Result<u64, StorageError> {
        self.storage.head_position()
    }

    /// Iterate the log in pages of `page_size` starting after
    /// `after_position`.
    ///
    /// The iterator stops at the first empty page. It can be resumed later
    /// from [`Pages::position`].
    pub fn pages(&self, after_position: u64, page_size: usize) -> Pages<'_> {
        Pages {
            log: self,
            position: after_position,
            page_size: page_size.max(1),
            done: false,
        }
    }
}

/// Page-at-a-time cursor over a [`NotificationLog`].
#[derive(Debug)]
pub struct Pages<'a> {
    log: &'a NotificationLog,
    position: u64,
    page_size: usize,
    done: bool,
}

impl Pages<'_> {
    /// Position of the last notification yielded so far.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Iterator for Pages<'_> {
    type Item = Result<Vec<Notification>, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.log.read_notifications(self.position, self.page_size) {
            Ok(page) if page.is_empty() => {
                self.done = true;
                None
            }
            Ok(page) => {
                if let Some(last) = page.last() {
                    self.position = last.position;
                }
                Some(Ok(page))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::event::{EventMetadata, ProposedEvent};
    use crate::store::EventStore;

    fn seeded(n: usize) -> EventStore {
        let store = EventStore::in_memory();
        for i in 0..n {
            store
                .append(
                    Uuid::new_v4(),
                    0,
                    vec![ProposedEvent {
                        event_id: Uuid::new_v4(),
                        event_type: format!("E{i}"),
                        payload: serde_json::Value::Null,
                        metadata: EventMetadata::default(),
                    }],
                )
                .unwrap();
        }
        store
    }

    #[test]
    fn read_respects_position_and_limit() {
        let log = seeded(5).notification_log("email");
        let page = log.read_notifications(1, 2).unwrap();
        assert_eq!(
            page.iter().map(|n| n.position).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(page[0].event_type, "E1");
        assert_eq!(log.head().unwrap(), 5);
        assert_eq!(log.name(), "email");
    }

    #[test]
    fn reads_are_stable() {
        let log = seeded(3).notification_log("email");
        let first = log.read_notifications(0, 10).unwrap();
        let second = log.read_notifications(0, 10).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn pages_cover_the_log_once_and_resume() {
        let store = seeded(5);
        let log = store.notification_log("email");

        let mut pages = log.pages(0, 2);
        let sizes: Vec<usize> = pages.by_ref().map(|p| p.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let resume_at = pages.position();
        assert_eq!(resume_at, 5);

        let log = seeded(0).notification_log("other");
        assert_eq!(log.pages(0, 10).count(), 0);

        // Nothing new after the resume point.
        let log = store.notification_log("email");
        assert_eq!(log.pages(resume_at, 2).count(), 0);
    }
}
