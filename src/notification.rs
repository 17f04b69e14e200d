//! Notification sink abstraction.
//!
//! The engine tells parties about new, accepted, declined and confirmed requests
//! through a [`NotificationSink`]. Delivery is fire-and-forget: a sink only reports
//! whether it accepted the notification.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::book::UserId;
use crate::error::Result;

/// Accepts notifications for delivery.
///
/// # Example
/// ```ignore
/// let sink = LoggingNotificationSink;
/// sink.send(user_id, "exchange request", "You have new exchange request for your book Dune.").await?;
/// ```
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Hand a notification over for delivery.
    ///
    /// # Errors
    /// Returns an error if the sink could not accept the notification. The engine
    /// reports this as a side-effect failure; it never rolls back a committed
    /// transition because of it.
    async fn send(&self, recipient: UserId, category: &str, message: &str) -> Result<()>;
}

/// Sink that only writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn send(&self, recipient: UserId, category: &str, message: &str) -> Result<()> {
        tracing::info!(recipient = %recipient, category, message, "Notification");
        Ok(())
    }
}

/// Sink that stores notifications in the `notifications` table, for the
/// in-app inbox.
#[cfg(feature = "postgres")]
#[derive(Clone)]
pub struct PgNotificationSink {
    pool: sqlx::PgPool,
}

#[cfg(feature = "postgres")]
impl PgNotificationSink {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl NotificationSink for PgNotificationSink {
    #[tracing::instrument(skip(self, message), fields(recipient = %recipient))]
    async fn send(&self, recipient: UserId, category: &str, message: &str) -> Result<()> {
        sqlx::query("INSERT INTO notifications (user_id, category, message) VALUES ($1, $2, $3)")
            .bind(recipient.0)
            .bind(category)
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                crate::error::ExchangeError::Internal(anyhow::anyhow!(
                    "Failed to store notification: {}",
                    e
                ))
            })?;
        Ok(())
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// A notification recorded by [`MockNotificationSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub recipient: UserId,
    pub category: String,
    pub message: String,
}

/// Mock sink for testing.
///
/// Records every accepted notification and can be told to reject notifications
/// for particular recipients.
#[derive(Clone, Default)]
pub struct MockNotificationSink {
    sent: Arc<Mutex<Vec<SentNotification>>>,
    failing_recipients: Arc<Mutex<HashSet<UserId>>>,
}

impl MockNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every subsequent notification addressed to `recipient`.
    pub fn fail_for(&self, recipient: UserId) {
        self.failing_recipients.lock().insert(recipient);
    }

    /// Accept notifications for every recipient again.
    pub fn recover(&self) {
        self.failing_recipients.lock().clear();
    }

    /// All notifications accepted so far, in order.
    pub fn get_sent(&self) -> Vec<SentNotification> {
        self.sent.lock().clone()
    }

    /// Notifications accepted for one recipient, in order.
    pub fn sent_to(&self, recipient: UserId) -> Vec<SentNotification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.recipient == recipient)
            .cloned()
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl NotificationSink for MockNotificationSink {
    async fn send(&self, recipient: UserId, category: &str, message: &str) -> Result<()> {
        if self.failing_recipients.lock().contains(&recipient) {
            return Err(crate::error::ExchangeError::Internal(anyhow::anyhow!(
                "notification sink rejected message for {}",
                recipient
            )));
        }

        self.sent.lock().push(SentNotification {
            recipient,
            category: category.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
