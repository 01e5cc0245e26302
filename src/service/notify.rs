use crate::domain::AlertOpened;
use crate::ports::Notifier;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Bounded, best-effort hand-off from ingestion to the notifier.
///
/// `enqueue` never waits. Overflow and notifier failures are logged and
/// counted; nothing flows back to the caller.
#[derive(Clone)]
pub struct NotificationQueue {
    sender: mpsc::Sender<AlertOpened>,
}

impl NotificationQueue {
    pub fn spawn(notifier: Arc<dyn Notifier>, capacity: usize, concurrency: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_dispatcher(receiver, notifier, concurrency.max(1)));
        (Self { sender }, handle)
    }

    pub fn enqueue(&self, event: AlertOpened) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(alert_id = event.alert_id, device_id = %event.device_id, "Notification queue full, dropping");
                metrics::counter!("notifications_dropped_total", 1, "reason" => "queue_full");
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(alert_id = event.alert_id, device_id = %event.device_id, "Notification dispatcher stopped, dropping");
                metrics::counter!("notifications_dropped_total", 1, "reason" => "closed");
                false
            }
        }
    }
}

async fn run_dispatcher(mut receiver: Receiver<AlertOpened>, notifier: Arc<dyn Notifier>, concurrency: usize) {
    info!("Notification dispatcher starting with {} slots", concurrency);
    let semaphore = Arc::new(Semaphore::new(concurrency));

    while let Some(event) = receiver.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                error!("Semaphore closed");
                break;
            }
        };
        let notifier = notifier.clone();

        tokio::spawn(async move {
            let _permit = permit; // Hold permit until delivery finishes
            match notifier.notify_alert_opened(&event).await {
                Ok(()) => {
                    metrics::counter!("notifications_sent_total", 1);
                }
                Err(e) => {
                    error!(alert_id = event.alert_id, device_id = %event.device_id, "Notification failed: {:?}", e);
                    metrics::counter!("notifications_failed_total", 1);
                }
            }
        });
    }

    // Wait for in-flight deliveries before reporting shutdown
    let _ = semaphore.acquire_many(concurrency as u32).await;
    info!("Notification dispatcher shutting down");
}
