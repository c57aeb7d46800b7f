use log::warn;
use tokio::sync::mpsc::UnboundedSender;

use crate::app::resource::normalize_path;

/// Handle that producers outside the request path (sensors, timers, other tasks) use to tell
/// the dispatcher a resource changed.  Observers of the resource and of anything below it
/// receive a notification rendered from the resource's current state.
///
/// Obtain one from [`crate::app::AppBuilder::notifier`] before the app is handed to the server.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: UnboundedSender<String>,
}

impl Notifier {
    pub(crate) fn new(tx: UnboundedSender<String>) -> Self {
        Self { tx }
    }

    pub fn notify_change(&self, path: &str) {
        if self.tx.send(normalize_path(path)).is_err() {
            warn!("Change to /{path} reported after the app shut down");
        }
    }
}
