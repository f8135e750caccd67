//! Client side keep-alive driven by the shared [`ActivityWatchdog`].
//!
//! When a link has been idle for the ping interval a `PingQuery` goes out.
//! If the link is still silent one interval after that ping, it is torn down
//! as failed.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use vireo_core::{ActiveObject, ActivityWatchdog, WatchId};

use crate::error::TransportResult;
use crate::network::connection::LinkActivity;

/// What the keep-alive needs from a transport.
pub(crate) trait KeepAliveLink: Send + Sync {
    fn link_name(&self) -> String;

    fn send_ping(&self) -> TransportResult<()>;

    fn fail_link(&self, reason: &str);
}

struct KeepAlive {
    link: Weak<dyn KeepAliveLink>,
    activity: Arc<LinkActivity>,
    interval: Duration,
}

impl ActiveObject for KeepAlive {
    fn last_activity(&self) -> Instant {
        self.activity.last_activity()
    }

    fn timeout_delay(&self) -> Duration {
        self.interval
    }

    fn on_activity_timeout(&self, now: Instant) -> bool {
        let Some(link) = self.link.upgrade() else {
            return false;
        };
        if self.activity.ping_pending() {
            warn!(transport = %link.link_name(), "No traffic since keep-alive ping, dropping link");
            link.fail_link("keep-alive ping unanswered");
            return false;
        }
        self.activity.ping_sent(now);
        match link.send_ping() {
            Ok(()) => {
                debug!(transport = %link.link_name(), "Sent keep-alive ping");
                true
            },
            Err(e) => {
                link.fail_link(&format!("cannot send keep-alive ping: {e}"));
                false
            },
        }
    }
}

/// Live watchdog registration. Dropping it stops the keep-alive.
pub(crate) struct KeepAliveRegistration {
    watchdog: Arc<ActivityWatchdog>,
    id: WatchId,
    _object: Arc<dyn ActiveObject>,
}

impl KeepAliveRegistration {
    pub fn register(
        watchdog: &Arc<ActivityWatchdog>,
        link: Weak<dyn KeepAliveLink>,
        activity: Arc<LinkActivity>,
        interval: Duration,
    ) -> Self {
        let object: Arc<dyn ActiveObject> = Arc::new(KeepAlive { link, activity, interval });
        let id = watchdog.register(&object);
        Self { watchdog: Arc::clone(watchdog), id, _object: object }
    }
}

impl Drop for KeepAliveRegistration {
    fn drop(&mut self) {
        self.watchdog.unregister(self.id);
    }
}

impl std::fmt::Debug for KeepAliveRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveRegistration").field("id", &self.id).finish_non_exhaustive()
    }
}
