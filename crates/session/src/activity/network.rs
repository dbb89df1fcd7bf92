// Network boundary for activities.
//
// Outbound, fired activities are wrapped in a batch tagged with the session
// id and sent to every remote participant. Inbound, batches for the session
// are routed to `Session::receive`.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tandem_common::activity::Activity;
use tandem_common::protocol::packet::{ActivityBatch, Message, Packet};
use tandem_common::types::UserId;
use tracing::{debug, warn};

use crate::session::Session;
use crate::transport::{activity_filter, ListenerId, Transport};

/// Outbound path for activities fired in a session.
pub trait ActivitySink: Send + Sync {
    fn send_activities(&self, recipients: &[UserId], activities: &[Activity]);
}

pub struct NetworkActivityBridge {
    transport: Arc<dyn Transport>,
    session_id: String,
    listener: Mutex<Option<ListenerId>>,
}

impl NetworkActivityBridge {
    /// Start routing inbound batches for `session` and install the bridge as
    /// its outbound sink.
    pub fn attach(transport: Arc<dyn Transport>, session: &Arc<Session>) -> Arc<Self> {
        let weak: Weak<Session> = Arc::downgrade(session);
        let listener = transport.add_listener(
            activity_filter(session.id()),
            Arc::new(move |packet: Packet| {
                let Message::Activities(batch) = packet.message else {
                    return;
                };
                match weak.upgrade() {
                    Some(session) => session.receive(&packet.from, batch.activities),
                    None => debug!(from = %packet.from, "session gone; dropping activities"),
                }
            }),
        );

        let bridge = Arc::new(Self {
            transport,
            session_id: session.id().to_string(),
            listener: Mutex::new(Some(listener)),
        });
        session.set_activity_sink(Some(bridge.clone()));
        bridge
    }

    pub fn detach(&self) {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            self.transport.remove_listener(listener);
        }
    }
}

impl ActivitySink for NetworkActivityBridge {
    fn send_activities(&self, recipients: &[UserId], activities: &[Activity]) {
        for recipient in recipients {
            let batch = ActivityBatch {
                session_id: self.session_id.clone(),
                activities: activities.to_vec(),
            };
            if let Err(error) = self.transport.send(recipient, batch.into()) {
                warn!(
                    session_id = %self.session_id,
                    peer = %recipient,
                    error = %error,
                    "failed to send activities"
                );
            }
        }
    }
}

impl Drop for NetworkActivityBridge {
    fn drop(&mut self) {
        self.detach();
    }
}
