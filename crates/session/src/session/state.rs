// Applies session-wide activities (membership, permissions, colors) to the
// session state. Registered as a passive consumer so the state is updated
// before any visible consumer runs.

use std::sync::Weak;

use tandem_common::activity::Activity;
use tracing::{debug, info, warn};

use super::{Session, User};
use crate::activity::ActivityConsumer;

pub(crate) struct SessionStateConsumer {
    session: Weak<Session>,
}

impl SessionStateConsumer {
    pub(crate) fn new(session: Weak<Session>) -> Self {
        Self { session }
    }
}

impl ActivityConsumer for SessionStateConsumer {
    fn exec(&self, activity: &Activity) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        match activity {
            Activity::PermissionChange { source, affected, permission } => {
                if source != session.host() {
                    warn!(
                        source = %source,
                        affected = %affected,
                        "ignoring permission change not issued by the host"
                    );
                    return;
                }
                if session.set_permission(affected, *permission) {
                    info!(user = %affected, permission = %permission, "permission changed");
                }
            }
            Activity::ColorChange { source, affected, color } => {
                if source != affected && source != session.host() {
                    warn!(source = %source, affected = %affected, "ignoring foreign color change");
                    return;
                }
                session.set_color(affected, *color);
            }
            Activity::UserJoined { source, user } => {
                if source != session.host() {
                    warn!(
                        source = %source,
                        user = %user.id,
                        "ignoring join announced by a non-host"
                    );
                    return;
                }
                let joined = User::from_info(user.clone(), session.host(), session.local_user_id());
                if session.add_user(joined) {
                    info!(user = %user.id, "user joined the session");
                } else {
                    debug!(user = %user.id, "joined user already known");
                }
            }
            Activity::UserLeft { source, user } => {
                if source != user && source != session.host() {
                    warn!(
                        source = %source,
                        user = %user,
                        "ignoring departure announced by another user"
                    );
                    return;
                }
                if session.remove_user(user).is_some() {
                    info!(user = %user, "user left the session");
                }
            }
            Activity::TextEdit { .. } | Activity::Editor { .. } => {}
        }
    }
}
