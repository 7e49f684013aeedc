//! Application callbacks invoked by the client driver

use crate::protocol::auth::AuthContext;
use crate::protocol::notification::PushNotification;

type AuthHandler = Box<dyn FnMut(&AuthContext) + Send>;
type TokenHandler = Box<dyn FnMut(&str) + Send>;
type PushHandler = Box<dyn FnMut(&PushNotification) + Send>;

/// Callbacks for the three events an application cares about.
///
/// Unset handlers do nothing. Each runs synchronously on the driver task,
/// so a handler that blocks stalls the connection.
pub struct EventHandlers {
    on_auth_updated: AuthHandler,
    on_token_issued: TokenHandler,
    on_push_received: PushHandler,
}

impl Default for EventHandlers {
    fn default() -> Self {
        Self {
            on_auth_updated: Box::new(ignore_auth),
            on_token_issued: Box::new(ignore_token),
            on_push_received: Box::new(ignore_push),
        }
    }
}

fn ignore_auth(_: &AuthContext) {}
fn ignore_token(_: &str) {}
fn ignore_push(_: &PushNotification) {}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_auth_updated(mut self, handler: impl FnMut(&AuthContext) + Send + 'static) -> Self {
        self.on_auth_updated = Box::new(handler);
        self
    }

    pub fn on_token_issued(mut self, handler: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_token_issued = Box::new(handler);
        self
    }

    pub fn on_push_received(
        mut self,
        handler: impl FnMut(&PushNotification) + Send + 'static,
    ) -> Self {
        self.on_push_received = Box::new(handler);
        self
    }

    pub(crate) fn auth_updated(&mut self, auth: &AuthContext) {
        (self.on_auth_updated)(auth)
    }

    pub(crate) fn token_issued(&mut self, token: &str) {
        (self.on_token_issued)(token)
    }

    pub(crate) fn push_received(&mut self, push: &PushNotification) {
        (self.on_push_received)(push)
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_default_handlers_are_noops() {
        let mut handlers = EventHandlers::default();
        handlers.auth_updated(&AuthContext::default());
        handlers.token_issued("t");
        handlers.push_received(&PushNotification::default());
    }

    #[test]
    fn test_registered_handlers_receive_events() {
        // Arrange
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tokens = Arc::clone(&seen);
        let pushes = Arc::clone(&seen);
        let mut handlers = EventHandlers::new()
            .on_token_issued(move |t| tokens.lock().unwrap().push(format!("token:{t}")))
            .on_push_received(move |p| {
                pushes
                    .lock()
                    .unwrap()
                    .push(format!("push:{}", p.token.clone().unwrap_or_default()))
            });

        // Act
        handlers.token_issued("abc");
        handlers.push_received(&PushNotification {
            token: Some("xyz".to_string()),
            ..Default::default()
        });

        // Assert
        assert_eq!(*seen.lock().unwrap(), vec!["token:abc", "push:xyz"]);
    }
}
