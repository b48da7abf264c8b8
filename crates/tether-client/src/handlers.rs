//! Feature-level response dispatch.
//!
//! Core handshake messages are matched exhaustively by the orchestrator.
//! Everything else arrives as a [`FeatureMessage`] and is offered to the
//! registered handlers in registration order until one claims it.

use std::sync::Arc;

use tether_protocol::FeatureMessage;

use crate::ConnectionState;

/// A feature API built on an established session.
pub trait FeatureHandler: Send + Sync + 'static {
    /// Returns `true` if this handler consumed the message.
    fn handle_response(&self, message: &FeatureMessage) -> bool;

    fn on_state_changed(&self, _state: ConnectionState) {}
}

/// Ordered, first-match-wins list of feature handlers.
#[derive(Default, Clone)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn FeatureHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handler: Arc<dyn FeatureHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Offers `message` to each handler in turn. Returns `true` if one
    /// claimed it.
    pub fn dispatch(&self, message: &FeatureMessage) -> bool {
        let claimed = self.handlers.iter().any(|h| h.handle_response(message));
        if !claimed {
            tracing::debug!(kind = %message.kind, "no handler claimed feature message");
        }
        claimed
    }

    pub fn on_state_changed(&self, state: ConnectionState) {
        for handler in &self.handlers {
            handler.on_state_changed(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Claims {
        prefix: &'static str,
        seen: Mutex<Vec<String>>,
    }

    impl Claims {
        fn new(prefix: &'static str) -> Arc<Self> {
            Arc::new(Self {
                prefix,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl FeatureHandler for Claims {
        fn handle_response(&self, message: &FeatureMessage) -> bool {
            self.seen.lock().unwrap().push(message.kind.clone());
            message.kind.starts_with(self.prefix)
        }
    }

    #[test]
    fn test_dispatch_first_claiming_handler_stops_chain() {
        let friends = Claims::new("friends.");
        let any = Claims::new("");
        let mut chain = HandlerChain::new();
        chain.push(friends.clone());
        chain.push(any.clone());

        assert!(chain.dispatch(&FeatureMessage::new("friends.list", vec![])));

        assert_eq!(friends.seen(), vec!["friends.list"]);
        assert!(any.seen().is_empty());
    }

    #[test]
    fn test_dispatch_falls_through_to_later_handler() {
        let friends = Claims::new("friends.");
        let groups = Claims::new("groups.");
        let mut chain = HandlerChain::new();
        chain.push(friends.clone());
        chain.push(groups.clone());

        assert!(chain.dispatch(&FeatureMessage::new("groups.join", vec![])));
        assert_eq!(friends.seen(), vec!["groups.join"]);
        assert_eq!(groups.seen(), vec!["groups.join"]);
    }

    #[test]
    fn test_dispatch_unclaimed_returns_false() {
        let mut chain = HandlerChain::new();
        chain.push(Claims::new("friends."));
        assert!(!chain.dispatch(&FeatureMessage::new("textures.get", vec![])));
        assert!(!HandlerChain::new().dispatch(&FeatureMessage::new("x", vec![])));
    }
}
