//! Per-chat state container.
//!
//! Holds the ordered message list of one chat window and notifies observers
//! through a broadcast channel. Writes replace a whole message by id, so a
//! reader never sees a half-updated message.

use crate::error::ChatError;
use crate::models::{Message, MessageStatus};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum ChatEvent {
    MessageAdded(Message),
    MessageUpdated(Message),
    TurnFailed { message_id: Uuid, error: ChatError },
}

#[derive(Clone)]
pub struct ChatContext {
    window_id: Uuid,
    messages: Arc<Mutex<Vec<Message>>>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatContext {
    pub fn new(window_id: Uuid) -> Self {
        Self::with_messages(window_id, Vec::new())
    }

    /// Rebuilds a context from persisted history.
    pub fn with_messages(window_id: Uuid, messages: Vec<Message>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            window_id,
            messages: Arc::new(Mutex::new(messages)),
            events,
        }
    }

    pub fn window_id(&self) -> Uuid {
        self.window_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Message> {
        self.lock().iter().find(|m| m.id == id).cloned()
    }

    /// The assistant message currently pending or streaming, if any.
    pub fn in_flight(&self) -> Option<Message> {
        self.lock()
            .iter()
            .find(|m| !m.status.is_terminal())
            .cloned()
    }

    pub fn push(&self, message: Message) {
        self.lock().push(message.clone());
        self.emit(ChatEvent::MessageAdded(message));
    }

    /// Replaces the content of a non-terminal message. Returns false when the
    /// message is gone or already frozen.
    pub fn set_content(&self, id: Uuid, content: &str) -> bool {
        let updated = self.replace(id, |current| {
            if current.status.is_terminal() || current.content == content {
                return None;
            }
            let mut next = current.clone();
            next.content = content.to_string();
            Some(next)
        });
        match updated {
            Some(message) => {
                self.emit(ChatEvent::MessageUpdated(message));
                true
            }
            None => false,
        }
    }

    /// Moves a message to `next` if the transition is legal.
    pub fn transition(&self, id: Uuid, next: MessageStatus) -> Option<Message> {
        let updated = self.replace(id, |current| current.transitioned(next))?;
        self.emit(ChatEvent::MessageUpdated(updated.clone()));
        Some(updated)
    }

    /// Moves a message to the error state, recording `error`.
    pub fn fail(&self, id: Uuid, error: ChatError) -> Option<Message> {
        let updated = self.replace(id, |current| {
            let mut next = current.transitioned(MessageStatus::Error)?;
            next.error = Some(error.clone());
            Some(next)
        })?;
        self.emit(ChatEvent::MessageUpdated(updated.clone()));
        self.emit(ChatEvent::TurnFailed {
            message_id: id,
            error,
        });
        Some(updated)
    }

    /// Cancels a streaming message. Its content stays at the last committed
    /// value and is frozen from here on.
    pub fn cancel(&self, id: Uuid) -> Option<Message> {
        self.transition(id, MessageStatus::Cancelled)
    }

    fn replace(&self, id: Uuid, f: impl FnOnce(&Message) -> Option<Message>) -> Option<Message> {
        let mut messages = self.lock();
        let slot = messages.iter_mut().find(|m| m.id == id)?;
        let next = f(slot)?;
        *slot = next.clone();
        Some(next)
    }

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
