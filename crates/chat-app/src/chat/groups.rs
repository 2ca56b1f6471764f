use super::message::{Message, Sender};

/// A visual run of consecutive same-sender messages.
///
/// `entries` index into the transcript; a group never owns or merges records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageGroup {
    pub sender: Sender,
    pub entries: Vec<GroupEntry>,
}

impl MessageGroup {
    /// True when the group ends with an error message, which offers a retry.
    pub fn is_retryable(&self) -> bool {
        self.entries.last().is_some_and(|entry| entry.message.error)
    }
}

/// One rendered message. `transcript_index` is `None` for messages that were shown
/// without being persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub message: Message,
    pub transcript_index: Option<usize>,
}

/// Sender-run grouping for the active session.
#[derive(Debug, Clone, Default)]
pub struct MessageGroups {
    groups: Vec<MessageGroup>,
    current_group_sender: Option<Sender>,
}

impl MessageGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the grouping for a freshly activated transcript.
    pub fn from_transcript(transcript: &[Message]) -> Self {
        let mut groups = Self::new();
        for (index, message) in transcript.iter().enumerate() {
            groups.push(message.clone(), Some(index));
        }
        groups
    }

    /// Places `message` in the open group when the sender matches, otherwise opens a new
    /// group. Returns the index of the group the message landed in.
    pub fn push(&mut self, message: Message, transcript_index: Option<usize>) -> usize {
        let sender = message.sender;
        let entry = GroupEntry {
            message,
            transcript_index,
        };

        match self.groups.last_mut() {
            Some(group) if self.current_group_sender == Some(sender) => {
                group.entries.push(entry);
            }
            _ => {
                self.groups.push(MessageGroup {
                    sender,
                    entries: vec![entry],
                });
                self.current_group_sender = Some(sender);
            }
        }

        self.groups.len() - 1
    }

    /// Removes the last group and reopens the one before it.
    pub fn remove_last(&mut self) -> Option<MessageGroup> {
        let removed = self.groups.pop();
        self.current_group_sender = self.groups.last().map(|group| group.sender);
        removed
    }

    pub fn last(&self) -> Option<&MessageGroup> {
        self.groups.last()
    }

    pub fn groups(&self) -> &[MessageGroup] {
        &self.groups
    }

    pub fn current_group_sender(&self) -> Option<Sender> {
        self.current_group_sender
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
