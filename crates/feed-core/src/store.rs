use crate::types::{Message, MessageId};

/// Ids added by one `merge` call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeResult {
    /// Newly inserted ids, ascending.
    pub added: Vec<MessageId>,
    /// Incoming messages whose id was already held.
    pub duplicates: usize,
    /// Oldest id held before the merge.
    pub previous_oldest: Option<MessageId>,
}

impl MergeResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
    }

    /// Added ids above the oldest id held before the merge. Nothing counts
    /// when the store was empty.
    pub fn added_inside_previous_window(&self) -> impl Iterator<Item = MessageId> + '_ {
        let floor = self.previous_oldest;
        self.added
            .iter()
            .copied()
            .filter(move |id| floor.is_some_and(|oldest| *id > oldest))
    }
}

/// Ordered, deduplicated message log for one scope.
///
/// `merge` is the only insertion path. It is idempotent and independent of
/// arrival order, so history pages, live inserts and write results can land
/// in any interleaving.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    items: Vec<Message>,
    max_retained: Option<usize>,
}

impl MessageStore {
    pub fn new(max_retained: Option<usize>) -> Self {
        Self {
            items: Vec::new(),
            max_retained: max_retained.map(|cap| cap.max(1)),
        }
    }

    /// Messages ascending by id.
    pub fn messages(&self) -> &[Message] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pagination cursor: the smallest held id.
    pub fn oldest_id(&self) -> Option<MessageId> {
        self.items.first().map(|message| message.id)
    }

    pub fn newest_id(&self) -> Option<MessageId> {
        self.items.last().map(|message| message.id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.position(id).is_ok()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.position(id).ok().map(|index| &self.items[index])
    }

    pub fn merge_one(&mut self, message: Message) -> MergeResult {
        self.merge(std::iter::once(message))
    }

    /// Insert every message whose id is not already held, keeping id order.
    pub fn merge<I>(&mut self, incoming: I) -> MergeResult
    where
        I: IntoIterator<Item = Message>,
    {
        let mut result = MergeResult {
            previous_oldest: self.oldest_id(),
            ..MergeResult::default()
        };

        for message in incoming {
            let id = message.id;
            if self.newest_id().is_none_or(|newest| id > newest) {
                self.items.push(message);
                result.added.push(id);
                continue;
            }
            match self.position(id) {
                Ok(_) => result.duplicates += 1,
                Err(index) => {
                    self.items.insert(index, message);
                    result.added.push(id);
                }
            }
        }

        result.added.sort_unstable();
        result
    }

    /// Drop every message with an id strictly below `cursor`.
    pub fn evict_older_than(&mut self, cursor: MessageId) -> usize {
        let keep_from = match self.position(cursor) {
            Ok(index) | Err(index) => index,
        };
        self.items.drain(0..keep_from);
        keep_from
    }

    /// Apply the retention cap, evicting the oldest messages beyond it.
    pub fn enforce_retention(&mut self) -> usize {
        let Some(max) = self.max_retained else {
            return 0;
        };
        if self.items.len() <= max {
            return 0;
        }
        let cursor = self.items[self.items.len() - max].id;
        self.evict_older_than(cursor)
    }

    fn position(&self, id: MessageId) -> Result<usize, usize> {
        self.items.binary_search_by_key(&id, |message| message.id)
    }
}
