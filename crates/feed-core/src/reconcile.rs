//! Matching optimistic sends against confirmed messages.

use crate::types::{Message, PendingMessage, PendingStatus};

/// Whether `message` is the confirmed counterpart of `pending`.
///
/// Once the write has returned, only the returned id matches. Before that, the
/// display fields must all be equal. `created_at_ms` is never consulted.
pub fn is_echo_of(pending: &PendingMessage, message: &Message) -> bool {
    if pending.status == PendingStatus::Failed {
        return false;
    }
    match pending.confirmed_id {
        Some(id) => id == message.id,
        None => {
            pending.author_handle == message.author_handle
                && pending.body == message.body
                && pending.origin_tag == message.origin_tag
        }
    }
}

/// Index of the oldest pending entry matched by `message`.
///
/// Exact id matches win over field matches so a returned write is never
/// shadowed by an older look-alike.
pub fn find_echo(pending: &[PendingMessage], message: &Message) -> Option<usize> {
    pending
        .iter()
        .position(|entry| entry.confirmed_id == Some(message.id) && is_echo_of(entry, message))
        .or_else(|| {
            pending
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.confirmed_id.is_none() && is_echo_of(entry, message))
                .min_by_key(|(_, entry)| entry.submitted_at_ms)
                .map(|(index, _)| index)
        })
}
