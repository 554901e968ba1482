use std::collections::HashSet;

use crate::{
    store::{MergeResult, MessageStore},
    types::{MessageId, ViewportGeometry},
};

pub const DEFAULT_TOP_THRESHOLD_PX: f32 = 80.0;
pub const DEFAULT_BOTTOM_THRESHOLD_PX: f32 = 48.0;

/// Where merged messages came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOrigin {
    /// Initial or older history page.
    History,
    /// Latest page re-fetched after (re)connect.
    Backfill,
    /// Insert event from the push channel.
    Live,
    /// Result of a local write.
    OwnWrite,
}

/// Reaction requested by a viewport change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewportAction {
    /// Start an older-page load.
    pub request_older: bool,
    /// Viewport just reached the bottom; the feed is caught up.
    pub caught_up: bool,
}

/// Viewport tracker driving auto-pagination and the unread counter.
#[derive(Debug, Clone)]
pub struct ScrollAnchor {
    at_top: bool,
    at_bottom: bool,
    loading_older: bool,
    unread: u64,
    local_authors: HashSet<String>,
    top_threshold_px: f32,
    bottom_threshold_px: f32,
}

impl Default for ScrollAnchor {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_THRESHOLD_PX, DEFAULT_BOTTOM_THRESHOLD_PX)
    }
}

impl ScrollAnchor {
    /// A new feed is rendered scrolled to the bottom.
    pub fn new(top_threshold_px: f32, bottom_threshold_px: f32) -> Self {
        Self {
            at_top: false,
            at_bottom: true,
            loading_older: false,
            unread: 0,
            local_authors: HashSet::new(),
            top_threshold_px,
            bottom_threshold_px,
        }
    }

    pub fn at_top(&self) -> bool {
        self.at_top
    }

    pub fn at_bottom(&self) -> bool {
        self.at_bottom
    }

    pub fn unread_count(&self) -> u64 {
        self.unread
    }

    pub fn is_loading_older(&self) -> bool {
        self.loading_older
    }

    /// Messages by this handle never count as unread.
    pub fn add_local_author(&mut self, handle: impl Into<String>) {
        self.local_authors.insert(handle.into());
    }

    pub fn observe_geometry(&mut self, geometry: ViewportGeometry) -> ViewportAction {
        let (at_top, at_bottom) =
            edges_for(geometry, self.top_threshold_px, self.bottom_threshold_px);
        self.observe_edges(at_top, at_bottom)
    }

    pub fn observe_edges(&mut self, at_top: bool, at_bottom: bool) -> ViewportAction {
        let mut action = ViewportAction::default();

        if at_top && !self.at_top && !self.loading_older {
            self.loading_older = true;
            action.request_older = true;
        }
        if at_bottom && !self.at_bottom {
            action.caught_up = true;
        }

        self.at_top = at_top;
        self.at_bottom = at_bottom;
        if at_bottom {
            self.unread = 0;
        }
        action
    }

    /// Record an older-page load not triggered by scrolling (e.g. a button).
    pub fn mark_loading_older(&mut self) {
        self.loading_older = true;
    }

    /// The in-flight older-page load finished, successfully or not.
    pub fn on_older_page_settled(&mut self) {
        self.loading_older = false;
    }

    /// Count new foreign messages while the viewport is away from the bottom.
    ///
    /// Live inserts and own writes count wherever they land in id order.
    /// Backfill additions count only above the oldest id held before the
    /// merge. Returns the increment applied.
    pub fn on_merged(
        &mut self,
        result: &MergeResult,
        store: &MessageStore,
        origin: MergeOrigin,
    ) -> u64 {
        if self.at_bottom || origin == MergeOrigin::History {
            return 0;
        }

        let added: Box<dyn Iterator<Item = MessageId> + '_> = match origin {
            MergeOrigin::Backfill => Box::new(result.added_inside_previous_window()),
            _ => Box::new(result.added.iter().copied()),
        };
        let increment = added
            .filter_map(|id| store.get(id))
            .filter(|message| !self.local_authors.contains(&message.author_handle))
            .count() as u64;
        self.unread = self.unread.saturating_add(increment);
        increment
    }
}

/// Derive `(at_top, at_bottom)` from raw geometry.
pub fn edges_for(
    geometry: ViewportGeometry,
    top_threshold_px: f32,
    bottom_threshold_px: f32,
) -> (bool, bool) {
    let offset = geometry.offset_px.max(0.0);
    let viewport = geometry.viewport_height_px.max(0.0);
    let content = geometry.content_height_px.max(0.0);

    if content <= viewport {
        return (true, true);
    }

    let remaining_below = content - (offset + viewport);
    (
        offset <= top_threshold_px,
        remaining_below <= bottom_threshold_px,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, MessageId, OriginTag};

    fn message(id: u64, author: &str) -> Message {
        Message {
            id: MessageId(id),
            author_handle: author.to_owned(),
            body: "x".to_owned(),
            origin_tag: OriginTag::Anonymous,
            created_at_ms: 0,
        }
    }

    #[test]
    fn counts_new_foreign_messages_away_from_bottom() {
        let mut store = MessageStore::default();
        store.merge([message(1, "bob")]);
        let mut anchor = ScrollAnchor::default();
        anchor.add_local_author("alice");
        anchor.observe_edges(false, false);

        let result = store.merge([message(2, "bob"), message(3, "carol"), message(4, "alice")]);
        assert_eq!(anchor.on_merged(&result, &store, MergeOrigin::Live), 2);
        assert_eq!(anchor.unread_count(), 2);

        anchor.observe_edges(false, true);
        assert_eq!(anchor.unread_count(), 0);
    }

    #[test]
    fn merges_at_bottom_never_count() {
        let mut store = MessageStore::default();
        let mut anchor = ScrollAnchor::default();
        let result = store.merge([message(1, "bob"), message(2, "bob")]);
        assert_eq!(anchor.on_merged(&result, &store, MergeOrigin::Live), 0);
        assert_eq!(anchor.unread_count(), 0);
    }

    #[test]
    fn history_pages_never_count_and_backfill_counts_inside_window() {
        let mut store = MessageStore::default();
        store.merge([message(10, "bob")]);
        let mut anchor = ScrollAnchor::default();
        anchor.observe_edges(false, false);

        let older = store.merge([message(7, "bob"), message(8, "bob")]);
        assert_eq!(anchor.on_merged(&older, &store, MergeOrigin::History), 0);

        let backfill = store.merge([
            message(5, "bob"),
            message(9, "bob"),
            message(10, "bob"),
            message(11, "bob"),
        ]);
        assert_eq!(anchor.on_merged(&backfill, &store, MergeOrigin::Backfill), 2);
        assert_eq!(anchor.unread_count(), 2);
    }

    #[test]
    fn live_insert_below_own_write_still_counts() {
        let mut store = MessageStore::default();
        store.merge([message(10, "bob")]);
        let mut anchor = ScrollAnchor::default();
        anchor.add_local_author("alice");
        anchor.observe_edges(false, false);

        let own = store.merge_one(message(12, "alice"));
        assert_eq!(anchor.on_merged(&own, &store, MergeOrigin::OwnWrite), 0);

        let foreign = store.merge_one(message(11, "bob"));
        assert_eq!(anchor.on_merged(&foreign, &store, MergeOrigin::Live), 1);
        assert_eq!(anchor.unread_count(), 1);
    }

    #[test]
    fn top_crossing_requests_exactly_once_while_loading() {
        let mut anchor = ScrollAnchor::default();
        anchor.observe_edges(false, false);

        assert!(anchor.observe_edges(true, false).request_older);
        assert!(!anchor.observe_edges(true, false).request_older);
        anchor.observe_edges(false, false);
        assert!(!anchor.observe_edges(true, false).request_older);

        anchor.on_older_page_settled();
        assert!(!anchor.observe_edges(true, false).request_older);
        anchor.observe_edges(false, false);
        assert!(anchor.observe_edges(true, false).request_older);
    }

    #[test]
    fn reaching_bottom_reports_caught_up() {
        let mut anchor = ScrollAnchor::default();
        assert!(!anchor.observe_edges(false, true).caught_up);
        anchor.observe_edges(false, false);
        assert!(anchor.observe_edges(false, true).caught_up);
    }

    #[test]
    fn derives_edges_from_geometry() {
        let geometry = |offset_px| ViewportGeometry {
            offset_px,
            viewport_height_px: 600.0,
            content_height_px: 3_000.0,
        };

        assert_eq!(edges_for(geometry(0.0), 80.0, 48.0), (true, false));
        assert_eq!(edges_for(geometry(1_200.0), 80.0, 48.0), (false, false));
        assert_eq!(edges_for(geometry(2_380.0), 80.0, 48.0), (false, true));

        let short = ViewportGeometry {
            offset_px: 0.0,
            viewport_height_px: 600.0,
            content_height_px: 200.0,
        };
        assert_eq!(edges_for(short, 80.0, 48.0), (true, true));
    }
}
