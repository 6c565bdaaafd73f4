//! Backward pagination and scroll anchoring for the open conversation.
//!
//! The host view reports [`ScrollMetrics`]; the controller decides when to
//! fetch an older page, hands back a [`ScrollAnchor`] to restore the viewport
//! once the view has laid out the new items, and answers whether a new
//! arrival should pull the viewport to the bottom.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use scholaris_shared::{ApiError, Message};

use crate::api_client::ChatApi;
use crate::config::ChatConfig;
use crate::stores::SharedStore;

/// Viewport geometry as reported by the host view, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollMetrics {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }
}

/// Viewport position recorded right before an older page is fetched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    pub scroll_top: f64,
    pub scroll_height: f64,
}

impl ScrollAnchor {
    pub fn record(metrics: &ScrollMetrics) -> Self {
        Self {
            scroll_top: metrics.scroll_top,
            scroll_height: metrics.scroll_height,
        }
    }

    /// Scroll offset that keeps the same content in view once the view has
    /// grown to `new_scroll_height`. Call after layout, never before.
    pub fn restore(&self, new_scroll_height: f64) -> f64 {
        self.scroll_top + (new_scroll_height - self.scroll_height)
    }
}

/// Cursor to store after a fetch: the id of the oldest loaded message while
/// the server reports more pages, `None` once it reports none.
pub fn cursor_after_fetch(server_has_more: bool, loaded: &[Message]) -> Option<i64> {
    if !server_has_more {
        return None;
    }
    loaded.iter().find_map(|m| m.id)
}

/// Fetch one page and merge it into the store.
///
/// `cursor == None` loads the newest page and replaces the list; a cursor
/// loads the page before it and merges it in front. The stored cursor only
/// ever moves towards older messages: a next cursor that does not move past
/// the one just used ends pagination instead of re-fetching the same page.
/// Returns the number of messages the server sent.
pub async fn fetch_page<A: ChatApi + ?Sized>(
    api: &A,
    store: &SharedStore,
    conversation_id: i64,
    page_size: usize,
    cursor: Option<i64>,
) -> Result<usize, ApiError> {
    let page = api.list_messages(conversation_id, page_size, cursor).await?;
    let received = page.results.len();
    let server_has_more = page.next_cursor.is_some();

    let mut store = store.write().await;
    store.set_messages(conversation_id, page.results, cursor.is_some());

    let mut next = cursor_after_fetch(server_has_more, store.messages(conversation_id));
    if let (Some(previous), Some(candidate)) = (cursor, next) {
        if candidate >= previous {
            crate::log_warn!(
                "Cursor for conversation {} did not advance ({} -> {}); stopping pagination",
                conversation_id,
                previous,
                candidate
            );
            next = None;
        }
    }
    store.set_cursor(conversation_id, next);

    crate::log_debug!(
        "Loaded {} messages for conversation {} (cursor {:?} -> {:?})",
        received,
        conversation_id,
        cursor,
        next
    );
    Ok(received)
}

/// Clears the in-flight flag when a fetch finishes or is dropped.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PaginationController<A: ChatApi> {
    api: Arc<A>,
    store: SharedStore,
    page_size: usize,
    load_older_threshold: f64,
    stick_to_bottom_threshold: f64,
    loading: AtomicBool,
    initially_scrolled: Mutex<HashSet<i64>>,
}

impl<A: ChatApi> PaginationController<A> {
    pub fn new(api: Arc<A>, store: SharedStore, config: &ChatConfig) -> Self {
        Self {
            api,
            store,
            page_size: config.page_size,
            load_older_threshold: config.load_older_threshold,
            stick_to_bottom_threshold: config.stick_to_bottom_threshold,
            loading: AtomicBool::new(false),
            initially_scrolled: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Load the newest page unless one was already fetched.
    pub async fn load_initial(&self, conversation_id: i64) -> Result<(), ApiError> {
        if self.store.read().await.is_loaded(conversation_id) {
            return Ok(());
        }
        fetch_page(
            self.api.as_ref(),
            &self.store,
            conversation_id,
            self.page_size,
            None,
        )
        .await?;
        Ok(())
    }

    /// Near the top, idle, and with older pages left.
    pub async fn should_load_older(&self, conversation_id: i64, metrics: &ScrollMetrics) -> bool {
        metrics.scroll_top <= self.load_older_threshold
            && !self.is_loading()
            && self.store.read().await.cursor(conversation_id).is_some()
    }

    /// Scroll handler: fetch the page before the stored cursor when
    /// [`should_load_older`](Self::should_load_older) holds.
    ///
    /// Returns the anchor recorded before the fetch; the host applies
    /// [`ScrollAnchor::restore`] after it has rendered the merged list.
    pub async fn on_scroll(
        &self,
        conversation_id: i64,
        metrics: &ScrollMetrics,
    ) -> Result<Option<ScrollAnchor>, ApiError> {
        if !self.should_load_older(conversation_id, metrics).await {
            return Ok(None);
        }
        if self
            .loading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }
        let _guard = LoadingGuard(&self.loading);

        let Some(cursor) = self.store.read().await.cursor(conversation_id) else {
            return Ok(None);
        };
        let anchor = ScrollAnchor::record(metrics);
        fetch_page(
            self.api.as_ref(),
            &self.store,
            conversation_id,
            self.page_size,
            Some(cursor),
        )
        .await?;
        Ok(Some(anchor))
    }

    /// Whether to jump to the bottom on first showing `conversation_id`.
    /// True once per conversation, and only when there is something to show.
    pub fn take_initial_scroll(&self, conversation_id: i64, has_messages: bool) -> bool {
        if !has_messages {
            return false;
        }
        match self.initially_scrolled.lock() {
            Ok(mut seen) => seen.insert(conversation_id),
            Err(poisoned) => poisoned.into_inner().insert(conversation_id),
        }
    }

    /// Forget the initial-scroll guard, e.g. when the conversation is closed.
    pub fn forget(&self, conversation_id: i64) {
        match self.initially_scrolled.lock() {
            Ok(mut seen) => seen.remove(&conversation_id),
            Err(poisoned) => poisoned.into_inner().remove(&conversation_id),
        };
    }

    /// Whether a new arrival should scroll to the bottom, given the metrics
    /// from before the arrival was rendered. Never while older messages load.
    pub fn should_auto_scroll(&self, before: &ScrollMetrics) -> bool {
        !self.is_loading() && before.distance_from_bottom() <= self.stick_to_bottom_threshold
    }
}
