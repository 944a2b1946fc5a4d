//! Denormalized feed items and keyset pagination over them.
//!
//! A feed page is ordered by `last_action_at` descending. The cursor is the
//! timestamp of the last entry of the previous page; the next page holds
//! only strictly older entries.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use courier_shared::constants::{FEED_PAGE_SIZE, SEARCH_PAGE_SIZE};
use courier_shared::types::{ConversationId, FeedItemId, FeedType, GroupId, MessageId, UserId};
use courier_shared::views::{FeedEntry, FeedItemView, FeedPage, MessageView, SearchPage};

use crate::database::UnitOfWork;
use crate::error::{Result, StoreError};
use crate::models::{Conversation, FeedItem, Group};
use crate::sql::{enum_at, not_found, parse_ts, ts, ts_at, uuid_at};

const FEED_COLUMNS: &str = "f.id, f.kind, f.item_id, f.last_action_at";

impl UnitOfWork<'_> {
    /// Insert a feed item. `users` is the visibility set and is only
    /// meaningful for conversation items.
    pub fn insert_feed_item(&self, item: &FeedItem, users: &[UserId]) -> Result<()> {
        self.execute(
            "INSERT INTO feed_items (id, kind, item_id, last_action_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                item.id.to_string(),
                item.kind.as_str(),
                item.item_id.to_string(),
                ts(&item.last_action_at),
            ],
        )?;

        let mut stmt = self.prepare(
            "INSERT OR IGNORE INTO feed_item_users (feed_item_id, user_id) VALUES (?1, ?2)",
        )?;
        for user in users {
            stmt.execute(params![item.id.to_string(), user.to_string()])?;
        }
        Ok(())
    }

    pub fn get_feed_item(&self, kind: FeedType, item_id: Uuid) -> Result<FeedItem> {
        self.query_row(
            &format!("SELECT {FEED_COLUMNS} FROM feed_items f WHERE f.item_id = ?1 AND f.kind = ?2"),
            params![item_id.to_string(), kind.as_str()],
            row_to_feed_item,
        )
        .map_err(not_found("FeedItem"))
    }

    pub fn find_feed_item(&self, kind: FeedType, item_id: Uuid) -> Result<Option<FeedItem>> {
        let item = self
            .query_row(
                &format!(
                    "SELECT {FEED_COLUMNS} FROM feed_items f WHERE f.item_id = ?1 AND f.kind = ?2"
                ),
                params![item_id.to_string(), kind.as_str()],
                row_to_feed_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Move a feed item's `last_action_at` and return the updated row.
    pub fn touch_feed_item(
        &self,
        kind: FeedType,
        item_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<FeedItem> {
        let affected = self.execute(
            "UPDATE feed_items SET last_action_at = ?1 WHERE item_id = ?2 AND kind = ?3",
            params![ts(&at), item_id.to_string(), kind.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound("FeedItem"));
        }
        self.get_feed_item(kind, item_id)
    }

    /// One page of `viewer`'s feed.
    pub fn feed_page(&self, viewer: UserId, cursor: Option<&str>) -> Result<FeedPage> {
        let cursor = cursor
            .map(|raw| {
                parse_ts(raw.trim())
                    .map(|at| ts(&at))
                    .map_err(|_| StoreError::InvalidArgument(format!("invalid cursor '{raw}'")))
            })
            .transpose()?;

        let mut stmt = self.prepare(&format!(
            "SELECT {FEED_COLUMNS} FROM feed_items f
             WHERE (
                     (f.kind = 'CONVERSATION' AND EXISTS (
                         SELECT 1 FROM feed_item_users u
                         WHERE u.feed_item_id = f.id AND u.user_id = ?1))
                  OR (f.kind = 'GROUP' AND EXISTS (
                         SELECT 1 FROM participants p
                         WHERE p.group_id = f.item_id AND p.user_id = ?1))
                   )
               AND (?2 IS NULL OR f.last_action_at < ?2)
             ORDER BY f.last_action_at DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![viewer.to_string(), cursor, FEED_PAGE_SIZE as i64],
            row_to_feed_item,
        )?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }

        let next_cursor = match items.last() {
            Some(last) if items.len() == FEED_PAGE_SIZE => Some(ts(&last.last_action_at)),
            _ => None,
        };

        let mut entries = Vec::with_capacity(items.len());
        for item in &items {
            entries.push(self.feed_entry(item, viewer)?);
        }

        Ok(FeedPage {
            items: entries,
            next_cursor,
        })
    }

    /// Items of `viewer`'s feed whose peer name, group name or group login
    /// contains `query`, case-insensitively, newest first. Pages start at 1.
    pub fn search_feed(&self, viewer: UserId, query: &str, page: u32) -> Result<SearchPage> {
        let query = query.trim();
        if query.is_empty() {
            return Err(StoreError::InvalidArgument("search query is empty".into()));
        }
        let page = page.max(1);
        let pattern = format!("%{}%", escape_like(query));
        let offset = (page as i64 - 1) * SEARCH_PAGE_SIZE as i64;

        let mut stmt = self.prepare(&format!(
            "SELECT {FEED_COLUMNS} FROM feed_items f
             WHERE (
                     (f.kind = 'CONVERSATION'
                      AND EXISTS (
                         SELECT 1 FROM feed_item_users u
                         WHERE u.feed_item_id = f.id AND u.user_id = ?1)
                      AND EXISTS (
                         SELECT 1 FROM conversations c
                         JOIN users peer ON peer.id = CASE
                             WHEN c.participant_low = ?1 THEN c.participant_high
                             ELSE c.participant_low END
                         WHERE c.id = f.item_id AND peer.name LIKE ?2 ESCAPE '\\'))
                  OR (f.kind = 'GROUP'
                      AND EXISTS (
                         SELECT 1 FROM participants p
                         WHERE p.group_id = f.item_id AND p.user_id = ?1)
                      AND EXISTS (
                         SELECT 1 FROM chat_groups g
                         WHERE g.id = f.item_id
                           AND (g.name LIKE ?2 ESCAPE '\\' OR g.login LIKE ?2 ESCAPE '\\')))
                   )
             ORDER BY f.last_action_at DESC, f.id ASC
             LIMIT ?3 OFFSET ?4"
        ))?;

        // One extra row tells whether another page exists.
        let rows = stmt.query_map(
            params![viewer.to_string(), pattern, SEARCH_PAGE_SIZE as i64 + 1, offset],
            row_to_feed_item,
        )?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        let has_more = items.len() > SEARCH_PAGE_SIZE;
        items.truncate(SEARCH_PAGE_SIZE);

        let mut entries = Vec::with_capacity(items.len());
        for item in &items {
            entries.push(self.feed_entry(item, viewer)?);
        }

        Ok(SearchPage {
            items: entries,
            page,
            next_page: has_more.then_some(page + 1),
        })
    }

    /// Render a feed item as seen by `viewer`.
    pub fn feed_entry(&self, item: &FeedItem, viewer: UserId) -> Result<FeedEntry> {
        let view = match item.kind {
            FeedType::Conversation => {
                let conversation = self.get_conversation(ConversationId(item.item_id))?;
                self.conversation_item_view(&conversation, viewer)?
            }
            FeedType::Group => {
                let group = self.get_group(GroupId(item.item_id))?;
                self.group_item_view(&group)?
            }
        };

        Ok(FeedEntry {
            id: item.id,
            kind: item.kind,
            last_action_at: item.last_action_at,
            item: view,
        })
    }

    fn conversation_item_view(
        &self,
        conversation: &Conversation,
        viewer: UserId,
    ) -> Result<FeedItemView> {
        let peer = conversation
            .peer_of(viewer)
            .ok_or(StoreError::Forbidden("not a participant of this conversation"))?;

        Ok(FeedItemView::Conversation {
            id: conversation.id,
            recipient: self.user_summary(peer)?,
            last_message: self.last_message_view(conversation.last_message_id)?,
            unread_count: self.unread_count(conversation.id, viewer)?,
        })
    }

    pub(crate) fn group_item_view(&self, group: &Group) -> Result<FeedItemView> {
        Ok(FeedItemView::Group {
            id: group.id,
            name: group.name.clone(),
            login: group.login.clone(),
            avatar: group.avatar.clone(),
            is_official: group.is_official,
            last_message: self.last_message_view(group.last_message_id)?,
        })
    }

    fn last_message_view(&self, id: Option<MessageId>) -> Result<Option<MessageView>> {
        match id {
            Some(id) => {
                let message = self.get_message(id)?;
                Ok(Some(self.message_view(&message)?))
            }
            None => Ok(None),
        }
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn row_to_feed_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeedItem> {
    Ok(FeedItem {
        id: FeedItemId(uuid_at(row, 0)?),
        kind: enum_at(row, 1)?,
        item_id: uuid_at(row, 2)?,
        last_action_at: ts_at(row, 3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::models::User;
    use crate::{sql, Database};

    #[test]
    fn touch_missing_item_is_not_found() {
        let mut db = Database::open_in_memory().unwrap();
        let uow = db.begin().unwrap();
        assert!(matches!(
            uow.touch_feed_item(FeedType::Group, Uuid::new_v4(), sql::now()),
            Err(StoreError::NotFound("FeedItem"))
        ));
    }

    #[test]
    fn bad_cursor_is_invalid_argument() {
        let mut db = Database::open_in_memory().unwrap();
        let uow = db.begin_read().unwrap();
        assert!(matches!(
            uow.feed_page(UserId::new(), Some("yesterday")),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn feed_only_lists_visible_items() {
        let mut db = Database::open_in_memory().unwrap();
        let uow = db.begin().unwrap();
        let a = User::new("A", "a@example.com");
        let b = User::new("B", "b@example.com");
        let c = User::new("C", "c@example.com");
        for u in [&a, &b, &c] {
            uow.insert_user(u).unwrap();
        }

        let start = sql::now();
        let conversation = uow.create_conversation(a.id, b.id, start).unwrap();
        let item = FeedItem::new(
            FeedType::Conversation,
            conversation.id.0,
            start + Duration::seconds(1),
        );
        uow.insert_feed_item(&item, &[a.id, b.id]).unwrap();

        assert_eq!(uow.feed_page(a.id, None).unwrap().items.len(), 1);
        assert_eq!(uow.feed_page(b.id, None).unwrap().items.len(), 1);
        assert!(uow.feed_page(c.id, None).unwrap().items.is_empty());

        let page = uow.feed_page(a.id, None).unwrap();
        match &page.items[0].item {
            FeedItemView::Conversation { recipient, .. } => assert_eq!(recipient.id, b.id),
            other => panic!("unexpected item {other:?}"),
        }
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn search_matches_visible_peers_and_groups() {
        let mut db = Database::open_in_memory().unwrap();
        let uow = db.begin().unwrap();
        let viewer = User::new("Viewer", "v@example.com");
        let ada = User::new("Ada Lovelace", "ada@example.com");
        let alan = User::new("Alan Turing", "alan@example.com");
        let outsider = User::new("Adam Smith", "adam@example.com");
        for u in [&viewer, &ada, &alan, &outsider] {
            uow.insert_user(u).unwrap();
        }

        let start = sql::now();
        for (i, (a, b)) in [(viewer.id, ada.id), (viewer.id, alan.id), (outsider.id, alan.id)]
            .into_iter()
            .enumerate()
        {
            let at = start + Duration::seconds(i as i64);
            let conversation = uow.create_conversation(a, b, at).unwrap();
            let item = FeedItem::new(FeedType::Conversation, conversation.id.0, at);
            uow.insert_feed_item(&item, &[a, b]).unwrap();
        }

        let page = uow.search_feed(viewer.id, "  ADA ", 1).unwrap();
        assert_eq!(page.items.len(), 1);
        match &page.items[0].item {
            FeedItemView::Conversation { recipient, .. } => assert_eq!(recipient.id, ada.id),
            other => panic!("unexpected item {other:?}"),
        }
        assert!(page.next_page.is_none());

        // The viewer's own name never matches their conversations.
        assert!(uow.search_feed(viewer.id, "viewer", 1).unwrap().items.is_empty());
        // `%` is literal, not a wildcard.
        assert!(uow.search_feed(viewer.id, "%", 1).unwrap().items.is_empty());
        assert!(matches!(
            uow.search_feed(viewer.id, "   ", 1),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn search_pages_are_numbered() {
        let mut db = Database::open_in_memory().unwrap();
        let uow = db.begin().unwrap();
        let viewer = User::new("Viewer", "v@example.com");
        uow.insert_user(&viewer).unwrap();

        let start = sql::now();
        for i in 0..(SEARCH_PAGE_SIZE + 3) {
            let peer = User::new(format!("peer {i}"), format!("p{i}@example.com"));
            uow.insert_user(&peer).unwrap();
            let at = start + Duration::seconds(i as i64);
            let conversation = uow.create_conversation(viewer.id, peer.id, at).unwrap();
            let item = FeedItem::new(FeedType::Conversation, conversation.id.0, at);
            uow.insert_feed_item(&item, &[viewer.id, peer.id]).unwrap();
        }

        let first = uow.search_feed(viewer.id, "peer", 1).unwrap();
        assert_eq!(first.items.len(), SEARCH_PAGE_SIZE);
        assert_eq!(first.next_page, Some(2));

        let second = uow.search_feed(viewer.id, "peer", 2).unwrap();
        assert_eq!(second.items.len(), 3);
        assert!(second.next_page.is_none());
        assert!(second.items[0].last_action_at < first.items[SEARCH_PAGE_SIZE - 1].last_action_at);
    }
}
