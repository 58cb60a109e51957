//! Caller-facing catalog surface: named sparse lists filled on demand.
//!
//! Lists outlive individual connections. After a reconnect callers either
//! clear them or simply fetch again; a page that was in flight when its
//! list was cleared is discarded rather than merged into the fresh list.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use super::item::Item;
use super::query::{available_kinds, ListKind, ListQuery};
use super::sparse_list::SparsePagedList;
use super::ListId;
use crate::bus::{BusEvent, SharedBus};
use crate::connection::HandshakeResult;
use crate::error::{CliError, CliResult};
use crate::protocol::{Command, Requester};

#[derive(Clone)]
struct ListEntry {
    query: ListQuery,
    items: Arc<SparsePagedList>,
}

pub struct Catalog {
    requester: Arc<dyn Requester>,
    bus: SharedBus,
    handshake: RwLock<Option<HandshakeResult>>,
    lists: RwLock<HashMap<ListId, ListEntry>>,
}

impl Catalog {
    pub fn new(requester: Arc<dyn Requester>, bus: SharedBus) -> Self {
        Self {
            requester,
            bus,
            handshake: RwLock::new(None),
            lists: RwLock::new(HashMap::new()),
        }
    }

    /// Capabilities used for album sort defaults and folder browsing.
    pub fn set_handshake(&self, handshake: Option<HandshakeResult>) {
        *self.handshake.write().unwrap_or_else(PoisonError::into_inner) = handshake;
    }

    fn current_handshake(&self) -> Option<HandshakeResult> {
        self.handshake
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn available_kinds(&self) -> Vec<ListKind> {
        available_kinds(self.current_handshake().as_ref())
    }

    /// Register a list for `query` (idempotent) and return its id.
    pub fn open(&self, query: ListQuery) -> ListId {
        let handshake = self.current_handshake();
        if query.kind.requires_music_folders() && !handshake.as_ref().is_some_and(|h| h.can_music_folders) {
            warn!(kind = %query.kind, "server did not report music folder support");
        }
        let query = query.with_defaults(handshake.as_ref());
        let list_id = query.list_id();

        let mut lists = self.lists.write().unwrap_or_else(PoisonError::into_inner);
        lists.entry(list_id.clone()).or_insert_with(|| {
            debug!(list_id = %list_id, "list opened");
            ListEntry {
                query,
                items: Arc::new(SparsePagedList::new()),
            }
        });
        list_id
    }

    /// Forget a list entirely.
    pub fn close(&self, list_id: &ListId) {
        let removed = self
            .lists
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(list_id);
        if let Some(entry) = removed {
            entry.items.clear();
        }
    }

    fn entry(&self, list_id: &ListId) -> CliResult<ListEntry> {
        self.lists
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(list_id)
            .cloned()
            .ok_or_else(|| CliError::UnknownList {
                list_id: list_id.to_string(),
            })
    }

    /// Direct handle on a list, for presentation code reading many slots.
    pub fn list(&self, list_id: &ListId) -> CliResult<Arc<SparsePagedList>> {
        Ok(self.entry(list_id)?.items)
    }

    /// Fetch `[start, start + count)` and merge it. Returns the number of
    /// items the server sent.
    pub async fn fetch_range(&self, list_id: &ListId, start: usize, count: usize) -> CliResult<usize> {
        let entry = self.entry(list_id)?;
        let generation = entry.items.generation();

        let reply = self.requester.request(entry.query.command(start, count)).await?;
        let page = entry.query.parse_page(&reply).inspect_err(|e| {
            warn!(list_id = %list_id, "could not read page: {}", e);
        })?;

        let total = page.total;
        let merged = page.items.len();
        if !entry.items.update_if(generation, total, start, page.items) {
            debug!(list_id = %list_id, start, "discarding page for a cleared list");
            return Ok(0);
        }
        self.bus.publish(BusEvent::ListUpdated {
            list_id: list_id.clone(),
            total,
            start,
            count: merged,
        });
        Ok(merged)
    }

    /// Item at `index`; `Ok(None)` until its page has been fetched.
    pub fn get_item(&self, list_id: &ListId, index: usize) -> CliResult<Option<Item>> {
        self.entry(list_id)?.items.get_item(index)
    }

    pub fn get_total_count(&self, list_id: &ListId) -> CliResult<usize> {
        Ok(self.entry(list_id)?.items.total_count())
    }

    pub fn find_item(&self, list_id: &ListId, item: &Item) -> CliResult<Option<usize>> {
        Ok(self.entry(list_id)?.items.find_item(item))
    }

    pub fn clear(&self, list_id: &ListId) -> CliResult<()> {
        let entry = self.entry(list_id)?;
        self.reset(list_id, &entry);
        Ok(())
    }

    /// Clear every open list, e.g. after connecting to a different server.
    pub fn clear_all(&self) {
        let entries: Vec<(ListId, ListEntry)> = self
            .lists
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        for (list_id, entry) in entries {
            self.reset(&list_id, &entry);
        }
    }

    fn reset(&self, list_id: &ListId, entry: &ListEntry) {
        entry.items.clear();
        debug!(list_id = %list_id, "list cleared");
        self.bus.publish(BusEvent::ListCleared {
            list_id: list_id.clone(),
        });
    }

    /// Remove the track at `index` from a player's queue, reflecting the
    /// change in the local copy of that queue if one is open.
    pub async fn playlist_delete(&self, player_id: &str, index: usize) -> CliResult<()> {
        let command = Command::new([
            player_id.to_string(),
            "playlist".into(),
            "delete".into(),
            index.to_string(),
        ]);
        self.requester.request(command).await?;

        let list_id = ListQuery::current_playlist(player_id).list_id();
        if let Ok(entry) = self.entry(&list_id) {
            match entry.items.remove_item(index) {
                Ok(_) => self.bus.publish(BusEvent::ListUpdated {
                    list_id,
                    total: entry.items.total_count(),
                    start: index,
                    count: 0,
                }),
                Err(e) => {
                    debug!(list_id = %list_id, "local queue out of step ({}), clearing", e);
                    self.reset(&list_id, &entry);
                }
            }
        }
        Ok(())
    }

    /// Add a track to a player's queue at `index`.
    ///
    /// The server only appends, so the track is added and then moved from
    /// the end of the queue into place.
    pub async fn playlist_insert(&self, player_id: &str, index: usize, item: Item) -> CliResult<()> {
        let reply = self
            .requester
            .request(Command::new([player_id, "playlist", "tracks", "?"]))
            .await?;
        let queue_len = reply
            .value()
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| CliError::malformed("playlist tracks ?", "missing track count"))?;
        if index > queue_len {
            return Err(CliError::OutOfRange {
                index,
                total: queue_len,
            });
        }

        let add = Command::new([
            player_id.to_string(),
            "playlistcontrol".into(),
            "cmd:add".into(),
            format!("track_id:{}", item.id),
        ])
        .with_echo_len(3);
        self.requester.request(add).await?;

        if index != queue_len {
            let shift = Command::new([
                player_id.to_string(),
                "playlist".into(),
                "move".into(),
                queue_len.to_string(),
                index.to_string(),
            ])
            .with_echo_len(3);
            self.requester.request(shift).await?;
        }

        let list_id = ListQuery::current_playlist(player_id).list_id();
        if let Ok(entry) = self.entry(&list_id) {
            match entry.items.insert_item(index, item) {
                Ok(()) => self.bus.publish(BusEvent::ListUpdated {
                    list_id,
                    total: entry.items.total_count(),
                    start: index,
                    count: 1,
                }),
                Err(e) => {
                    debug!(list_id = %list_id, "local queue out of step ({}), clearing", e);
                    self.reset(&list_id, &entry);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::create_bus;
    use crate::connection::AlbumSort;
    use crate::protocol::codec::decode_line;
    use crate::protocol::Reply;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies scripted in order; records every command it was sent.
    #[derive(Default)]
    struct ScriptedRequester {
        replies: Mutex<VecDeque<CliResult<String>>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedRequester {
        fn with(replies: Vec<CliResult<&str>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(|r| r.map(String::from)).collect()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Requester for ScriptedRequester {
        async fn request(&self, command: Command) -> CliResult<Reply> {
            self.sent.lock().unwrap().push(command.tokens().join(" "));
            let next = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(CliError::SessionClosed));
            next.map(|line| Reply::new(decode_line(&line), command.echo_len()))
        }
    }

    fn handshake(album_sort: AlbumSort) -> HandshakeResult {
        HandshakeResult {
            can_music_folders: true,
            can_random_play: false,
            http_port: Some(9000),
            album_sort,
            server_version: "8.5.0".into(),
            completed_at: Utc::now(),
        }
    }

    const PLAYER: &str = "00:04:20:aa:bb:cc";

    #[tokio::test]
    async fn test_fetch_range_merges_and_publishes() {
        let requester = ScriptedRequester::with(vec![Ok(
            "artists 10 2 id%3A11 artist%3AEno id%3A12 artist%3AFripp count%3A40",
        )]);
        let bus = create_bus();
        let mut events = bus.subscribe();
        let catalog = Catalog::new(requester.clone(), bus);

        let id = catalog.open(ListQuery::new(ListKind::Artists));
        assert_eq!(catalog.fetch_range(&id, 10, 2).await.unwrap(), 2);

        assert_eq!(catalog.get_total_count(&id).unwrap(), 40);
        assert_eq!(catalog.get_item(&id, 11).unwrap().unwrap().name, "Fripp");
        assert_eq!(catalog.get_item(&id, 0).unwrap(), None);
        assert_eq!(requester.sent(), vec!["artists 10 2"]);

        match events.recv().await.unwrap() {
            BusEvent::ListUpdated {
                list_id,
                total,
                start,
                count,
            } => {
                assert_eq!(list_id, id);
                assert_eq!((total, start, count), (40, 10, 2));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_list_is_reported() {
        let catalog = Catalog::new(ScriptedRequester::with(vec![]), create_bus());
        let id = ListId::from("artists");
        assert!(matches!(
            catalog.get_item(&id, 0),
            Err(CliError::UnknownList { .. })
        ));
        assert!(matches!(
            catalog.fetch_range(&id, 0, 10).await,
            Err(CliError::UnknownList { .. })
        ));
    }

    #[tokio::test]
    async fn test_request_errors_reach_the_caller_only() {
        let requester = ScriptedRequester::with(vec![
            Err(CliError::Timeout {
                command: "genres 0 10".into(),
                after: std::time::Duration::from_secs(1),
            }),
            Ok("genres 0 10 id%3A1"),
        ]);
        let catalog = Catalog::new(requester, create_bus());
        let id = catalog.open(ListQuery::new(ListKind::Genres));

        assert!(matches!(
            catalog.fetch_range(&id, 0, 10).await,
            Err(CliError::Timeout { .. })
        ));
        assert!(matches!(
            catalog.fetch_range(&id, 0, 10).await,
            Err(CliError::MalformedReply { .. })
        ));
        assert_eq!(catalog.get_total_count(&id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_albums_use_handshake_sort() {
        let requester = ScriptedRequester::with(vec![Ok("albums 0 1 count%3A0")]);
        let catalog = Catalog::new(requester.clone(), create_bus());
        catalog.set_handshake(Some(handshake(AlbumSort::ArtistAlbum)));

        let id = catalog.open(ListQuery::new(ListKind::Albums));
        assert_eq!(id.as_str(), "albums?sort=artistalbum");
        catalog.fetch_range(&id, 0, 1).await.unwrap();
        assert_eq!(requester.sent(), vec!["albums 0 1 tags:alyj sort:artistalbum"]);
        assert!(catalog.available_kinds().contains(&ListKind::MusicFolder));
    }

    #[tokio::test]
    async fn test_clear_publishes_and_empties() {
        let requester = ScriptedRequester::with(vec![Ok("years 0 1 year%3A1999 count%3A30")]);
        let bus = create_bus();
        let catalog = Catalog::new(requester, bus.clone());
        let id = catalog.open(ListQuery::new(ListKind::Years));
        catalog.fetch_range(&id, 0, 1).await.unwrap();

        let mut events = bus.subscribe();
        catalog.clear(&id).unwrap();
        assert_eq!(catalog.get_total_count(&id).unwrap(), 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            BusEvent::ListCleared { .. }
        ));
    }

    /// Holds every reply until `release` is notified.
    struct GatedRequester {
        release: tokio::sync::Notify,
        reply: String,
    }

    #[async_trait]
    impl Requester for GatedRequester {
        async fn request(&self, command: Command) -> CliResult<Reply> {
            self.release.notified().await;
            Ok(Reply::new(decode_line(&self.reply), command.echo_len()))
        }
    }

    #[tokio::test]
    async fn test_page_in_flight_during_clear_is_discarded() {
        let requester = Arc::new(GatedRequester {
            release: tokio::sync::Notify::new(),
            reply: "artists 0 1 id%3A1 artist%3AEno count%3A40".into(),
        });
        let catalog = Arc::new(Catalog::new(requester.clone(), create_bus()));
        let id = catalog.open(ListQuery::new(ListKind::Artists));

        let fetch = {
            let catalog = catalog.clone();
            let id = id.clone();
            tokio::spawn(async move { catalog.fetch_range(&id, 0, 1).await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        catalog.clear(&id).unwrap();
        requester.release.notify_one();

        assert_eq!(fetch.await.unwrap().unwrap(), 0);
        assert_eq!(catalog.get_total_count(&id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_playlist_delete_shifts_local_queue() {
        let requester = ScriptedRequester::with(vec![
            Ok("00%3A04%3A20%3Aaa%3Abb%3Acc status 0 3 tags%3Aalyc playlist_tracks%3A3 \
                playlist%20index%3A0 id%3A1 title%3AA playlist%20index%3A1 id%3A2 title%3AB \
                playlist%20index%3A2 id%3A3 title%3AC"),
            Ok("00%3A04%3A20%3Aaa%3Abb%3Acc playlist delete 1"),
        ]);
        let catalog = Catalog::new(requester.clone(), create_bus());
        let id = catalog.open(ListQuery::current_playlist(PLAYER));
        catalog.fetch_range(&id, 0, 3).await.unwrap();

        catalog.playlist_delete(PLAYER, 1).await.unwrap();

        assert_eq!(catalog.get_total_count(&id).unwrap(), 2);
        assert_eq!(catalog.get_item(&id, 1).unwrap().unwrap().id, "3");
        assert_eq!(requester.sent()[1], format!("{} playlist delete 1", PLAYER));
    }

    #[tokio::test]
    async fn test_playlist_insert_adds_then_moves() {
        let requester = ScriptedRequester::with(vec![
            Ok("00%3A04%3A20%3Aaa%3Abb%3Acc status 0 2 playlist_tracks%3A2 \
                playlist%20index%3A0 id%3A1 title%3AA playlist%20index%3A1 id%3A2 title%3AB"),
            Ok("00%3A04%3A20%3Aaa%3Abb%3Acc playlist tracks 2"),
            Ok("00%3A04%3A20%3Aaa%3Abb%3Acc playlistcontrol cmd%3Aadd track_id%3A9 count%3A1"),
            Ok("00%3A04%3A20%3Aaa%3Abb%3Acc playlist move 2 0"),
        ]);
        let catalog = Catalog::new(requester.clone(), create_bus());
        let id = catalog.open(ListQuery::current_playlist(PLAYER));
        catalog.fetch_range(&id, 0, 2).await.unwrap();

        catalog
            .playlist_insert(PLAYER, 0, Item::new("9", "New"))
            .await
            .unwrap();

        let sent = requester.sent();
        assert_eq!(sent[2], format!("{} playlistcontrol cmd:add track_id:9", PLAYER));
        assert_eq!(sent[3], format!("{} playlist move 2 0", PLAYER));
        assert_eq!(catalog.get_total_count(&id).unwrap(), 3);
        assert_eq!(catalog.get_item(&id, 0).unwrap().unwrap().id, "9");
        assert_eq!(catalog.find_item(&id, &Item::new("2", "")).unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_playlist_insert_at_end_skips_move() {
        let requester = ScriptedRequester::with(vec![
            Ok("00%3A04%3A20%3Aaa%3Abb%3Acc playlist tracks 4"),
            Ok("00%3A04%3A20%3Aaa%3Abb%3Acc playlistcontrol cmd%3Aadd track_id%3A9 count%3A1"),
        ]);
        let catalog = Catalog::new(requester.clone(), create_bus());

        catalog
            .playlist_insert(PLAYER, 4, Item::new("9", "New"))
            .await
            .unwrap();
        assert_eq!(requester.sent().len(), 2);

        let err = catalog.playlist_insert(PLAYER, 9, Item::new("9", "New")).await;
        assert!(matches!(err, Err(CliError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_playlist_insert_rejects_index_past_end() {
        let requester = ScriptedRequester::with(vec![Ok("00%3A04%3A20%3Aaa%3Abb%3Acc playlist tracks 4")]);
        let catalog = Catalog::new(requester.clone(), create_bus());

        let err = catalog.playlist_insert(PLAYER, 9, Item::new("9", "New")).await;
        assert!(matches!(err, Err(CliError::OutOfRange { index: 9, total: 4 })));
        assert_eq!(requester.sent().len(), 1);
    }
}
