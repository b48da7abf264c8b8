//! The session directory: who is connected, and as whom.
//!
//! # Concurrency
//!
//! Unlike a per-task registry, the directory is shared by every
//! connection task and by cross-connection operations such as routing a
//! message to another player. Records live in a [`DashMap`] keyed by
//! [`ConnectionId`]; `identify` and `stop_session` are check-and-set
//! operations on a single key, so a connection's first identify cannot
//! lose an update to a concurrent stop.
//!
//! Lookups other than by connection are linear scans over the live map
//! and return *some* matching record. No iteration order is promised.
//!
//! Callbacks never run while a map shard is locked, so they are free to
//! call back into the directory.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tether_protocol::{
    BoundPlayer, Cipher, Codec, Identity, JsonCodec, PacketCodec, Player, Response,
    SessionStopReason,
};
use tether_transport::{Connection, ConnectionId};
use uuid::Uuid;

use crate::SessionError;

/// A live connection's established identity and bound player.
pub struct SessionRecord<C> {
    pub connection: Arc<C>,
    pub identity: Identity,
    /// Set at most once per connection.
    pub player: Option<BoundPlayer>,
}

impl<C> SessionRecord<C> {
    pub fn to_player(&self) -> Player {
        Player {
            identity: self.identity.clone(),
            bound: self.player.clone(),
        }
    }
}

// Derived `Clone` would require `C: Clone`; the connection is shared.
impl<C> Clone for SessionRecord<C> {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            identity: self.identity.clone(),
            player: self.player.clone(),
        }
    }
}

impl<C> std::fmt::Debug for SessionRecord<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("identity", &self.identity)
            .field("player", &self.player)
            .finish_non_exhaustive()
    }
}

/// Tracks every identified connection on the server.
pub struct SessionDirectory<C: Connection, K: Codec = JsonCodec> {
    sessions: DashMap<ConnectionId, SessionRecord<C>>,
    packets: PacketCodec<K>,
}

impl<C: Connection, K: Codec> SessionDirectory<C, K> {
    /// Creates an empty directory that encrypts with the server's cipher.
    pub fn new(codec: K, cipher: Arc<dyn Cipher>) -> Self {
        Self {
            sessions: DashMap::new(),
            packets: PacketCodec::with_cipher(codec, cipher),
        }
    }

    /// The envelope codec used for this directory's sends.
    pub fn packets(&self) -> &PacketCodec<K> {
        &self.packets
    }

    // -----------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------

    /// Installs or updates the record for `connection`.
    ///
    /// A connection that only has an identity may be identified again
    /// (for instance once its player is known). Once a player is bound,
    /// any further call fails and leaves the record untouched.
    ///
    /// `on_bound` runs after the record is installed, only when the new
    /// record carries a player.
    ///
    /// # Errors
    /// [`SessionError::AlreadyBound`] if the connection already has a
    /// bound player.
    pub fn identify<F>(
        &self,
        connection: &Arc<C>,
        identity: Identity,
        player: Option<BoundPlayer>,
        on_bound: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(&Identity, &Player),
    {
        let conn_id = connection.id();
        let record = SessionRecord {
            connection: Arc::clone(connection),
            identity,
            player,
        };
        let bound = record.player.is_some().then(|| record.to_player());

        match self.sessions.entry(conn_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().player.is_some() {
                    tracing::warn!(%conn_id, "rejected second player binding");
                    return Err(SessionError::AlreadyBound(conn_id));
                }
                entry.insert(record);
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
        }

        tracing::info!(%conn_id, bound = bound.is_some(), "connection identified");

        if let Some(player) = bound {
            on_bound(&player.identity, &player);
        }
        Ok(())
    }

    /// Ends the session on `connection`.
    ///
    /// If a record exists, it is removed and `on_stopped` runs with its
    /// identity and player. An open connection that had a
    /// record is told why with a plain `SessionFailed` response and left
    /// for the transport to close. A connection that never identified is
    /// closed immediately with the reason's close code.
    ///
    /// # Errors
    /// Encoding or transport failures while notifying or closing.
    pub async fn stop_session<F>(
        &self,
        connection: &C,
        reason: SessionStopReason,
        message: &str,
        cause: Option<&(dyn std::error::Error + Send + Sync)>,
        on_stopped: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(&Identity, &Player),
    {
        let conn_id = connection.id();

        // Removed before the callback runs, so an identify racing this stop
        // either lands in the removed record or starts a fresh one.
        let removed = self.sessions.remove(&conn_id).map(|(_, record)| record);
        if let Some(record) = &removed {
            on_stopped(&record.identity, &record.to_player());
        }

        let text = reason.message(message);
        match cause {
            Some(cause) => tracing::error!(%conn_id, error = %cause, "{text}"),
            None => tracing::info!(%conn_id, "{text}"),
        }

        match removed {
            Some(_) if connection.is_open() => {
                // The record is gone, so the peer gets this in the clear.
                let bytes = self
                    .packets
                    .encode_plain(&Response::session_error(reason, message))?;
                connection
                    .send(&bytes)
                    .await
                    .map_err(|e| SessionError::Transport(Box::new(e)))
            }
            Some(_) => Ok(()),
            None => connection
                .close_with(reason.code(), "Session stopped")
                .await
                .map_err(|e| SessionError::Transport(Box::new(e))),
        }
    }

    /// Sends `response` on `connection`.
    ///
    /// Identified connections get an envelope encrypted for `recipient`;
    /// everyone else gets a plain one.
    ///
    /// # Errors
    /// Codec and cipher failures are returned unchanged, as are
    /// transport failures.
    pub async fn send(
        &self,
        connection: &C,
        recipient: Option<&Identity>,
        response: &Response,
    ) -> Result<(), SessionError> {
        let bytes = if self.is_identified(connection.id()) {
            self.packets.encode_encrypted(recipient, response)?
        } else {
            self.packets.encode_plain(response)?
        };
        tracing::debug!(conn_id = %connection.id(), msg = response.name(), "sending");
        connection
            .send(&bytes)
            .await
            .map_err(|e| SessionError::Transport(Box::new(e)))
    }

    // -----------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------

    /// Returns `true` if the connection has a record. A player binding is
    /// not required.
    pub fn is_identified(&self, conn_id: ConnectionId) -> bool {
        self.sessions.contains_key(&conn_id)
    }

    /// The identity established on a connection.
    pub fn identity(&self, conn_id: ConnectionId) -> Option<Identity> {
        self.sessions.get(&conn_id).map(|r| r.identity.clone())
    }

    /// The connection an identity is using.
    pub fn connection_for(&self, identity: &Identity) -> Option<Arc<C>> {
        self.find_map(|r| (r.identity == *identity).then(|| Arc::clone(&r.connection)))
    }

    /// The identity bound to an in-game player.
    pub fn identity_for_player(&self, player: &BoundPlayer) -> Option<Identity> {
        self.find_map(|r| (r.player.as_ref() == Some(player)).then(|| r.identity.clone()))
    }

    /// The in-game player an identity is bound to.
    pub fn bound_player(&self, identity: &Identity) -> Option<BoundPlayer> {
        self.find_map(|r| {
            if r.identity == *identity {
                r.player.clone()
            } else {
                None
            }
        })
    }

    /// The player for an identity, only if it has a bound player.
    pub fn find_player(&self, identity: &Identity) -> Option<Player> {
        self.find_map(|r| (r.identity == *identity && r.player.is_some()).then(|| r.to_player()))
    }

    /// A record whose identity belongs to the given profile.
    pub fn record_by_owner(&self, owner: Uuid) -> Option<SessionRecord<C>> {
        self.find_map(|r| (r.identity.owner == owner).then(|| r.clone()))
    }

    /// The record bound to the given game account.
    pub fn record_by_player(&self, player_id: Uuid) -> Option<SessionRecord<C>> {
        self.find_map(|r| bound_to(r, player_id).then(|| r.clone()))
    }

    /// The identity bound to the given game account.
    pub fn identity_by_player_id(&self, player_id: Uuid) -> Option<Identity> {
        self.find_map(|r| bound_to(r, player_id).then(|| r.identity.clone()))
    }

    /// The player for a profile, bound or not.
    pub fn find_player_by_profile(&self, profile: Uuid) -> Option<Player> {
        self.find_map(|r| (r.identity.owner == profile).then(|| r.to_player()))
    }

    /// Players among `candidates` on the same game server as `identity`.
    ///
    /// # Errors
    /// [`SessionError::NoBoundPlayer`] if `identity` has no bound player.
    pub fn find_players(
        &self,
        identity: &Identity,
        candidates: &[Uuid],
    ) -> Result<Vec<Player>, SessionError> {
        let player = self
            .bound_player(identity)
            .ok_or_else(|| SessionError::NoBoundPlayer(identity.clone()))?;

        Ok(self
            .sessions
            .iter()
            .filter(|entry| {
                entry.player.as_ref().is_some_and(|other| {
                    other.in_server_with(&player) && candidates.contains(&other.id)
                })
            })
            .map(|entry| entry.to_player())
            .collect())
    }

    /// Number of tracked connections.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    fn find_map<T>(&self, f: impl Fn(&SessionRecord<C>) -> Option<T>) -> Option<T> {
        self.sessions.iter().find_map(|entry| f(entry.value()))
    }
}

fn bound_to<C>(record: &SessionRecord<C>, player_id: Uuid) -> bool {
    record.player.as_ref().is_some_and(|p| p.id == player_id)
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! Unit tests for `SessionDirectory`.
    //!
    //! A `MockConnection` records what was sent and how it was closed, and
    //! a `PairCipher` keyed to the server lets tests decrypt what the
    //! directory encrypted.

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tether_protocol::testing::{PairCipher, identity};
    use tether_protocol::{Mode, SessionFailure, peek_mode};
    use tether_transport::TransportError;

    // -- Helpers ----------------------------------------------------------

    struct MockConnection {
        id: ConnectionId,
        open: AtomicBool,
        sent: Mutex<Vec<Vec<u8>>>,
        closed_with: Mutex<Option<u16>>,
    }

    impl MockConnection {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::new(id),
                open: AtomicBool::new(true),
                sent: Mutex::new(Vec::new()),
                closed_with: Mutex::new(None),
            })
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        fn closed_with(&self) -> Option<u16> {
            *self.closed_with.lock().unwrap()
        }
    }

    impl Connection for MockConnection {
        type Error = TransportError;

        async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(None)
        }

        async fn close_with(&self, code: u16, _reason: &str) -> Result<(), TransportError> {
            self.open.store(false, Ordering::SeqCst);
            *self.closed_with.lock().unwrap() = Some(code);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn close_info(&self) -> Option<tether_transport::CloseInfo> {
            None
        }

        fn id(&self) -> ConnectionId {
            self.id
        }
    }

    fn directory() -> (SessionDirectory<MockConnection>, Identity) {
        let server = identity();
        let dir = SessionDirectory::new(JsonCodec, Arc::new(PairCipher::new(server.clone())));
        (dir, server)
    }

    fn player(server: &str) -> BoundPlayer {
        BoundPlayer {
            id: Uuid::new_v4(),
            server: server.into(),
        }
    }

    fn ignore(_: &Identity, _: &Player) {}

    // =====================================================================
    // identify()
    // =====================================================================

    #[test]
    fn test_identify_without_player_is_identified() {
        let (dir, _) = directory();
        let conn = MockConnection::new(1);
        let id = identity();

        dir.identify(&conn, id.clone(), None, ignore).unwrap();

        assert!(dir.is_identified(conn.id()));
        assert_eq!(dir.identity(conn.id()), Some(id));
        assert_eq!(dir.count(), 1);
    }

    #[test]
    fn test_identify_callback_fires_only_with_player() {
        let (dir, _) = directory();
        let conn = MockConnection::new(1);
        let id = identity();
        let mut calls = Vec::new();

        dir.identify(&conn, id.clone(), None, |i, _| calls.push(i.clone()))
            .unwrap();
        assert!(calls.is_empty());

        let p = player("alpha");
        dir.identify(&conn, id.clone(), Some(p.clone()), |i, pl| {
            calls.push(i.clone());
            assert_eq!(pl.bound.as_ref(), Some(&p));
        })
        .unwrap();
        assert_eq!(calls, vec![id]);
    }

    #[test]
    fn test_identify_second_binding_returns_error_and_keeps_state() {
        let (dir, _) = directory();
        let conn = MockConnection::new(1);
        let id = identity();
        let first = player("alpha");
        dir.identify(&conn, id.clone(), Some(first.clone()), ignore)
            .unwrap();

        let result = dir.identify(&conn, identity(), Some(player("beta")), ignore);

        assert!(matches!(result, Err(SessionError::AlreadyBound(c)) if c == conn.id()));
        assert_eq!(dir.identity(conn.id()), Some(id.clone()));
        assert_eq!(dir.bound_player(&id), Some(first));
    }

    #[test]
    fn test_identify_without_player_after_binding_returns_error() {
        let (dir, _) = directory();
        let conn = MockConnection::new(1);
        dir.identify(&conn, identity(), Some(player("alpha")), ignore)
            .unwrap();

        let result = dir.identify(&conn, identity(), None, ignore);
        assert!(matches!(result, Err(SessionError::AlreadyBound(_))));
    }

    // =====================================================================
    // send()
    // =====================================================================

    #[tokio::test]
    async fn test_send_unidentified_connection_is_plain() {
        let (dir, _) = directory();
        let conn = MockConnection::new(1);

        dir.send(&conn, None, &Response::KeepAlive).await.unwrap();

        let sent = conn.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(peek_mode(&sent[0]).unwrap(), Some(Mode::Plain));
    }

    #[tokio::test]
    async fn test_send_identified_connection_is_encrypted_for_recipient() {
        let (dir, server) = directory();
        let conn = MockConnection::new(1);
        let client = identity();
        dir.identify(&conn, client.clone(), None, ignore).unwrap();

        dir.send(&conn, Some(&client), &Response::KeepAlive)
            .await
            .unwrap();

        let sent = conn.sent();
        assert_eq!(peek_mode(&sent[0]).unwrap(), Some(Mode::Encrypted));

        let client_side = PacketCodec::with_cipher(JsonCodec, Arc::new(PairCipher::new(client)));
        let decoded: Option<Response> = client_side.decode(Some(&server), &sent[0]).unwrap();
        assert_eq!(decoded, Some(Response::KeepAlive));
    }

    #[tokio::test]
    async fn test_send_identified_without_recipient_propagates_codec_error() {
        let (dir, _) = directory();
        let conn = MockConnection::new(1);
        dir.identify(&conn, identity(), None, ignore).unwrap();

        let result = dir.send(&conn, None, &Response::KeepAlive).await;

        assert!(matches!(
            result,
            Err(SessionError::Protocol(tether_protocol::ProtocolError::MissingRecipient))
        ));
        assert!(conn.sent().is_empty());
    }

    // =====================================================================
    // stop_session()
    // =====================================================================

    #[tokio::test]
    async fn test_stop_session_without_record_force_closes_with_code() {
        let (dir, _) = directory();
        let conn = MockConnection::new(1);

        dir.stop_session(&conn, SessionStopReason::Unauthorised, "bad token", None, ignore)
            .await
            .unwrap();

        assert_eq!(conn.closed_with(), Some(1008));
        assert!(conn.sent().is_empty());
    }

    #[tokio::test]
    async fn test_stop_session_with_record_sends_error_and_does_not_close() {
        let (dir, _) = directory();
        let conn = MockConnection::new(1);
        let id = identity();
        let p = player("alpha");
        dir.identify(&conn, id.clone(), Some(p.clone()), ignore)
            .unwrap();

        let mut stopped = None;
        dir.stop_session(
            &conn,
            SessionStopReason::ServerError,
            "boom",
            None,
            |i, pl| stopped = Some((i.clone(), pl.clone())),
        )
        .await
        .unwrap();

        let (stopped_id, stopped_player) = stopped.expect("callback should fire");
        assert_eq!(stopped_id, id);
        assert_eq!(stopped_player.bound, Some(p));

        assert_eq!(conn.closed_with(), None);
        assert_eq!(dir.count(), 0);
        assert!(!dir.is_identified(conn.id()));

        let sent = conn.sent();
        assert_eq!(sent.len(), 1);
        let decoded: Option<Response> = PacketCodec::new(JsonCodec).decode(None, &sent[0]).unwrap();
        assert_eq!(
            decoded,
            Some(Response::SessionFailed {
                failure: SessionFailure::SessionError {
                    reason: SessionStopReason::ServerError,
                    message: "boom".into(),
                }
            })
        );
    }

    #[tokio::test]
    async fn test_stop_session_with_record_on_closed_connection_sends_nothing() {
        let (dir, _) = directory();
        let conn = MockConnection::new(1);
        dir.identify(&conn, identity(), None, ignore).unwrap();
        conn.open.store(false, Ordering::SeqCst);

        dir.stop_session(&conn, SessionStopReason::NormalClose, "", None, ignore)
            .await
            .unwrap();

        assert!(conn.sent().is_empty());
        assert_eq!(conn.closed_with(), None);
        assert_eq!(dir.count(), 0);
    }

    #[tokio::test]
    async fn test_stop_session_with_cause_still_removes_record() {
        let (dir, _) = directory();
        let conn = MockConnection::new(1);
        dir.identify(&conn, identity(), None, ignore).unwrap();
        let cause = TransportError::Shutdown;

        dir.stop_session(&conn, SessionStopReason::ServerError, "crashed", Some(&cause), ignore)
            .await
            .unwrap();

        assert_eq!(dir.count(), 0);
    }

    #[tokio::test]
    async fn test_stop_session_identify_from_callback_keeps_new_binding() {
        let (dir, _) = directory();
        let conn = MockConnection::new(1);
        let id = identity();
        dir.identify(&conn, id.clone(), None, ignore).unwrap();
        let p = player("alpha");

        let mut seen = None;
        dir.stop_session(&conn, SessionStopReason::NormalClose, "", None, |i, pl| {
            seen = Some(pl.bound.clone());
            dir.identify(&conn, i.clone(), Some(p.clone()), ignore)
                .unwrap();
        })
        .await
        .unwrap();

        // The stop saw the record as it was; the late binding survives it.
        assert_eq!(seen, Some(None));
        assert_eq!(dir.count(), 1);
        assert_eq!(dir.bound_player(&id), Some(p));
    }

    #[test]
    fn test_stop_session_racing_identify_never_loses_binding() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .build()
            .unwrap();

        for round in 0..200u64 {
            let (dir, _) = directory();
            let dir = Arc::new(dir);
            let conn = MockConnection::new(round);
            let id = identity();
            dir.identify(&conn, id.clone(), None, ignore).unwrap();
            let stopped_bound = Arc::new(Mutex::new(None));

            let binder = {
                let (dir, conn, id) = (Arc::clone(&dir), Arc::clone(&conn), id.clone());
                std::thread::spawn(move || {
                    dir.identify(&conn, id, Some(player("alpha")), ignore).is_ok()
                })
            };
            runtime.block_on({
                let (dir, conn, stopped_bound) =
                    (Arc::clone(&dir), Arc::clone(&conn), Arc::clone(&stopped_bound));
                async move {
                    dir.stop_session(&*conn, SessionStopReason::NormalClose, "", None, |_, pl| {
                        *stopped_bound.lock().unwrap() = Some(pl.bound.is_some());
                    })
                    .await
                    .unwrap();
                }
            });
            let bound_ok = binder.join().unwrap();

            // Either the binding was part of the stopped session, or it
            // lives on as a new record. It is never silently dropped.
            let seen_by_stop = *stopped_bound.lock().unwrap() == Some(true);
            let still_bound = dir.bound_player(&id).is_some();
            assert!(bound_ok);
            assert!(seen_by_stop ^ still_bound, "round {round}");
        }
    }

    // =====================================================================
    // Lookups
    // =====================================================================

    #[test]
    fn test_find_players_returns_only_co_located_candidates() {
        let (dir, _) = directory();
        let (id1, id2, id3) = (identity(), identity(), identity());
        let p1 = player("alpha");
        let p2 = player("alpha");
        let p3 = player("beta");
        dir.identify(&MockConnection::new(1), id1.clone(), Some(p1), ignore)
            .unwrap();
        dir.identify(&MockConnection::new(2), id2.clone(), Some(p2.clone()), ignore)
            .unwrap();
        dir.identify(&MockConnection::new(3), id3, Some(p3.clone()), ignore)
            .unwrap();

        let found = dir.find_players(&id1, &[p2.id, p3.id]).unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identity, id2);
        assert_eq!(found[0].bound, Some(p2));
    }

    #[test]
    fn test_find_players_without_bound_player_returns_error() {
        let (dir, _) = directory();
        let id = identity();
        dir.identify(&MockConnection::new(1), id.clone(), None, ignore)
            .unwrap();

        let result = dir.find_players(&id, &[Uuid::new_v4()]);
        assert!(matches!(result, Err(SessionError::NoBoundPlayer(_))));
    }

    #[test]
    fn test_lookups_by_player_and_profile() {
        let (dir, _) = directory();
        let conn = MockConnection::new(7);
        let id = identity();
        let p = player("alpha");
        dir.identify(&conn, id.clone(), Some(p.clone()), ignore)
            .unwrap();

        assert_eq!(dir.identity_for_player(&p), Some(id.clone()));
        assert_eq!(dir.identity_by_player_id(p.id), Some(id.clone()));
        assert_eq!(
            dir.record_by_player(p.id).map(|r| r.connection.id()),
            Some(conn.id())
        );
        assert_eq!(
            dir.record_by_owner(id.owner).map(|r| r.identity),
            Some(id.clone())
        );
        assert_eq!(
            dir.connection_for(&id).map(|c| c.id()),
            Some(conn.id())
        );
        assert_eq!(
            dir.find_player_by_profile(id.owner).and_then(|pl| pl.bound),
            Some(p)
        );
        assert!(dir.identity_by_player_id(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_find_player_requires_binding() {
        let (dir, _) = directory();
        let id = identity();
        dir.identify(&MockConnection::new(1), id.clone(), None, ignore)
            .unwrap();

        assert!(dir.find_player(&id).is_none());
        assert!(dir.bound_player(&id).is_none());
        assert!(dir.find_player_by_profile(id.owner).is_some());
    }

    #[test]
    fn test_identify_concurrent_bindings_only_one_wins() {
        let (dir, _) = directory();
        let dir = Arc::new(dir);
        let conn = MockConnection::new(1);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let dir = Arc::clone(&dir);
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || {
                    dir.identify(&conn, identity(), Some(player(&format!("s{i}"))), ignore)
                        .is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .filter_map(|h| h.join().ok())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(dir.count(), 1);
    }
}
