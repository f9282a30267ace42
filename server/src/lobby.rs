use std::collections::BTreeMap;

use game_core::{Card, Game, GameError, Rank, CARDS_EACH};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::protocol::{clip, ProtoMsg, ProtoType};
use crate::rooms::{Room, RoomPhase, MAX_ROOM_SIZE, MIN_ROOM_SIZE};

pub const IDLE_TIMEOUT_SECS: u64 = 15;
pub const OFFLINE_TIMEOUT_SECS: u64 = 120;
pub const MAX_STRIKES: u32 = 3;
pub const MAX_NICK: usize = 32;
pub const MAX_ROOM_NAME: usize = 31;

pub type LineTx = UnboundedSender<String>;

/// One client slot. A slot survives its socket: on disconnect it goes
/// offline (`tx = None`) and stays reserved for RESUME until the offline
/// timeout reaps it.
#[derive(Debug)]
pub struct ClientSlot {
    pub conn: u64,
    pub nick: String,
    pub session: String,
    pub room_id: Option<u32>,
    pub in_game: bool,
    pub online: bool,
    pub tx: Option<LineTx>,
    pub last_seen: u64,
    pub strikes: u32,
}

/// The coordinator: owns the client slot table and the room table. All
/// mutation funnels through one instance, so handlers always observe a
/// consistent snapshot.
pub struct Lobby {
    clients: Vec<Option<ClientSlot>>,
    rooms: BTreeMap<u32, Room>,
    max_rooms: usize,
    next_room_id: u32,
    next_conn: u64,
    rng: StdRng,
}

fn game_error_code(err: GameError) -> &'static str {
    match err {
        GameError::BadState => "BAD_STATE",
        GameError::NotYourTurn => "NOT_YOUR_TURN",
        GameError::NoSuchCard => "NO_SUCH_CARD",
        GameError::IllegalCard => "ILLEGAL_CARD",
        GameError::WishRequired => "WISH_REQUIRED",
        GameError::BadWish => "BAD_WISH",
        GameError::MustStackOrDraw => "MUST_STACK_OR_DRAW",
    }
}

fn top_line(game: &Game) -> String {
    let top = game
        .top_card
        .map(|c| c.code())
        .unwrap_or_else(|| "-".to_string());
    let suit = game.active_suit.map(|s| s.to_char()).unwrap_or('-');
    format!("EVT TOP card={top} active_suit={suit} penalty={}", game.penalty)
}

impl Lobby {
    pub fn new(max_clients: usize, max_rooms: usize) -> Self {
        Self::with_seed(max_clients, max_rooms, rand::random())
    }

    pub fn with_seed(max_clients: usize, max_rooms: usize, seed: u64) -> Self {
        Lobby {
            clients: (0..max_clients).map(|_| None).collect(),
            rooms: BTreeMap::new(),
            max_rooms,
            next_room_id: 1,
            next_conn: 1,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    // ---- transport entry points -------------------------------------------

    /// Allocates the lowest free slot for a new connection. Returns the slot
    /// index plus a connection token the transport passes back on every call
    /// so a stale task can never touch a reused slot.
    pub fn connect(&mut self, tx: LineTx, now: u64) -> Option<(usize, u64)> {
        let ci = self.clients.iter().position(|c| c.is_none())?;
        let conn = self.next_conn;
        self.next_conn += 1;
        self.clients[ci] = Some(ClientSlot {
            conn,
            nick: String::new(),
            session: String::new(),
            room_id: None,
            in_game: false,
            online: true,
            tx: Some(tx),
            last_seen: now,
            strikes: 0,
        });
        debug!(client = ci, "client connected");
        self.send(ci, "EVT SERVER msg=welcome");
        Some((ci, conn))
    }

    /// Handles one complete line from a connection.
    pub fn handle_line(&mut self, ci: usize, conn: u64, line: &str, now: u64) {
        if !self.owns(ci, conn) {
            return;
        }
        if let Some(slot) = self.slot_mut(ci) {
            slot.last_seen = now;
        }
        let Some(msg) = ProtoMsg::parse(line) else {
            self.strike(ci, now);
            return;
        };
        if msg.msg_type != ProtoType::Req {
            self.send_err(ci, &msg.cmd, "BAD_FORMAT", "expected_req");
            return;
        }
        self.handle_req(ci, &msg, now);
    }

    /// Framing violations (oversized line, buffer overflow) drop the
    /// connection immediately.
    pub fn framing_error(&mut self, ci: usize, conn: u64, reason: &str, now: u64) {
        if !self.owns(ci, conn) {
            return;
        }
        self.send_err(ci, "?", "BAD_FORMAT", reason);
        self.drop_client(ci, now);
    }

    /// Socket-level disconnect: the slot goes offline but stays reserved.
    pub fn disconnect(&mut self, ci: usize, conn: u64, now: u64) {
        if !self.owns(ci, conn) {
            return;
        }
        self.drop_client(ci, now);
    }

    /// Periodic timer work: pause/abort games with offline players, reap
    /// expired offline slots, drop idle sockets.
    pub fn tick(&mut self, now: u64) {
        let rids: Vec<u32> = self.rooms.keys().copied().collect();
        for rid in rids {
            let Some((phase, paused)) = self.rooms.get(&rid).map(|r| (r.phase, r.paused)) else {
                continue;
            };
            if phase != RoomPhase::Game {
                continue;
            }
            if self.room_any_offline(rid) {
                let who = self.first_offline_nick(rid).unwrap_or_default();
                self.pause_room(rid, &who, now);
                let expired = self.rooms.get(&rid).is_some_and(|r| {
                    r.paused
                        && r.pause_started > 0
                        && now.saturating_sub(r.pause_started) > OFFLINE_TIMEOUT_SECS
                });
                if expired {
                    self.abort_game(rid, "reconnect_timeout");
                }
            } else if paused {
                self.resume_room(rid);
                self.broadcast_state(rid);
            }
        }

        for ci in 0..self.clients.len() {
            let expired = match &self.clients[ci] {
                Some(c) => !c.online && now.saturating_sub(c.last_seen) > OFFLINE_TIMEOUT_SECS,
                None => false,
            };
            if expired {
                self.reap_offline_slot(ci);
            }
        }

        for ci in 0..self.clients.len() {
            let idle = match &self.clients[ci] {
                Some(c) => {
                    c.online && c.tx.is_some() && now.saturating_sub(c.last_seen) > IDLE_TIMEOUT_SECS
                }
                None => false,
            };
            if idle {
                debug!(client = ci, "idle timeout");
                self.drop_client(ci, now);
            }
        }
    }

    /// Drops every slot and room; dropping the senders closes the sockets.
    pub fn shutdown(&mut self) {
        for slot in self.clients.iter_mut() {
            *slot = None;
        }
        self.rooms.clear();
    }

    // ---- request dispatch -------------------------------------------------

    fn handle_req(&mut self, ci: usize, msg: &ProtoMsg, now: u64) {
        match msg.cmd.as_str() {
            "LOGIN" => {
                let Some(nick) = msg.get("nick") else {
                    self.send_err(ci, "LOGIN", "BAD_FORMAT", "missing_nick");
                    return;
                };
                self.handle_login(ci, nick);
            }
            "RESUME" => {
                let (Some(nick), Some(session)) = (msg.get("nick"), msg.get("session")) else {
                    self.send_err(ci, "RESUME", "BAD_FORMAT", "missing_fields");
                    return;
                };
                self.handle_resume(ci, nick, session);
            }
            "LIST_ROOMS" => self.handle_list_rooms(ci),
            "CREATE_ROOM" => {
                let (Some(name), Some(size)) = (msg.get("name"), msg.get("size")) else {
                    self.send_err(ci, "CREATE_ROOM", "BAD_FORMAT", "missing_fields");
                    return;
                };
                let size = size.parse::<usize>().unwrap_or(0);
                self.handle_create_room(ci, name, size);
            }
            "JOIN_ROOM" => {
                let Some(room) = msg.get("room") else {
                    self.send_err(ci, "JOIN_ROOM", "BAD_FORMAT", "missing_room");
                    return;
                };
                let rid = room.parse::<u32>().unwrap_or(0);
                self.handle_join_room(ci, rid);
            }
            "LEAVE_ROOM" => self.handle_leave_room(ci),
            "START_GAME" => self.handle_start_game(ci, now),
            "PLAY" => self.handle_play(ci, msg),
            "DRAW" => self.handle_draw(ci),
            "LOGOUT" => self.handle_logout(ci),
            "PING" => {
                if let Some(slot) = self.slot_mut(ci) {
                    slot.online = true;
                    slot.last_seen = now;
                }
                self.send(ci, "RESP PONG");
            }
            other => self.send_err(ci, other, "UNKNOWN_CMD", "unknown"),
        }
    }

    fn handle_login(&mut self, ci: usize, nick: &str) {
        if nick.is_empty() {
            self.send_err(ci, "LOGIN", "BAD_FORMAT", "missing_nick");
            return;
        }
        if nick.len() >= MAX_NICK {
            self.send_err(ci, "LOGIN", "INVALID_VALUE", "nick_too_long");
            return;
        }
        if let Some(existing) = self.find_by_nick(nick) {
            if existing != ci {
                if self.slot(existing).is_some_and(|c| c.online) {
                    self.send_err(ci, "LOGIN", "NICK_TAKEN", "already_online");
                } else {
                    self.send_err(ci, "LOGIN", "NICK_TAKEN", "use_resume_offline");
                }
                return;
            }
        }

        // A re-login from inside a room leaves that room first; the roster
        // must never reference a slot whose room_id was reset.
        if self.slot(ci).and_then(|c| c.room_id).is_some() {
            self.depart_room(ci, None);
        }

        let session = self.make_session();
        let Some(slot) = self.slot_mut(ci) else { return };
        slot.nick = nick.to_string();
        slot.session = session.clone();
        slot.room_id = None;
        slot.in_game = false;
        info!(client = ci, nick, "logged in");
        self.send(ci, &format!("RESP LOGIN ok=1 session={session}"));
    }

    fn handle_resume(&mut self, ci: usize, nick: &str, session: &str) {
        let Some(existing) = self.find_by_nick(nick) else {
            self.send_err(ci, "RESUME", "BAD_SESSION", "no_such_nick");
            return;
        };
        let (session_ok, ex_online) = match self.slot(existing) {
            Some(c) => (c.session == session, c.online),
            None => return,
        };
        if !session_ok {
            self.send_err(ci, "RESUME", "BAD_SESSION", "token");
            return;
        }
        if existing != ci && ex_online {
            self.send_err(ci, "RESUME", "ALREADY_ONLINE", "use_login");
            return;
        }

        if existing != ci {
            let (old_nick, old_session, old_room, old_in_game) = {
                let Some(old) = self.slot_mut(existing) else { return };
                (
                    std::mem::take(&mut old.nick),
                    std::mem::take(&mut old.session),
                    old.room_id,
                    old.in_game,
                )
            };
            if let Some(slot) = self.slot_mut(ci) {
                slot.nick = old_nick;
                slot.session = old_session;
                slot.room_id = old_room;
                slot.in_game = old_in_game;
            }
            if let Some(rid) = old_room {
                if let Some(room) = self.rooms.get_mut(&rid) {
                    for p in room.players.iter_mut() {
                        if *p == existing {
                            *p = ci;
                        }
                    }
                    if room.host == existing {
                        room.host = ci;
                    }
                }
            }
            self.clients[existing] = None;
            info!(client = ci, nick, "session resumed");
        }

        self.send(ci, "RESP RESUME ok=1");

        let Some(rid) = self.slot(ci).and_then(|c| c.room_id) else {
            return;
        };
        if !self.rooms.contains_key(&rid) {
            return;
        }
        let my_nick = self.nick_of(ci);
        self.room_broadcast_except(rid, ci, &format!("EVT PLAYER_ONLINE nick={my_nick}"));
        self.send_roster(rid, ci);
        self.send_state(rid, ci);

        if self.rooms.get(&rid).is_some_and(|r| r.phase == RoomPhase::Game) {
            if let Some(ppos) = self.rooms.get(&rid).and_then(|r| r.pos_of(ci)) {
                self.send_hand(rid, ppos);
            }
            if let Some(game) = self.rooms.get(&rid).and_then(|r| r.game.as_ref()) {
                let line = top_line(game);
                self.send(ci, &line);
            }
            let tn = self.turn_nick(rid);
            self.send(ci, &format!("EVT TURN nick={tn}"));
            if self.rooms.get(&rid).is_some_and(|r| r.paused) {
                self.resume_room(rid);
                self.broadcast_state(rid);
            }
        }
    }

    fn handle_list_rooms(&mut self, ci: usize) {
        if !self.is_logged(ci) {
            self.send_err(ci, "LIST_ROOMS", "NOT_LOGGED", "login_first");
            return;
        }
        self.send(
            ci,
            &format!("RESP LIST_ROOMS ok=1 rooms={}", self.rooms.len()),
        );
        for room in self.rooms.values() {
            self.send(
                ci,
                &format!(
                    "EVT ROOM id={} name={} players={}/{} state={}",
                    room.id,
                    room.name,
                    room.players.len(),
                    room.size,
                    room.phase_str()
                ),
            );
        }
    }

    fn handle_create_room(&mut self, ci: usize, name: &str, size: usize) {
        if !self.is_logged(ci) {
            self.send_err(ci, "CREATE_ROOM", "NOT_LOGGED", "login_first");
            return;
        }
        if self.slot(ci).and_then(|c| c.room_id).is_some() {
            self.send_err(ci, "CREATE_ROOM", "BAD_STATE", "already_in_room");
            return;
        }
        if name.is_empty() {
            self.send_err(ci, "CREATE_ROOM", "BAD_FORMAT", "missing_name");
            return;
        }
        if !(MIN_ROOM_SIZE..=MAX_ROOM_SIZE).contains(&size) {
            self.send_err(ci, "CREATE_ROOM", "INVALID_VALUE", "size_2_4");
            return;
        }
        if self.rooms.len() >= self.max_rooms {
            self.send_err(ci, "CREATE_ROOM", "LIMIT_REACHED", "max_rooms");
            return;
        }

        let rid = self.next_room_id;
        self.next_room_id += 1;
        let room = Room::new(rid, clip(name, MAX_ROOM_NAME).to_string(), size, ci);
        self.rooms.insert(rid, room);
        if let Some(slot) = self.slot_mut(ci) {
            slot.room_id = Some(rid);
            slot.in_game = false;
        }
        let nick = self.nick_of(ci);
        info!(room = rid, host = %nick, "room created");

        self.send(ci, &format!("RESP CREATE_ROOM ok=1 room={rid}"));
        self.room_broadcast(rid, &format!("EVT PLAYER_JOIN nick={nick}"));
        self.broadcast_host(rid);
        self.broadcast_state(rid);
    }

    fn handle_join_room(&mut self, ci: usize, rid: u32) {
        if !self.is_logged(ci) {
            self.send_err(ci, "JOIN_ROOM", "NOT_LOGGED", "login_first");
            return;
        }
        if self.slot(ci).and_then(|c| c.room_id).is_some() {
            self.send_err(ci, "JOIN_ROOM", "BAD_STATE", "already_in_room");
            return;
        }
        {
            let Some(room) = self.rooms.get(&rid) else {
                self.send_err(ci, "JOIN_ROOM", "NO_SUCH_ROOM", "id");
                return;
            };
            if room.phase != RoomPhase::Lobby {
                self.send_err(ci, "JOIN_ROOM", "BAD_STATE", "game_running");
                return;
            }
            if room.is_full() {
                self.send_err(ci, "JOIN_ROOM", "ROOM_FULL", "full");
                return;
            }
        }
        if let Some(room) = self.rooms.get_mut(&rid) {
            room.players.push(ci);
        }
        if let Some(slot) = self.slot_mut(ci) {
            slot.room_id = Some(rid);
            slot.in_game = false;
        }
        let nick = self.nick_of(ci);
        debug!(room = rid, nick = %nick, "joined room");

        self.send(ci, &format!("RESP JOIN_ROOM ok=1 room={rid}"));
        self.send_roster(rid, ci);
        self.room_broadcast_except(rid, ci, &format!("EVT PLAYER_JOIN nick={nick}"));
        self.send_state(rid, ci);
        self.broadcast_state(rid);
    }

    fn handle_leave_room(&mut self, ci: usize) {
        if !self.is_logged(ci) {
            self.send_err(ci, "LEAVE_ROOM", "NOT_LOGGED", "login_first");
            return;
        }
        if self.slot(ci).and_then(|c| c.room_id).is_none() {
            self.send_err(ci, "LEAVE_ROOM", "BAD_STATE", "not_in_room");
            return;
        }
        self.depart_room(ci, Some("RESP LEAVE_ROOM ok=1"));
    }

    fn handle_start_game(&mut self, ci: usize, now: u64) {
        if !self.is_logged(ci) {
            self.send_err(ci, "START_GAME", "NOT_LOGGED", "login_first");
            return;
        }
        let Some(rid) = self.slot(ci).and_then(|c| c.room_id) else {
            self.send_err(ci, "START_GAME", "BAD_STATE", "not_in_room");
            return;
        };
        {
            let Some(room) = self.rooms.get(&rid) else {
                self.send_err(ci, "START_GAME", "BAD_STATE", "no_room");
                return;
            };
            if room.phase != RoomPhase::Lobby {
                self.send_err(ci, "START_GAME", "BAD_STATE", "already_running");
                return;
            }
            if room.host != ci {
                self.send_err(ci, "START_GAME", "NOT_HOST", "host_only");
                return;
            }
            if room.players.len() < MIN_ROOM_SIZE {
                self.send_err(ci, "START_GAME", "NOT_ENOUGH_PLAYERS", "need_at_least_two");
                return;
            }
        }

        let members = {
            let Some(room) = self.rooms.get_mut(&rid) else { return };
            let seed = now ^ u64::from(rid);
            let mut game = Game::new(room.players.len(), seed);
            game.deal(CARDS_EACH);
            game.pick_start_top();
            room.game = Some(game);
            room.phase = RoomPhase::Game;
            room.paused = false;
            room.pause_started = 0;
            room.players.clone()
        };
        for &member in members.iter() {
            if let Some(slot) = self.slot_mut(member) {
                slot.in_game = true;
            }
        }
        let pcount = members.len();
        info!(room = rid, players = pcount, "game started");

        self.send(ci, "RESP START_GAME ok=1");
        self.room_broadcast(rid, &format!("EVT GAME_START players={pcount}"));
        for ppos in 0..pcount {
            self.send_hand(rid, ppos);
        }
        if let Some(game) = self.rooms.get(&rid).and_then(|r| r.game.as_ref()) {
            let line = top_line(game);
            self.room_broadcast(rid, &line);
        }
        let tn = self.turn_nick(rid);
        self.room_broadcast(rid, &format!("EVT TURN nick={tn}"));
        self.broadcast_state(rid);
    }

    fn handle_play(&mut self, ci: usize, msg: &ProtoMsg) {
        if self.in_paused_game(ci) {
            self.send_err(ci, "PLAY", "PAUSED", "wait_for_reconnect");
            return;
        }
        let Some((rid, ppos)) = self.ensure_in_game(ci) else {
            self.send_err(ci, "PLAY", "BAD_STATE", "no_game");
            return;
        };
        let Some(scard) = msg.get("card") else {
            self.send_err(ci, "PLAY", "BAD_FORMAT", "missing_card");
            return;
        };
        let Some(card) = Card::from_code(scard) else {
            self.send_err(ci, "PLAY", "BAD_FORMAT", "bad_card");
            return;
        };
        let wish = msg.get("wish");

        let result = self
            .rooms
            .get_mut(&rid)
            .and_then(|room| room.game.as_mut())
            .map(|game| game.play(ppos, card, wish));
        let outcome = match result {
            Some(Ok(outcome)) => outcome,
            Some(Err(err)) => {
                self.send_err(ci, "PLAY", game_error_code(err), "rejected");
                return;
            }
            None => {
                self.send_err(ci, "PLAY", "BAD_STATE", "no_game");
                return;
            }
        };

        let nick = self.nick_of(ci);
        self.send(ci, "RESP PLAY ok=1");

        let wish_suffix = if card.rank == Rank::Queen {
            wish.and_then(|w| w.chars().next())
                .map(|ch| format!(" wish={ch}"))
                .unwrap_or_default()
        } else {
            String::new()
        };
        self.room_broadcast(
            rid,
            &format!("EVT PLAYED nick={nick} card={}{wish_suffix}", card.code()),
        );
        if let Some(game) = self.rooms.get(&rid).and_then(|r| r.game.as_ref()) {
            let line = top_line(game);
            self.room_broadcast(rid, &line);
        }
        self.send_hand(rid, ppos);

        if let Some(winner_pos) = outcome.winner {
            let winner_ci = self
                .rooms
                .get(&rid)
                .and_then(|r| r.players.get(winner_pos).copied());
            if let Some(wci) = winner_ci {
                let wnick = self.nick_of(wci);
                self.room_broadcast(rid, &format!("EVT GAME_END winner={wnick}"));
            }
            info!(room = rid, "game ended");
            self.end_room_game(rid);
            self.broadcast_state(rid);
            return;
        }

        let tn = self.turn_nick(rid);
        self.room_broadcast(rid, &format!("EVT TURN nick={tn}"));
        self.broadcast_state(rid);
    }

    fn handle_draw(&mut self, ci: usize) {
        if self.in_paused_game(ci) {
            self.send_err(ci, "DRAW", "PAUSED", "wait_for_reconnect");
            return;
        }
        let Some((rid, ppos)) = self.ensure_in_game(ci) else {
            self.send_err(ci, "DRAW", "BAD_STATE", "no_game");
            return;
        };

        let result = self
            .rooms
            .get_mut(&rid)
            .and_then(|room| room.game.as_mut())
            .map(|game| game.draw(ppos));
        let drawn = match result {
            Some(Ok(drawn)) => drawn,
            Some(Err(err)) => {
                self.send_err(ci, "DRAW", game_error_code(err), "rejected");
                return;
            }
            None => {
                self.send_err(ci, "DRAW", "BAD_STATE", "no_game");
                return;
            }
        };

        self.send(ci, &format!("RESP DRAW ok=1 count={}", drawn.len()));
        self.send_hand(rid, ppos);
        let tn = self.turn_nick(rid);
        self.room_broadcast(rid, &format!("EVT TURN nick={tn}"));
        self.broadcast_state(rid);
    }

    fn handle_logout(&mut self, ci: usize) {
        let nick = self.nick_of(ci);
        if let Some(rid) = self.slot(ci).and_then(|c| c.room_id) {
            if self.rooms.contains_key(&rid) {
                self.room_broadcast(rid, &format!("EVT PLAYER_LEAVE nick={nick}"));
                if self.rooms.get(&rid).is_some_and(|r| r.phase == RoomPhase::Game) {
                    self.abort_game(rid, "logout");
                }
                let result = self.rooms.get_mut(&rid).map(|room| room.remove_player(ci));
                if let Some(result) = result {
                    if result.host_changed {
                        self.broadcast_host(rid);
                    }
                    if result.empty {
                        self.rooms.remove(&rid);
                        debug!(room = rid, "room destroyed");
                    } else {
                        self.broadcast_state(rid);
                    }
                }
            }
        }
        self.send(ci, "RESP LOGOUT ok=1");
        info!(client = ci, nick = %nick, "logged out");
        self.clients[ci] = None;
    }

    // ---- room plumbing ----------------------------------------------------

    /// Shared leave path: broadcast the departure, compact the room (and the
    /// game if one is running), then settle the room's fate. `resp` is the
    /// confirmation line, emitted at the point the protocol expects it.
    fn depart_room(&mut self, ci: usize, resp: Option<&str>) {
        let nick = self.nick_of(ci);
        let Some(rid) = self.slot(ci).and_then(|c| c.room_id) else {
            if let Some(r) = resp {
                self.send(ci, r);
            }
            return;
        };
        if !self.rooms.contains_key(&rid) {
            if let Some(slot) = self.slot_mut(ci) {
                slot.room_id = None;
                slot.in_game = false;
            }
            if let Some(r) = resp {
                self.send(ci, r);
            }
            return;
        }

        self.room_broadcast(rid, &format!("EVT PLAYER_LEAVE nick={nick}"));

        let (result, was_game) = {
            let Some(room) = self.rooms.get_mut(&rid) else { return };
            let was_game = room.phase == RoomPhase::Game;
            let result = if was_game {
                match room.pos_of(ci) {
                    Some(ppos) => room.remove_player_in_game(ppos),
                    None => room.remove_player(ci),
                }
            } else {
                room.remove_player(ci)
            };
            (result, was_game)
        };

        if result.host_changed {
            self.broadcast_host(rid);
        }
        if result.empty {
            self.rooms.remove(&rid);
            debug!(room = rid, "room destroyed");
        }
        if let Some(slot) = self.slot_mut(ci) {
            slot.room_id = None;
            slot.in_game = false;
        }
        if let Some(r) = resp {
            self.send(ci, r);
        }
        if result.empty {
            return;
        }

        if was_game {
            let pcount = self.rooms.get(&rid).map_or(0, |r| r.players.len());
            if pcount < 2 {
                if pcount == 1 {
                    // Single survivor wins by default.
                    let lone = self.rooms.get(&rid).and_then(|r| r.players.first().copied());
                    if let Some(wci) = lone {
                        let wnick = self.nick_of(wci);
                        if !wnick.is_empty() {
                            self.room_broadcast(rid, &format!("EVT GAME_END winner={wnick}"));
                        }
                    }
                } else {
                    self.room_broadcast(rid, "EVT GAME_ABORT reason=not_enough_players");
                }
                self.end_room_game(rid);
                self.broadcast_state(rid);
                return;
            }
            for ppos in 0..pcount {
                self.send_hand(rid, ppos);
            }
            let tn = self.turn_nick(rid);
            if tn != "-" {
                self.room_broadcast(rid, &format!("EVT TURN nick={tn}"));
            }
            self.broadcast_state(rid);
            return;
        }

        self.broadcast_state(rid);
    }

    /// Offline longer than the reconnect window: remove from any room and
    /// free the slot for good.
    fn reap_offline_slot(&mut self, ci: usize) {
        let nick = self.nick_of(ci);
        if let Some(rid) = self.slot(ci).and_then(|c| c.room_id) {
            if self.rooms.contains_key(&rid) {
                self.room_broadcast(rid, &format!("EVT PLAYER_LEAVE nick={nick}"));
                if self.rooms.get(&rid).is_some_and(|r| r.phase == RoomPhase::Game) {
                    self.abort_game(rid, "player_removed");
                }
                let result = self.rooms.get_mut(&rid).map(|room| room.remove_player(ci));
                if let Some(result) = result {
                    if result.host_changed {
                        self.broadcast_host(rid);
                    }
                    if result.empty {
                        self.rooms.remove(&rid);
                        debug!(room = rid, "room destroyed");
                    } else {
                        self.broadcast_state(rid);
                    }
                }
            }
        }
        info!(client = ci, nick = %nick, "offline timeout, slot freed");
        self.clients[ci] = None;
    }

    fn drop_client(&mut self, ci: usize, now: u64) {
        let (nick, rid) = {
            let Some(slot) = self.slot_mut(ci) else { return };
            slot.tx = None;
            slot.online = false;
            slot.last_seen = now;
            (slot.nick.clone(), slot.room_id)
        };
        debug!(client = ci, "client went offline");
        let Some(rid) = rid else { return };
        if !self.rooms.contains_key(&rid) {
            if let Some(slot) = self.slot_mut(ci) {
                slot.room_id = None;
            }
            return;
        }
        self.room_broadcast(rid, &format!("EVT PLAYER_OFFLINE nick={nick}"));
        if self.rooms.get(&rid).is_some_and(|r| r.phase == RoomPhase::Game) {
            self.pause_room(rid, &nick, now);
            self.broadcast_state(rid);
        }
    }

    fn pause_room(&mut self, rid: u32, who: &str, now: u64) {
        {
            let Some(room) = self.rooms.get_mut(&rid) else { return };
            if room.phase != RoomPhase::Game || room.paused {
                return;
            }
            room.paused = true;
            room.pause_started = now;
        }
        info!(room = rid, nick = %who, "game paused");
        if who.is_empty() {
            self.room_broadcast(rid, &format!("EVT GAME_PAUSED timeout={OFFLINE_TIMEOUT_SECS}"));
        } else {
            self.room_broadcast(
                rid,
                &format!("EVT GAME_PAUSED nick={who} timeout={OFFLINE_TIMEOUT_SECS}"),
            );
        }
    }

    fn resume_room(&mut self, rid: u32) {
        if self.room_any_offline(rid) {
            return;
        }
        let resumed = {
            let Some(room) = self.rooms.get_mut(&rid) else { return };
            if room.phase != RoomPhase::Game || !room.paused {
                false
            } else {
                room.paused = false;
                room.pause_started = 0;
                true
            }
        };
        if resumed {
            info!(room = rid, "game resumed");
            self.room_broadcast(rid, "EVT GAME_RESUMED");
        }
    }

    fn abort_game(&mut self, rid: u32, reason: &str) {
        let members = {
            let Some(room) = self.rooms.get_mut(&rid) else { return };
            if room.phase != RoomPhase::Game {
                return;
            }
            room.end_game();
            room.players.clone()
        };
        for &member in members.iter() {
            if let Some(slot) = self.slot_mut(member) {
                slot.in_game = false;
            }
        }
        info!(room = rid, reason, "game aborted");
        self.room_broadcast(rid, &format!("EVT GAME_ABORT reason={reason}"));
        self.broadcast_state(rid);
    }

    /// Ends the game without an abort broadcast (a winner was announced).
    fn end_room_game(&mut self, rid: u32) {
        let members = {
            let Some(room) = self.rooms.get_mut(&rid) else { return };
            room.end_game();
            room.players.clone()
        };
        for &member in members.iter() {
            if let Some(slot) = self.slot_mut(member) {
                slot.in_game = false;
            }
        }
    }

    fn ensure_in_game(&self, ci: usize) -> Option<(u32, usize)> {
        let rid = self.slot(ci)?.room_id?;
        let room = self.rooms.get(&rid)?;
        if room.phase != RoomPhase::Game || room.paused {
            return None;
        }
        let ppos = room.pos_of(ci)?;
        Some((rid, ppos))
    }

    fn in_paused_game(&self, ci: usize) -> bool {
        self.slot(ci)
            .and_then(|c| c.room_id)
            .and_then(|rid| self.rooms.get(&rid))
            .is_some_and(|r| r.phase == RoomPhase::Game && r.paused)
    }

    fn room_any_offline(&self, rid: u32) -> bool {
        self.rooms.get(&rid).is_some_and(|room| {
            room.players.iter().any(|&ci| !self.client_active(ci))
        })
    }

    fn first_offline_nick(&self, rid: u32) -> Option<String> {
        let room = self.rooms.get(&rid)?;
        room.players
            .iter()
            .find(|&&ci| !self.client_active(ci))
            .map(|&ci| self.nick_of(ci))
    }

    // ---- sending ----------------------------------------------------------

    fn send(&self, ci: usize, line: &str) {
        if let Some(Some(slot)) = self.clients.get(ci) {
            if let Some(tx) = &slot.tx {
                let _ = tx.send(format!("{line}\n"));
            }
        }
    }

    fn send_err(&self, ci: usize, cmd: &str, code: &str, msg: &str) {
        self.send(ci, &format!("ERR {cmd} code={code} msg={msg}"));
    }

    fn room_broadcast(&self, rid: u32, line: &str) {
        let Some(room) = self.rooms.get(&rid) else { return };
        for &ci in room.players.iter() {
            self.send(ci, line);
        }
    }

    fn room_broadcast_except(&self, rid: u32, except: usize, line: &str) {
        let Some(room) = self.rooms.get(&rid) else { return };
        for &ci in room.players.iter() {
            if ci != except {
                self.send(ci, line);
            }
        }
    }

    fn broadcast_state(&self, rid: u32) {
        let Some(room) = self.rooms.get(&rid) else { return };
        for &ci in room.players.iter() {
            self.send_state(rid, ci);
        }
    }

    fn broadcast_host(&self, rid: u32) {
        let Some(room) = self.rooms.get(&rid) else { return };
        let nick = self.nick_of(room.host);
        if !nick.is_empty() {
            self.room_broadcast(rid, &format!("EVT HOST nick={nick}"));
        }
    }

    fn send_state(&self, rid: u32, ci: usize) {
        let Some(room) = self.rooms.get(&rid) else { return };
        let (top, suit, penalty) = match room.game.as_ref() {
            Some(g) => (
                g.top_card
                    .map(|c| c.code())
                    .unwrap_or_else(|| "-".to_string()),
                g.active_suit.map(|s| s.to_char()).unwrap_or('-'),
                g.penalty,
            ),
            None => ("-".to_string(), '-', 0),
        };
        let turn = self.turn_nick(rid);
        self.send(
            ci,
            &format!(
                "EVT STATE room={} phase={} paused={} top={top} active_suit={suit} penalty={penalty} turn={turn}",
                room.id,
                room.phase_str(),
                room.paused as u8
            ),
        );
    }

    fn send_roster(&self, rid: u32, to_ci: usize) {
        let Some(room) = self.rooms.get(&rid) else { return };
        let host_nick = self.nick_of(room.host);
        if !host_nick.is_empty() {
            self.send(to_ci, &format!("EVT HOST nick={host_nick}"));
        }
        for &ci in room.players.iter() {
            let Some(slot) = self.slot(ci) else { continue };
            if slot.nick.is_empty() {
                continue;
            }
            self.send(to_ci, &format!("EVT PLAYER_JOIN nick={}", slot.nick));
            if slot.online && slot.tx.is_some() {
                self.send(to_ci, &format!("EVT PLAYER_ONLINE nick={}", slot.nick));
            } else {
                self.send(to_ci, &format!("EVT PLAYER_OFFLINE nick={}", slot.nick));
            }
        }
    }

    fn send_hand(&self, rid: u32, ppos: usize) {
        let Some(room) = self.rooms.get(&rid) else { return };
        let Some(game) = room.game.as_ref() else { return };
        let Some(&ci) = room.players.get(ppos) else { return };
        if ppos >= game.player_count() {
            return;
        }
        let cards = game
            .hand(ppos)
            .iter()
            .map(|c| c.code())
            .collect::<Vec<_>>()
            .join(",");
        self.send(ci, &format!("EVT HAND cards={cards}"));
    }

    fn turn_nick(&self, rid: u32) -> String {
        let Some(room) = self.rooms.get(&rid) else {
            return "-".to_string();
        };
        if room.phase != RoomPhase::Game {
            return "-".to_string();
        }
        let Some(game) = room.game.as_ref() else {
            return "-".to_string();
        };
        room.players
            .get(game.turn_pos)
            .map(|&ci| self.nick_of(ci))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "-".to_string())
    }

    // ---- slot helpers -----------------------------------------------------

    fn owns(&self, ci: usize, conn: u64) -> bool {
        match self.clients.get(ci) {
            Some(Some(c)) => c.conn == conn && c.tx.is_some(),
            _ => false,
        }
    }

    fn slot(&self, ci: usize) -> Option<&ClientSlot> {
        self.clients.get(ci).and_then(|s| s.as_ref())
    }

    fn slot_mut(&mut self, ci: usize) -> Option<&mut ClientSlot> {
        self.clients.get_mut(ci).and_then(|s| s.as_mut())
    }

    fn nick_of(&self, ci: usize) -> String {
        self.slot(ci).map(|c| c.nick.clone()).unwrap_or_default()
    }

    fn is_logged(&self, ci: usize) -> bool {
        self.slot(ci)
            .is_some_and(|c| !c.nick.is_empty() && !c.session.is_empty())
    }

    fn client_active(&self, ci: usize) -> bool {
        self.slot(ci).is_some_and(|c| c.online && c.tx.is_some())
    }

    fn find_by_nick(&self, nick: &str) -> Option<usize> {
        self.clients.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|c| !c.nick.is_empty() && c.nick == nick)
        })
    }

    fn strike(&mut self, ci: usize, now: u64) {
        let drop_now = {
            let Some(slot) = self.slot_mut(ci) else { return };
            slot.strikes += 1;
            slot.strikes > MAX_STRIKES
        };
        self.send_err(ci, "?", "BAD_FORMAT", "parse_error");
        if drop_now {
            debug!(client = ci, "too many protocol errors");
            self.drop_client(ci, now);
        }
    }

    fn make_session(&mut self) -> String {
        format!("{:032x}", self.rng.gen::<u128>())
    }

    // ---- introspection (used by the integration tests) --------------------

    pub fn is_connected(&self, ci: usize) -> bool {
        self.slot(ci).is_some()
    }

    pub fn is_online(&self, ci: usize) -> bool {
        self.client_active(ci)
    }

    pub fn client_nick(&self, ci: usize) -> Option<String> {
        self.slot(ci).map(|c| c.nick.clone())
    }

    pub fn client_room(&self, ci: usize) -> Option<u32> {
        self.slot(ci).and_then(|c| c.room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_phase(&self, rid: u32) -> Option<RoomPhase> {
        self.rooms.get(&rid).map(|r| r.phase)
    }

    pub fn room_paused(&self, rid: u32) -> Option<bool> {
        self.rooms.get(&rid).map(|r| r.paused)
    }

    pub fn room_player_count(&self, rid: u32) -> Option<usize> {
        self.rooms.get(&rid).map(|r| r.players.len())
    }

    pub fn room_game_mut(&mut self, rid: u32) -> Option<&mut Game> {
        self.rooms.get_mut(&rid).and_then(|r| r.game.as_mut())
    }
}
