use game_core::Game;

pub const MIN_ROOM_SIZE: usize = 2;
pub const MAX_ROOM_SIZE: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomPhase {
    Lobby,
    Game,
}

/// One room: a roster of client slot indices, a host, and (while the phase is
/// `Game`) the embedded rules engine. Seats in `players` line up with hand
/// positions in the game.
#[derive(Debug)]
pub struct Room {
    pub id: u32,
    pub name: String,
    pub size: usize,
    pub phase: RoomPhase,
    pub paused: bool,
    pub pause_started: u64,
    pub players: Vec<usize>,
    pub host: usize,
    pub game: Option<Game>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoveResult {
    pub removed: bool,
    pub host_changed: bool,
    pub empty: bool,
}

impl Room {
    pub fn new(id: u32, name: String, size: usize, host: usize) -> Self {
        Room {
            id,
            name,
            size,
            phase: RoomPhase::Lobby,
            paused: false,
            pause_started: 0,
            players: vec![host],
            host,
            game: None,
        }
    }

    pub fn phase_str(&self) -> &'static str {
        match self.phase {
            RoomPhase::Lobby => "LOBBY",
            RoomPhase::Game => "GAME",
        }
    }

    pub fn pos_of(&self, client_idx: usize) -> Option<usize> {
        self.players.iter().position(|ci| *ci == client_idx)
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.size
    }

    /// Removes a client from the roster, reassigning the host if needed.
    /// Does not touch the game; in-game removals go through
    /// [`Room::remove_player_in_game`].
    pub fn remove_player(&mut self, client_idx: usize) -> RemoveResult {
        let Some(pos) = self.pos_of(client_idx) else {
            return RemoveResult {
                removed: false,
                host_changed: false,
                empty: self.players.is_empty(),
            };
        };
        self.players.remove(pos);
        let host_changed = self.reassign_host(client_idx);
        RemoveResult {
            removed: true,
            host_changed,
            empty: self.players.is_empty(),
        }
    }

    /// Removes the seat at `ppos` from both the roster and the running game,
    /// compacting the seats above it so positions stay aligned.
    pub fn remove_player_in_game(&mut self, ppos: usize) -> RemoveResult {
        if ppos >= self.players.len() {
            return RemoveResult {
                removed: false,
                host_changed: false,
                empty: self.players.is_empty(),
            };
        }
        let client_idx = self.players.remove(ppos);
        if let Some(game) = self.game.as_mut() {
            game.remove_player(ppos);
        }
        let host_changed = self.reassign_host(client_idx);
        RemoveResult {
            removed: true,
            host_changed,
            empty: self.players.is_empty(),
        }
    }

    fn reassign_host(&mut self, removed_idx: usize) -> bool {
        if self.host == removed_idx && !self.players.is_empty() {
            self.host = self.players[0];
            return true;
        }
        false
    }

    /// Returns the room to the lobby phase and discards the game.
    pub fn end_game(&mut self) {
        self.phase = RoomPhase::Lobby;
        self.paused = false;
        self.pause_started = 0;
        self.game = None;
    }
}
