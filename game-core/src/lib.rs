use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;

pub const DECK_SIZE: usize = 32;
pub const MAX_HAND: usize = 32;
pub const CARDS_EACH: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Suit {
    Spades,
    Hearts,
    Diamonds,
    Clubs,
}

impl Suit {
    fn index(&self) -> u8 {
        match self {
            Suit::Spades => 0,
            Suit::Hearts => 1,
            Suit::Diamonds => 2,
            Suit::Clubs => 3,
        }
    }

    fn from_index(i: u8) -> Option<Self> {
        match i {
            0 => Some(Suit::Spades),
            1 => Some(Suit::Hearts),
            2 => Some(Suit::Diamonds),
            3 => Some(Suit::Clubs),
            _ => None,
        }
    }

    pub fn from_char(ch: char) -> Option<Self> {
        match ch {
            'S' => Some(Suit::Spades),
            'H' => Some(Suit::Hearts),
            'D' => Some(Suit::Diamonds),
            'C' => Some(Suit::Clubs),
            _ => None,
        }
    }

    pub fn to_char(&self) -> char {
        match self {
            Suit::Spades => 'S',
            Suit::Hearts => 'H',
            Suit::Diamonds => 'D',
            Suit::Clubs => 'C',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Rank {
    Seven,
    Eight,
    Nine,
    Ten,
    Jack,
    Queen,
    King,
    Ace,
}

impl Rank {
    fn index(&self) -> u8 {
        match self {
            Rank::Seven => 0,
            Rank::Eight => 1,
            Rank::Nine => 2,
            Rank::Ten => 3,
            Rank::Jack => 4,
            Rank::Queen => 5,
            Rank::King => 6,
            Rank::Ace => 7,
        }
    }

    fn from_index(i: u8) -> Option<Self> {
        match i {
            0 => Some(Rank::Seven),
            1 => Some(Rank::Eight),
            2 => Some(Rank::Nine),
            3 => Some(Rank::Ten),
            4 => Some(Rank::Jack),
            5 => Some(Rank::Queen),
            6 => Some(Rank::King),
            7 => Some(Rank::Ace),
            _ => None,
        }
    }

    pub fn from_char(ch: char) -> Option<Self> {
        match ch {
            '7' => Some(Rank::Seven),
            '8' => Some(Rank::Eight),
            '9' => Some(Rank::Nine),
            'X' => Some(Rank::Ten),
            'J' => Some(Rank::Jack),
            'Q' => Some(Rank::Queen),
            'K' => Some(Rank::King),
            'A' => Some(Rank::Ace),
            _ => None,
        }
    }

    pub fn to_char(&self) -> char {
        match self {
            Rank::Seven => '7',
            Rank::Eight => '8',
            Rank::Nine => '9',
            Rank::Ten => 'X',
            Rank::Jack => 'J',
            Rank::Queen => 'Q',
            Rank::King => 'K',
            Rank::Ace => 'A',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Card {
    pub suit: Suit,
    pub rank: Rank,
}

impl Card {
    pub fn index(&self) -> u8 {
        self.suit.index() * 8 + self.rank.index()
    }

    pub fn from_index(i: u8) -> Option<Self> {
        let suit = Suit::from_index(i / 8)?;
        let rank = Rank::from_index(i % 8)?;
        Some(Card { suit, rank })
    }

    pub fn code(&self) -> String {
        let mut s = String::with_capacity(2);
        s.push(self.suit.to_char());
        s.push(self.rank.to_char());
        s
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let mut chars = code.chars();
        let suit = Suit::from_char(chars.next()?)?;
        let rank = Rank::from_char(chars.next()?)?;
        if chars.next().is_some() {
            return None;
        }
        Some(Card { suit, rank })
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

pub fn full_deck() -> Vec<Card> {
    let mut deck = Vec::with_capacity(DECK_SIZE);
    let suits = [Suit::Spades, Suit::Hearts, Suit::Diamonds, Suit::Clubs];
    let ranks = [
        Rank::Seven,
        Rank::Eight,
        Rank::Nine,
        Rank::Ten,
        Rank::Jack,
        Rank::Queen,
        Rank::King,
        Rank::Ace,
    ];
    for suit in suits.iter() {
        for rank in ranks.iter() {
            deck.push(Card {
                suit: *suit,
                rank: *rank,
            });
        }
    }
    deck
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameError {
    BadState,
    NotYourTurn,
    NoSuchCard,
    IllegalCard,
    WishRequired,
    BadWish,
    MustStackOrDraw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub skip_next: bool,
    pub added_penalty: u32,
    pub winner: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct Game {
    pub running: bool,
    pub ended: bool,
    pub deck: Vec<Card>,
    pub discard: Vec<Card>,
    pub hands: Vec<Vec<Card>>,
    pub top_card: Option<Card>,
    pub active_suit: Option<Suit>,
    pub penalty: u32,
    pub turn_pos: usize,
    rng: StdRng,
}

impl Game {
    pub fn new(player_count: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut deck = full_deck();
        deck.shuffle(&mut rng);
        Game {
            running: true,
            ended: false,
            deck,
            discard: Vec::new(),
            hands: vec![Vec::new(); player_count],
            top_card: None,
            active_suit: None,
            penalty: 0,
            turn_pos: 0,
            rng,
        }
    }

    pub fn player_count(&self) -> usize {
        self.hands.len()
    }

    pub fn hand(&self, ppos: usize) -> &[Card] {
        &self.hands[ppos]
    }

    pub fn has_card(&self, ppos: usize, card: Card) -> bool {
        self.hands[ppos].contains(&card)
    }

    /// Serves the next card, recycling the discard pile (minus its kept top
    /// card) back into the deck when the deck runs dry.
    fn draw_one(&mut self) -> Option<Card> {
        if let Some(c) = self.deck.pop() {
            return Some(c);
        }
        if self.discard.len() <= 1 {
            return None;
        }
        let keep = self.discard.pop()?;
        let mut rest = std::mem::take(&mut self.discard);
        rest.shuffle(&mut self.rng);
        self.deck = rest;
        self.discard.push(keep);
        self.deck.pop()
    }

    pub fn deal(&mut self, cards_each: usize) {
        for p in 0..self.hands.len() {
            self.hands[p].clear();
            for _ in 0..cards_each {
                match self.draw_one() {
                    Some(c) => self.hands[p].push(c),
                    None => break,
                }
            }
        }
    }

    /// Draws the starting top card. Queens, sevens and aces are skipped onto
    /// the discard pile so the opening card never carries an effect.
    pub fn pick_start_top(&mut self) {
        while let Some(c) = self.draw_one() {
            if matches!(c.rank, Rank::Queen | Rank::Seven | Rank::Ace) {
                self.discard.push(c);
                continue;
            }
            self.top_card = Some(c);
            self.active_suit = Some(c.suit);
            self.discard.push(c);
            break;
        }
    }

    fn remove_from_hand(&mut self, ppos: usize, card: Card) {
        let hand = &mut self.hands[ppos];
        if let Some(pos) = hand.iter().position(|c| *c == card) {
            hand.swap_remove(pos);
        }
    }

    fn advance_turn(&mut self, skip_next: bool) {
        let n = self.hands.len();
        if n == 0 {
            return;
        }
        self.turn_pos = (self.turn_pos + 1) % n;
        if skip_next {
            self.turn_pos = (self.turn_pos + 1) % n;
        }
    }

    fn check_legal(&self, card: Card, wish: Option<&str>) -> Result<(), GameError> {
        if self.penalty > 0 {
            if card.rank != Rank::Seven {
                return Err(GameError::MustStackOrDraw);
            }
            return Ok(());
        }

        if card.rank == Rank::Queen {
            let ch = match wish.and_then(|w| w.chars().next()) {
                Some(ch) => ch,
                None => return Err(GameError::WishRequired),
            };
            if Suit::from_char(ch).is_none() {
                return Err(GameError::BadWish);
            }
            return Ok(());
        }

        match (self.active_suit, self.top_card) {
            (Some(active), Some(top)) => {
                if card.suit == active || card.rank == top.rank {
                    Ok(())
                } else {
                    Err(GameError::IllegalCard)
                }
            }
            _ => Err(GameError::BadState),
        }
    }

    pub fn play(
        &mut self,
        ppos: usize,
        card: Card,
        wish: Option<&str>,
    ) -> Result<Outcome, GameError> {
        if !self.running || self.ended {
            return Err(GameError::BadState);
        }
        if ppos != self.turn_pos {
            return Err(GameError::NotYourTurn);
        }
        if !self.has_card(ppos, card) {
            return Err(GameError::NoSuchCard);
        }
        self.check_legal(card, wish)?;

        self.remove_from_hand(ppos, card);
        self.top_card = Some(card);
        self.discard.push(card);

        if card.rank == Rank::Queen {
            self.active_suit = wish.and_then(|w| w.chars().next()).and_then(Suit::from_char);
        } else {
            self.active_suit = Some(card.suit);
        }

        let mut out = Outcome {
            skip_next: false,
            added_penalty: 0,
            winner: None,
        };
        if card.rank == Rank::Seven {
            self.penalty += 2;
            out.added_penalty = 2;
        }
        if card.rank == Rank::Ace {
            out.skip_next = true;
        }

        if self.hands[ppos].is_empty() {
            self.ended = true;
            out.winner = Some(ppos);
            return Ok(out);
        }

        self.advance_turn(out.skip_next);
        Ok(out)
    }

    pub fn draw(&mut self, ppos: usize) -> Result<Vec<Card>, GameError> {
        if !self.running || self.ended {
            return Err(GameError::BadState);
        }
        if ppos != self.turn_pos {
            return Err(GameError::NotYourTurn);
        }

        let want = if self.penalty > 0 {
            self.penalty as usize
        } else {
            1
        };

        let mut drawn = Vec::new();
        for _ in 0..want {
            match self.draw_one() {
                Some(c) => {
                    if self.hands[ppos].len() < MAX_HAND {
                        self.hands[ppos].push(c);
                        drawn.push(c);
                    }
                }
                None => break,
            }
        }

        self.penalty = 0;
        self.advance_turn(false);
        Ok(drawn)
    }

    /// Drops the hand at `ppos` and compacts the seats above it. The caller
    /// keeps the room roster in step with the hand list.
    pub fn remove_player(&mut self, ppos: usize) {
        if ppos >= self.hands.len() {
            return;
        }
        self.hands.remove(ppos);
        if self.turn_pos > ppos {
            self.turn_pos -= 1;
        }
        if self.turn_pos >= self.hands.len() {
            self.turn_pos = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(suit: Suit, rank: Rank) -> Card {
        Card { suit, rank }
    }

    fn cards_in_play(g: &Game) -> usize {
        g.deck.len() + g.discard.len() + g.hands.iter().map(|h| h.len()).sum::<usize>()
    }

    #[test]
    fn full_deck_has_32_distinct_cards() {
        let deck = full_deck();
        assert_eq!(deck.len(), 32);
        let mut seen = std::collections::HashSet::new();
        for c in deck.iter() {
            assert!(seen.insert(c.index()));
        }
    }

    #[test]
    fn card_index_round_trip() {
        for i in 0..32u8 {
            let c = Card::from_index(i).unwrap();
            assert_eq!(c.index(), i);
        }
        assert!(Card::from_index(32).is_none());
    }

    #[test]
    fn card_code_round_trip() {
        for i in 0..32u8 {
            let c = Card::from_index(i).unwrap();
            let parsed = Card::from_code(&c.code()).unwrap();
            assert_eq!(parsed, c);
        }
    }

    #[test]
    fn ten_renders_as_x() {
        let c = card(Suit::Hearts, Rank::Ten);
        assert_eq!(c.code(), "HX");
        assert_eq!(Card::from_code("HX").unwrap(), c);
    }

    #[test]
    fn from_code_rejects_garbage() {
        assert!(Card::from_code("").is_none());
        assert!(Card::from_code("S").is_none());
        assert!(Card::from_code("Z7").is_none());
        assert!(Card::from_code("S1").is_none());
        assert!(Card::from_code("S7x").is_none());
    }

    #[test]
    fn new_game_starts_running() {
        let g = Game::new(3, 42);
        assert!(g.running);
        assert!(!g.ended);
        assert_eq!(g.turn_pos, 0);
        assert_eq!(g.penalty, 0);
        assert_eq!(g.deck.len(), 32);
        assert_eq!(g.player_count(), 3);
    }

    #[test]
    fn deal_gives_four_cards_each() {
        for players in 2..=4 {
            let mut g = Game::new(players, 7);
            g.deal(CARDS_EACH);
            for p in 0..players {
                assert_eq!(g.hand(p).len(), 4);
            }
            assert_eq!(g.deck.len(), 32 - players * 4);
            assert_eq!(cards_in_play(&g), 32);
        }
    }

    #[test]
    fn pick_start_top_skips_specials() {
        for seed in 0..40 {
            let mut g = Game::new(2, seed);
            g.deal(CARDS_EACH);
            g.pick_start_top();
            let top = g.top_card.unwrap();
            assert!(!matches!(top.rank, Rank::Queen | Rank::Seven | Rank::Ace));
            assert_eq!(g.active_suit, Some(top.suit));
            assert_eq!(*g.discard.last().unwrap(), top);
            assert_eq!(cards_in_play(&g), 32);
        }
    }

    #[test]
    fn play_rejects_out_of_turn() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        let c = g.hand(1)[0];
        assert_eq!(g.play(1, c, None).err(), Some(GameError::NotYourTurn));
    }

    #[test]
    fn play_rejects_unowned_card() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        let missing = full_deck()
            .into_iter()
            .find(|c| !g.has_card(0, *c))
            .unwrap();
        assert_eq!(g.play(0, missing, None).err(), Some(GameError::NoSuchCard));
    }

    #[test]
    fn play_matches_suit_or_rank() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.top_card = Some(card(Suit::Spades, Rank::Nine));
        g.active_suit = Some(Suit::Spades);
        g.turn_pos = 0;
        g.hands[0] = vec![
            card(Suit::Spades, Rank::King),
            card(Suit::Hearts, Rank::Nine),
            card(Suit::Hearts, Rank::Eight),
        ];

        assert_eq!(
            g.play(0, card(Suit::Hearts, Rank::Eight), None).err(),
            Some(GameError::IllegalCard)
        );
        g.play(0, card(Suit::Spades, Rank::King), None).unwrap();
        assert_eq!(g.top_card, Some(card(Suit::Spades, Rank::King)));
        assert_eq!(g.turn_pos, 1);
    }

    #[test]
    fn rank_match_changes_active_suit() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.top_card = Some(card(Suit::Spades, Rank::Nine));
        g.active_suit = Some(Suit::Spades);
        g.turn_pos = 0;
        g.hands[0] = vec![card(Suit::Hearts, Rank::Nine), card(Suit::Hearts, Rank::Eight)];

        g.play(0, card(Suit::Hearts, Rank::Nine), None).unwrap();
        assert_eq!(g.active_suit, Some(Suit::Hearts));
    }

    #[test]
    fn queen_requires_wish() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.turn_pos = 0;
        g.hands[0] = vec![card(Suit::Spades, Rank::Queen), card(Suit::Hearts, Rank::Eight)];

        assert_eq!(
            g.play(0, card(Suit::Spades, Rank::Queen), None).err(),
            Some(GameError::WishRequired)
        );
        assert_eq!(
            g.play(0, card(Suit::Spades, Rank::Queen), Some("Z")).err(),
            Some(GameError::BadWish)
        );
        g.play(0, card(Suit::Spades, Rank::Queen), Some("H")).unwrap();
        assert_eq!(g.active_suit, Some(Suit::Hearts));
        assert_eq!(g.top_card, Some(card(Suit::Spades, Rank::Queen)));
    }

    #[test]
    fn queen_is_legal_on_any_suit() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.top_card = Some(card(Suit::Diamonds, Rank::Nine));
        g.active_suit = Some(Suit::Diamonds);
        g.turn_pos = 0;
        g.hands[0] = vec![card(Suit::Clubs, Rank::Queen), card(Suit::Hearts, Rank::Eight)];

        g.play(0, card(Suit::Clubs, Rank::Queen), Some("S")).unwrap();
        assert_eq!(g.active_suit, Some(Suit::Spades));
    }

    #[test]
    fn seven_adds_penalty_and_stacks() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.top_card = Some(card(Suit::Spades, Rank::Nine));
        g.active_suit = Some(Suit::Spades);
        g.turn_pos = 0;
        g.hands[0] = vec![card(Suit::Spades, Rank::Seven), card(Suit::Hearts, Rank::Eight)];
        g.hands[1] = vec![card(Suit::Hearts, Rank::Seven), card(Suit::Clubs, Rank::Eight)];

        let out = g.play(0, card(Suit::Spades, Rank::Seven), None).unwrap();
        assert_eq!(out.added_penalty, 2);
        assert_eq!(g.penalty, 2);

        let out = g.play(1, card(Suit::Hearts, Rank::Seven), None).unwrap();
        assert_eq!(out.added_penalty, 2);
        assert_eq!(g.penalty, 4);
    }

    #[test]
    fn penalty_blocks_non_seven() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.penalty = 2;
        g.turn_pos = 0;
        g.hands[0] = vec![card(Suit::Spades, Rank::King), card(Suit::Spades, Rank::Seven)];
        g.active_suit = Some(Suit::Spades);
        g.top_card = Some(card(Suit::Spades, Rank::Nine));

        assert_eq!(
            g.play(0, card(Suit::Spades, Rank::King), None).err(),
            Some(GameError::MustStackOrDraw)
        );
    }

    #[test]
    fn draw_takes_penalty_cards_and_resets() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.penalty = 2;
        g.turn_pos = 0;
        let before = g.hand(0).len();

        let drawn = g.draw(0).unwrap();
        assert_eq!(drawn.len(), 2);
        assert_eq!(g.hand(0).len(), before + 2);
        assert_eq!(g.penalty, 0);
        assert_eq!(g.turn_pos, 1);
        assert_eq!(cards_in_play(&g), 32);
    }

    #[test]
    fn draw_without_penalty_takes_one() {
        let mut g = Game::new(3, 5);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        let drawn = g.draw(0).unwrap();
        assert_eq!(drawn.len(), 1);
        assert_eq!(g.turn_pos, 1);
    }

    #[test]
    fn draw_rejects_out_of_turn() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        assert_eq!(g.draw(1).err(), Some(GameError::NotYourTurn));
    }

    #[test]
    fn ace_skips_next_player() {
        let mut g = Game::new(3, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.top_card = Some(card(Suit::Spades, Rank::Nine));
        g.active_suit = Some(Suit::Spades);
        g.turn_pos = 0;
        g.hands[0] = vec![card(Suit::Spades, Rank::Ace), card(Suit::Hearts, Rank::Eight)];

        let out = g.play(0, card(Suit::Spades, Rank::Ace), None).unwrap();
        assert!(out.skip_next);
        assert_eq!(g.turn_pos, 2);
    }

    #[test]
    fn ace_in_two_player_game_returns_turn() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.top_card = Some(card(Suit::Spades, Rank::Nine));
        g.active_suit = Some(Suit::Spades);
        g.turn_pos = 0;
        g.hands[0] = vec![card(Suit::Spades, Rank::Ace), card(Suit::Hearts, Rank::Eight)];

        g.play(0, card(Suit::Spades, Rank::Ace), None).unwrap();
        assert_eq!(g.turn_pos, 0);
    }

    #[test]
    fn emptying_hand_wins_without_advancing() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.top_card = Some(card(Suit::Spades, Rank::Nine));
        g.active_suit = Some(Suit::Spades);
        g.turn_pos = 0;
        g.hands[0] = vec![card(Suit::Spades, Rank::King)];

        let out = g.play(0, card(Suit::Spades, Rank::King), None).unwrap();
        assert_eq!(out.winner, Some(0));
        assert!(g.ended);
        assert_eq!(g.turn_pos, 0);
    }

    #[test]
    fn play_after_end_is_rejected() {
        let mut g = Game::new(2, 1);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.ended = true;
        let c = g.hand(0)[0];
        assert_eq!(g.play(0, c, None).err(), Some(GameError::BadState));
        assert_eq!(g.draw(0).err(), Some(GameError::BadState));
    }

    #[test]
    fn exhausted_deck_recycles_discard() {
        let mut g = Game::new(2, 9);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        // Move everything left in the deck onto the discard pile.
        while let Some(c) = g.deck.pop() {
            g.discard.push(c);
        }
        let discard_before = g.discard.len();
        assert!(discard_before > 1);
        let top_before = *g.discard.last().unwrap();

        let drawn = g.draw(0).unwrap();
        assert_eq!(drawn.len(), 1);
        // The visible top card stays on the pile; the rest became the deck.
        assert_eq!(g.discard, vec![top_before]);
        assert_eq!(g.deck.len(), discard_before - 2);
        assert_eq!(cards_in_play(&g), 32);
    }

    #[test]
    fn draw_returns_nothing_when_no_cards_remain() {
        let mut g = Game::new(2, 9);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.deck.clear();
        g.discard = vec![card(Suit::Spades, Rank::Nine)];

        let drawn = g.draw(0).unwrap();
        assert!(drawn.is_empty());
        assert_eq!(g.turn_pos, 1);
    }

    #[test]
    fn remove_player_compacts_hands_and_turn() {
        let mut g = Game::new(3, 3);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.turn_pos = 2;
        let last_hand = g.hands[2].clone();

        g.remove_player(1);
        assert_eq!(g.player_count(), 2);
        assert_eq!(g.hands[1], last_hand);
        assert_eq!(g.turn_pos, 1);
    }

    #[test]
    fn remove_current_player_clamps_turn() {
        let mut g = Game::new(2, 3);
        g.deal(CARDS_EACH);
        g.pick_start_top();
        g.turn_pos = 1;

        g.remove_player(1);
        assert_eq!(g.player_count(), 1);
        assert_eq!(g.turn_pos, 0);
    }
}
