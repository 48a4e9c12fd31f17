use kartnet::{Difficulty, GameMode, KartTeam, WideStr};

/// One kart slot of the upcoming match, assigned to a profile or an AI.
#[derive(Clone, Debug)]
pub struct KartAssignment {
    /// Owning peer, or `None` for a server-side AI kart.
    pub host_id: Option<u32>,
    pub local_player_id: u8,
    pub name: WideStr,
    pub kart_name: String,
    pub kart_team: KartTeam,
    pub handicap: u8,
    pub online_id: u32,
    pub country_code: String,
    pub kart_color: f32,
}

/// Everything fixed at start-selection time. Mode and difficulty never
/// change while the match is live.
#[derive(Clone, Debug)]
pub struct RaceSetup {
    pub mode: GameMode,
    pub difficulty: Difficulty,
    pub track: String,
    pub laps: u8,
    pub reverse: bool,
    /// Wall-clock seconds for FFA/soccer; 0 disables the time limit.
    pub time_limit: f32,
    /// Hits, captures or goals, depending on mode; 0 disables.
    pub value_limit: u32,
    pub item_seed: u32,
    pub track_length: f32,
    pub assignments: Vec<KartAssignment>,
    pub ai_count: u32,
}

impl RaceSetup {
    pub fn num_karts(&self) -> usize {
        self.assignments.len()
    }

    pub fn supports_live_joining(&self) -> bool {
        // Lapped races cannot place a late joiner meaningfully.
        self.mode.is_battle()
    }
}
