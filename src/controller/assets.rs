use std::collections::HashSet;

use kartnet::GameMode;

use crate::config::ServerConfig;
use crate::controller::session::{AddonCounts, PeerSession};

/// Why a connected peer cannot race right now; shown to them as the
/// "hourglass" diagnostic. `None` means they can play.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HourglassReason {
    None,
    AbsentPeer,
    NotATournamentPlayer,
    SpectatorByLimit,
    LackingRequiredMaps,
    AddonKartsPlayThreshold,
    AddonTracksPlayThreshold,
    AddonArenasPlayThreshold,
    AddonFieldsPlayThreshold,
    OfficialKartsPlayThreshold,
    OfficialTracksPlayThreshold,
    NoKartsAfterFilter,
    NoMapsAfterFilter,
}

impl HourglassReason {
    pub fn as_text(self) -> &'static str {
        use HourglassReason::*;
        match self {
            None => "you can play",
            AbsentPeer => "the peer is gone",
            NotATournamentPlayer => "you are not listed as a tournament player",
            SpectatorByLimit => "the player limit is reached",
            LackingRequiredMaps => "you lack maps required for playing",
            AddonKartsPlayThreshold => "you have too few addon karts",
            AddonTracksPlayThreshold => "you have too few addon tracks",
            AddonArenasPlayThreshold => "you have too few addon arenas",
            AddonFieldsPlayThreshold => "you have too few addon soccer fields",
            OfficialKartsPlayThreshold => "you have too few official karts",
            OfficialTracksPlayThreshold => "you have too few official tracks",
            NoKartsAfterFilter => "no kart of yours fits the current filters",
            NoMapsAfterFilter => "no map of yours fits the current filters",
        }
    }
}

/// Why a connection attempt is refused over assets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetRefusal {
    NoCommonKarts,
    NoCommonMaps,
    OfficialKartsBelowThreshold,
    OfficialTracksBelowThreshold,
    AddonKartsBelowThreshold,
    AddonTracksBelowThreshold,
    AddonArenasBelowThreshold,
    AddonSoccersBelowThreshold,
    MissingMustHaveMap(String),
}

impl AssetRefusal {
    pub fn advice(&self) -> String {
        use AssetRefusal::*;
        match self {
            NoCommonKarts => "you have no kart in common with the server".to_string(),
            NoCommonMaps => "you have no map in common with the server".to_string(),
            OfficialKartsBelowThreshold => {
                "install more official karts to join this server".to_string()
            }
            OfficialTracksBelowThreshold => {
                "install more official tracks to join this server".to_string()
            }
            AddonKartsBelowThreshold => "install more addon karts to join".to_string(),
            AddonTracksBelowThreshold => "install more addon tracks to join".to_string(),
            AddonArenasBelowThreshold => "install more addon arenas to join".to_string(),
            AddonSoccersBelowThreshold => "install more addon soccer fields to join".to_string(),
            MissingMustHaveMap(map) => format!("install the map {:?} to join", map),
        }
    }
}

/// Result of intersecting one client's declared assets with ours.
#[derive(Clone, Copy, Debug, Default)]
pub struct AssetAudit {
    /// Fraction of our official karts the client has.
    pub official_karts_fraction: f32,
    /// Fraction of our official maps the client has.
    pub official_tracks_fraction: f32,
    pub addon_counts: AddonCounts,
}

/// The four asset universes the server offers, the thresholds gating
/// connection and play, and the per-mode map filtering.
pub struct AssetManager {
    official_karts: HashSet<String>,
    addon_karts: HashSet<String>,
    official_maps: HashSet<String>,
    addon_maps: HashSet<String>,
    addon_arenas: HashSet<String>,
    addon_soccers: HashSet<String>,
    ctf_maps: HashSet<String>,
    no_reverse_maps: HashSet<String>,
    must_have_maps: Vec<String>,
    play_requirement_maps: Vec<String>,
    config: AssetThresholds,
}

struct AssetThresholds {
    official_karts_threshold: f32,
    official_tracks_threshold: f32,
    official_karts_play_threshold: f32,
    official_tracks_play_threshold: f32,
    addon_karts_join_threshold: usize,
    addon_tracks_join_threshold: usize,
    addon_arenas_join_threshold: usize,
    addon_soccers_join_threshold: usize,
    addon_karts_play_threshold: usize,
    addon_tracks_play_threshold: usize,
    addon_arenas_play_threshold: usize,
    addon_soccers_play_threshold: usize,
}

impl AssetManager {
    pub fn init(config: &ServerConfig) -> Self {
        let to_set = |v: &[String]| v.iter().cloned().collect::<HashSet<_>>();
        AssetManager {
            official_karts: to_set(&config.official_karts),
            addon_karts: to_set(&config.addon_karts),
            official_maps: to_set(&config.official_maps),
            addon_maps: to_set(&config.addon_maps),
            addon_arenas: to_set(&config.addon_arenas),
            addon_soccers: to_set(&config.addon_soccers),
            ctf_maps: to_set(&config.ctf_maps),
            no_reverse_maps: to_set(&config.no_reverse_maps),
            must_have_maps: config.must_have_maps.clone(),
            play_requirement_maps: config.play_requirement_maps.clone(),
            config: AssetThresholds {
                official_karts_threshold: config.official_karts_threshold,
                official_tracks_threshold: config.official_tracks_threshold,
                official_karts_play_threshold: config.official_karts_play_threshold,
                official_tracks_play_threshold: config.official_tracks_play_threshold,
                addon_karts_join_threshold: config.addon_karts_join_threshold,
                addon_tracks_join_threshold: config.addon_tracks_join_threshold,
                addon_arenas_join_threshold: config.addon_arenas_join_threshold,
                addon_soccers_join_threshold: config.addon_soccers_join_threshold,
                addon_karts_play_threshold: config.addon_karts_play_threshold,
                addon_tracks_play_threshold: config.addon_tracks_play_threshold,
                addon_arenas_play_threshold: config.addon_arenas_play_threshold,
                addon_soccers_play_threshold: config.addon_soccers_play_threshold,
            },
        }
    }

    pub fn server_karts(&self) -> Vec<String> {
        let mut karts: Vec<String> = self
            .official_karts
            .iter()
            .chain(self.addon_karts.iter())
            .cloned()
            .collect();
        karts.sort();
        karts
    }

    pub fn server_maps(&self) -> Vec<String> {
        let mut maps: Vec<String> = self
            .official_maps
            .iter()
            .chain(self.addon_maps.iter())
            .cloned()
            .collect();
        maps.sort();
        maps
    }

    pub fn official_maps(&self) -> &HashSet<String> {
        &self.official_maps
    }

    pub fn official_karts(&self) -> &HashSet<String> {
        &self.official_karts
    }

    pub fn supports_reverse(&self, map: &str) -> bool {
        !self.no_reverse_maps.contains(map)
    }

    /// The maps playable in the given mode: race modes exclude arenas
    /// and soccer fields, battle modes require them, CTF additionally
    /// requires the CTF flag.
    pub fn maps_for_mode(&self, mode: GameMode) -> HashSet<String> {
        match mode {
            GameMode::NormalRace | GameMode::TimeTrial => self
                .official_maps
                .iter()
                .chain(self.addon_maps.iter())
                .filter(|m| !self.addon_arenas.contains(*m) && !self.addon_soccers.contains(*m))
                .cloned()
                .collect(),
            GameMode::FreeForAll => self.addon_arenas.iter().cloned().collect(),
            GameMode::CaptureTheFlag => self
                .addon_arenas
                .iter()
                .filter(|m| self.ctf_maps.contains(*m))
                .cloned()
                .collect(),
            GameMode::Soccer => self.addon_soccers.iter().cloned().collect(),
        }
    }

    /// Computes the intersection statistics for one client.
    pub fn audit(&self, client_karts: &HashSet<String>, client_maps: &HashSet<String>) -> AssetAudit {
        let official_karts_hits = client_karts
            .iter()
            .filter(|k| self.official_karts.contains(*k))
            .count();
        let official_maps_hits = client_maps
            .iter()
            .filter(|m| self.official_maps.contains(*m))
            .count();

        let addon_counts = AddonCounts {
            karts: client_karts
                .iter()
                .filter(|k| self.addon_karts.contains(*k))
                .count(),
            tracks: client_maps
                .iter()
                .filter(|m| self.addon_maps.contains(*m))
                .count(),
            arenas: client_maps
                .iter()
                .filter(|m| self.addon_arenas.contains(*m))
                .count(),
            soccers: client_maps
                .iter()
                .filter(|m| self.addon_soccers.contains(*m))
                .count(),
        };

        let fraction = |hits: usize, total: usize| {
            if total == 0 {
                1.0
            } else {
                hits as f32 / total as f32
            }
        };

        AssetAudit {
            official_karts_fraction: fraction(official_karts_hits, self.official_karts.len()),
            official_tracks_fraction: fraction(official_maps_hits, self.official_maps.len()),
            addon_counts,
        }
    }

    /// The join-threshold predicates: all must hold to connect at all.
    pub fn check_can_join(
        &self,
        client_karts: &HashSet<String>,
        client_maps: &HashSet<String>,
        audit: &AssetAudit,
    ) -> Result<(), AssetRefusal> {
        use AssetRefusal::*;

        let karts_shared = client_karts
            .iter()
            .any(|k| self.official_karts.contains(k) || self.addon_karts.contains(k));
        if !karts_shared {
            return Err(NoCommonKarts);
        }
        let maps_shared = client_maps
            .iter()
            .any(|m| self.official_maps.contains(m) || self.addon_maps.contains(m));
        if !maps_shared {
            return Err(NoCommonMaps);
        }

        if audit.official_karts_fraction < self.config.official_karts_threshold {
            return Err(OfficialKartsBelowThreshold);
        }
        if audit.official_tracks_fraction < self.config.official_tracks_threshold {
            return Err(OfficialTracksBelowThreshold);
        }
        if audit.addon_counts.karts < self.config.addon_karts_join_threshold {
            return Err(AddonKartsBelowThreshold);
        }
        if audit.addon_counts.tracks < self.config.addon_tracks_join_threshold {
            return Err(AddonTracksBelowThreshold);
        }
        if audit.addon_counts.arenas < self.config.addon_arenas_join_threshold {
            return Err(AddonArenasBelowThreshold);
        }
        if audit.addon_counts.soccers < self.config.addon_soccers_join_threshold {
            return Err(AddonSoccersBelowThreshold);
        }

        for map in &self.must_have_maps {
            if !client_maps.contains(map) {
                return Err(MissingMustHaveMap(map.clone()));
            }
        }
        Ok(())
    }

    /// The stricter play-threshold predicates: failing any of them
    /// leaves the peer connected but forced to spectate.
    pub fn check_can_play(&self, peer: &PeerSession) -> HourglassReason {
        use HourglassReason::*;

        for required in &self.play_requirement_maps {
            if !peer.client_maps.contains(required) {
                return LackingRequiredMaps;
            }
        }

        if peer.addon_counts.karts < self.config.addon_karts_play_threshold {
            return AddonKartsPlayThreshold;
        }
        if peer.addon_counts.tracks < self.config.addon_tracks_play_threshold {
            return AddonTracksPlayThreshold;
        }
        if peer.addon_counts.arenas < self.config.addon_arenas_play_threshold {
            return AddonArenasPlayThreshold;
        }
        if peer.addon_counts.soccers < self.config.addon_soccers_play_threshold {
            return AddonFieldsPlayThreshold;
        }

        let audit = self.audit(&peer.client_karts, &peer.client_maps);
        if audit.official_karts_fraction < self.config.official_karts_play_threshold {
            return OfficialKartsPlayThreshold;
        }
        if audit.official_tracks_fraction < self.config.official_tracks_play_threshold {
            return OfficialTracksPlayThreshold;
        }

        None
    }
}
