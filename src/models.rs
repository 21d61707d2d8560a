//! Canonical data model plus the raw upstream wire shapes the parser
//! normalizes away. Only `Killmail`/`Participant`/`ZkbMeta` cross component
//! boundaries past the parser; the `Raw*` types stay inside parsing.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Top-level JSON object from the zKillboard RedisQ stream. `package` is
/// `None` for an empty poll.
#[derive(Debug, Deserialize, Clone)]
pub struct RedisQEnvelope {
    pub package: Option<RawPackage>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RawPackage {
    pub killmail: RawKillmail,
    pub zkb: RawZkb,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RawKillmail {
    pub killmail_id: i64,
    pub solar_system_id: u32,
    pub killmail_time: String,
    pub victim: RawVictim,
    pub attackers: Vec<RawAttacker>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RawZkb {
    pub hash: String,
    #[serde(default, rename = "totalValue")]
    pub total_value: f64,
    #[serde(default)]
    pub points: i64,
    #[serde(default)]
    pub npc: bool,
    #[serde(default)]
    pub solo: bool,
    #[serde(default)]
    pub awox: bool,
    #[serde(default, rename = "droppedValue")]
    pub dropped_value: f64,
    #[serde(default, rename = "destroyedValue")]
    pub destroyed_value: f64,
    #[serde(default, rename = "fittedValue")]
    pub fitted_value: f64,
    #[serde(default, rename = "locationID")]
    pub location_id: Option<i64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RawVictim {
    pub character_id: Option<u64>,
    pub corporation_id: Option<u64>,
    pub alliance_id: Option<u64>,
    pub faction_id: Option<u64>,
    pub ship_type_id: u32,
    pub damage_taken: i64,
    pub position: Option<RawPosition>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RawAttacker {
    pub character_id: Option<u64>,
    pub corporation_id: Option<u64>,
    pub alliance_id: Option<u64>,
    pub faction_id: Option<u64>,
    pub ship_type_id: Option<u32>,
    pub weapon_type_id: Option<u32>,
    pub damage_done: i64,
    #[serde(default)]
    pub final_blow: bool,
    #[serde(default)]
    pub security_status: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RawPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// The killboard history endpoint's reference shape: id + hash, body fetched
/// separately via ESI.
#[derive(Debug, Deserialize, Clone)]
pub struct KillmailReference {
    pub killmail_id: i64,
    pub zkb: RawZkb,
}

// --- Canonical model --------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Participant {
    pub character_id: Option<u64>,
    pub character_name: Option<String>,
    pub corporation_id: Option<u64>,
    pub corporation_name: Option<String>,
    pub alliance_id: Option<u64>,
    pub alliance_name: Option<String>,
    pub faction_id: Option<u64>,
    pub faction_name: Option<String>,
    pub ship_type_id: u32,
    pub ship_name: Option<String>,
    pub ship_group: Option<u32>,
    pub ship_category: Option<String>,
    pub damage: i64,
    pub weapon_type_id: Option<u32>,
    pub weapon_name: Option<String>,
    pub final_blow: bool,
    pub security_status: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZkbMeta {
    pub hash: String,
    pub total_value: f64,
    pub points: i64,
    pub npc: bool,
    pub solo: bool,
    pub awox: bool,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Killmail {
    pub killmail_id: i64,
    pub kill_time: chrono::DateTime<chrono::Utc>,
    pub system_id: u32,
    pub victim: Participant,
    pub attackers: Vec<Participant>,
    pub zkb: ZkbMeta,
    pub position: Option<Position>,
}

impl Killmail {
    /// Victim first, then attackers in upstream order — the fixed iteration
    /// the enricher's id-collection pass relies on.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        std::iter::once(&self.victim).chain(self.attackers.iter())
    }

    pub fn participants_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        std::iter::once(&mut self.victim).chain(self.attackers.iter_mut())
    }

    pub fn character_ids(&self) -> HashSet<u64> {
        self.participants().filter_map(|p| p.character_id).collect()
    }

    /// Universal invariant: non-empty attackers, exactly one final blow.
    pub fn is_well_formed(&self) -> bool {
        !self.attackers.is_empty()
            && self.attackers.iter().filter(|a| a.final_blow).count() == 1
    }
}
