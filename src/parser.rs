//! C7 — shape detection and normalization from the four upstream forms
//! (stream-full, stream-empty, reference, full) into the canonical
//! `Killmail`. Plain, total functions; no I/O, no caching — everything here
//! is pure transformation, pushing I/O out to its callers.

use crate::error::ParseError;
use crate::models::{Killmail, Participant, Position, RawAttacker, RawKillmail, RawVictim, RawZkb, ZkbMeta};

/// What a single RedisQ poll resolved to.
pub enum ParsedShape {
    /// A complete killmail body plus zkb metadata arrived in one message.
    StreamFull(Killmail),
    /// The queue had nothing to deliver this poll.
    StreamEmpty,
    /// Only id + hash arrived; the body must be fetched separately via ESI.
    Reference { killmail_id: i64, hash: String },
}

/// Detects which of the four upstream shapes `envelope` carries and
/// normalizes it into the canonical model where the body is already
/// present. A `package` with a killmail but an empty attackers list is
/// `InvalidFormat`, never coerced into a zero-attacker `Killmail`, since
/// every canonical killmail must have at least one attacker.
pub fn parse_redisq(envelope: &crate::models::RedisQEnvelope) -> Result<ParsedShape, ParseError> {
    let Some(package) = &envelope.package else {
        return Ok(ParsedShape::StreamEmpty);
    };

    if package.killmail.attackers.is_empty() {
        return Err(ParseError::MissingField("attackers".to_string()));
    }

    let killmail = normalize(&package.killmail, &package.zkb)?;
    Ok(ParsedShape::StreamFull(killmail))
}

/// Normalizes a reference (id + hash only, no killmail body) pulled from a
/// history-style feed. The body must still be resolved through ESI before
/// a `Killmail` can be built.
pub fn parse_reference(reference: &crate::models::KillmailReference) -> ParsedShape {
    ParsedShape::Reference {
        killmail_id: reference.killmail_id,
        hash: reference.zkb.hash.clone(),
    }
}

/// Joins a raw killmail body with its zkb metadata into the canonical
/// shape. ESI entity names/ship metadata are left `None`; the enricher
/// (C8) fills them in.
pub fn normalize(raw: &RawKillmail, zkb: &RawZkb) -> Result<Killmail, ParseError> {
    let kill_time = chrono::DateTime::parse_from_rfc3339(&raw.killmail_time)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|_| ParseError::InvalidFormat(format!("bad killmail_time: {}", raw.killmail_time)))?;

    let victim = participant_from_victim(&raw.victim);
    let attackers: Vec<Participant> = raw.attackers.iter().map(participant_from_attacker).collect();

    if attackers.iter().filter(|a| a.final_blow).count() != 1 {
        return Err(ParseError::InvalidFormat(
            "killmail must have exactly one final blow".to_string(),
        ));
    }

    let position = raw.victim.position.as_ref().map(|p| Position { x: p.x, y: p.y, z: p.z });

    Ok(Killmail {
        killmail_id: raw.killmail_id,
        kill_time,
        system_id: raw.solar_system_id,
        victim,
        attackers,
        zkb: ZkbMeta {
            hash: zkb.hash.clone(),
            total_value: zkb.total_value,
            points: zkb.points,
            npc: zkb.npc,
            solo: zkb.solo,
            awox: zkb.awox,
            labels: Vec::new(),
        },
        position,
    })
}

fn participant_from_victim(v: &RawVictim) -> Participant {
    Participant {
        character_id: v.character_id,
        corporation_id: v.corporation_id,
        alliance_id: v.alliance_id,
        faction_id: v.faction_id,
        ship_type_id: v.ship_type_id,
        damage: v.damage_taken,
        final_blow: false,
        security_status: None,
        ..Default::default()
    }
}

fn participant_from_attacker(a: &RawAttacker) -> Participant {
    Participant {
        character_id: a.character_id,
        corporation_id: a.corporation_id,
        alliance_id: a.alliance_id,
        faction_id: a.faction_id,
        ship_type_id: a.ship_type_id.unwrap_or(0),
        weapon_type_id: a.weapon_type_id,
        damage: a.damage_done,
        final_blow: a.final_blow,
        security_status: Some(a.security_status),
        ..Default::default()
    }
}

/// A killmail older than `cutoff_seconds` relative to `now` is considered
/// stale for realtime delivery purposes; it is still stored, just
/// not pushed to systems whose subscribers only want live action.
pub fn is_stale(kill_time: chrono::DateTime<chrono::Utc>, cutoff_seconds: i64, now: chrono::DateTime<chrono::Utc>) -> bool {
    (now - kill_time).num_seconds() > cutoff_seconds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RawAttacker, RawKillmail, RawPackage, RawVictim, RawZkb, RedisQEnvelope};

    fn sample_raw() -> RawKillmail {
        RawKillmail {
            killmail_id: 100,
            solar_system_id: 30000142,
            killmail_time: "2026-07-31T12:00:00Z".to_string(),
            victim: RawVictim {
                character_id: Some(1),
                corporation_id: Some(10),
                alliance_id: None,
                faction_id: None,
                ship_type_id: 587,
                damage_taken: 500,
                position: None,
            },
            attackers: vec![RawAttacker {
                character_id: Some(2),
                corporation_id: Some(20),
                alliance_id: None,
                faction_id: None,
                ship_type_id: Some(621),
                weapon_type_id: Some(2488),
                damage_done: 500,
                final_blow: true,
                security_status: 0.5,
            }],
        }
    }

    #[test]
    fn empty_package_is_stream_empty() {
        let envelope = RedisQEnvelope { package: None };
        assert!(matches!(parse_redisq(&envelope).unwrap(), ParsedShape::StreamEmpty));
    }

    #[test]
    fn full_package_normalizes_to_killmail() {
        let envelope = RedisQEnvelope {
            package: Some(RawPackage {
                killmail: sample_raw(),
                zkb: RawZkb {
                    hash: "abc".to_string(),
                    total_value: 1_000_000.0,
                    ..Default::default()
                },
            }),
        };
        match parse_redisq(&envelope).unwrap() {
            ParsedShape::StreamFull(km) => {
                assert_eq!(km.killmail_id, 100);
                assert!(km.is_well_formed());
                assert_eq!(km.attackers.len(), 1);
            }
            _ => panic!("expected StreamFull"),
        }
    }

    #[test]
    fn missing_attackers_is_invalid_format() {
        let mut raw = sample_raw();
        raw.attackers.clear();
        let envelope = RedisQEnvelope {
            package: Some(RawPackage {
                killmail: raw,
                zkb: RawZkb::default(),
            }),
        };
        assert!(parse_redisq(&envelope).is_err());
    }

    #[test]
    fn zero_or_multiple_final_blows_is_invalid_format() {
        let mut raw = sample_raw();
        raw.attackers.push(raw.attackers[0].clone());
        let envelope = RedisQEnvelope {
            package: Some(RawPackage {
                killmail: raw,
                zkb: RawZkb::default(),
            }),
        };
        assert!(parse_redisq(&envelope).is_err());
    }

    #[test]
    fn stale_check_respects_cutoff() {
        let kill_time = chrono::DateTime::parse_from_rfc3339("2026-07-31T12:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let now = kill_time + chrono::Duration::seconds(3601);
        assert!(is_stale(kill_time, 3600, now));
        assert!(!is_stale(kill_time, 3600, kill_time + chrono::Duration::seconds(10)));
    }
}
