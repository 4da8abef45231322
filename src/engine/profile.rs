//! Card classification and profile selection

use std::collections::HashSet;

use crate::config::ProfileConfig;
use crate::pulse::{Card, ProfileInfo, PROP_DEVICE_BUS, PROP_DEVICE_FORM_FACTOR};

/// Broad kind of a card, derived from its properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    BuiltIn,
    Bluetooth,
    Unknown,
}

impl CardKind {
    pub fn of(card: &Card) -> Self {
        if card.property(PROP_DEVICE_FORM_FACTOR) == Some("internal") {
            CardKind::BuiltIn
        } else if card.property(PROP_DEVICE_BUS) == Some("bluetooth") {
            CardKind::Bluetooth
        } else {
            CardKind::Unknown
        }
    }
}

/// Computes the profiles a card must not stay on
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    extra_builtin: Vec<String>,
    extra_bluetooth: Vec<String>,
}

impl Blacklist {
    pub fn new(config: &ProfileConfig) -> Self {
        Self {
            extra_builtin: config.builtin_blacklist.clone(),
            extra_bluetooth: config.bluetooth_blacklist.clone(),
        }
    }

    pub fn for_kind(&self, kind: CardKind) -> HashSet<String> {
        let mut names: HashSet<String> = HashSet::from(["off".to_string()]);
        match kind {
            CardKind::Bluetooth => {
                // bluez does not fully support the HSP/HFP head unit role
                names.insert("headset_head_unit".to_string());
                names.extend(self.extra_bluetooth.iter().cloned());
            }
            CardKind::BuiltIn | CardKind::Unknown => {
                names.extend(self.extra_builtin.iter().cloned());
            }
        }
        names
    }

    pub fn for_card(&self, card: &Card) -> HashSet<String> {
        self.for_kind(CardKind::of(card))
    }
}

/// Highest-priority profile not in `blacklist`; ties keep enumeration order
pub fn best_profile<'a>(
    profiles: &'a [ProfileInfo],
    blacklist: &HashSet<String>,
) -> Option<&'a ProfileInfo> {
    let mut candidates: Vec<&ProfileInfo> = profiles
        .iter()
        .filter(|p| !blacklist.contains(&p.name))
        .collect();
    // stable: equal priorities stay in backend order
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
    candidates.into_iter().next()
}

/// Profile to switch to when the card sits on a blacklisted one.
/// `None` means leave the card alone.
pub fn reselect_profile(card: &Card, blacklist: &Blacklist) -> Option<String> {
    let blacklist = blacklist.for_card(card);
    let active = card.active_profile_name();
    if !blacklist.contains(active) {
        return None;
    }

    let best = best_profile(&card.profiles, &blacklist)?;
    if best.name == active {
        return None;
    }
    Some(best.name.clone())
}

/// Profile to switch to when there is no saved state: the card's overall
/// best, blacklist ignored. `None` when already on it.
pub fn initial_profile(card: &Card) -> Option<String> {
    let best = best_profile(&card.profiles, &HashSet::new())?;
    if best.name == card.active_profile_name() {
        return None;
    }
    Some(best.name.clone())
}
