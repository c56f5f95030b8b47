//! Topic roster: who is in the topic and whether they are online.
//!
//! Entries are keyed by scoped connection id and never removed; a
//! departure only flips `online`, so names and colours survive for the
//! chat history.

use convene_core::Participant;
use rand::Rng;
use std::collections::BTreeMap;

/// Minimum relative luminance for generated background colours.
const MIN_LUMINANCE: f32 = 0.5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    entries: BTreeMap<String, Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge participant records. Known entries gain any new device/tab ids
    /// and take the incoming online flag; unknown ones are inserted with a
    /// fresh colour. Returns how many entries were new.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = Participant>) -> usize {
        let mut rng = rand::thread_rng();
        let mut added = 0;

        for participant in incoming {
            match self.entries.get_mut(&participant.scid) {
                Some(entry) => {
                    for cid in participant.cids {
                        if !entry.has_cid(&cid) {
                            entry.cids.push(cid);
                        }
                    }
                    entry.online = participant.online;
                }
                None => {
                    let mut participant = participant;
                    participant.color = light_background_color(&mut rng);
                    self.entries.insert(participant.scid.clone(), participant);
                    added += 1;
                }
            }
        }
        added
    }

    /// Returns false if `scid` is unknown.
    pub fn mark_offline(&mut self, scid: &str) -> bool {
        match self.entries.get_mut(scid) {
            Some(entry) => {
                entry.online = false;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, scid: &str) -> Option<&Participant> {
        self.entries.get(scid)
    }

    /// The participant a device/tab connection id belongs to.
    pub fn by_connection(&self, cid: &str) -> Option<&Participant> {
        self.entries.values().find(|p| p.has_cid(cid))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.entries.values()
    }

    pub fn online(&self) -> impl Iterator<Item = &Participant> {
        self.entries.values().filter(|p| p.online)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Random `#rrggbb` colour light enough for dark text on top.
pub fn light_background_color<R: Rng + ?Sized>(rng: &mut R) -> String {
    loop {
        let rgb: u32 = rng.gen_range(0..0x0100_0000);
        let (r, g, b) = ((rgb >> 16) & 0xFF, (rgb >> 8) & 0xFF, rgb & 0xFF);
        if relative_luminance(r as u8, g as u8, b as u8) >= MIN_LUMINANCE {
            return format!("#{rgb:06x}");
        }
    }
}

/// WCAG relative luminance of an sRGB colour.
fn relative_luminance(r: u8, g: u8, b: u8) -> f32 {
    let linear = |c: u8| {
        let c = c as f32 / 255.0;
        if c <= 0.039_28 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    };
    0.2126 * linear(r) + 0.7152 * linear(g) + 0.0722 * linear(b)
}
