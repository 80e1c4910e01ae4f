use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::warn;

/// Style name used for speakers that are not part of the cast.
pub const DEFAULT_STYLE: &str = "Default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    /// Voice identifier understood by the configured TTS backend.
    pub voice: String,
    /// ASS style name; must be unique within the cast.
    pub style: String,
    /// Primary colour in ASS `&HAABBGGRR` notation.
    pub color: String,
    pub outline: String,
    /// Distance of this speaker's subtitles from the bottom edge, as a
    /// fraction of the video height.
    pub margin_v: f64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cast {
    characters: Vec<Character>,
    #[serde(skip)]
    warned: Mutex<HashSet<String>>,
}

impl Clone for Cast {
    fn clone(&self) -> Self {
        Self::new(self.characters.clone())
    }
}

impl PartialEq for Cast {
    fn eq(&self, other: &Self) -> bool {
        self.characters == other.characters
    }
}

impl Default for Cast {
    fn default() -> Self {
        Self::new(vec![
            Character {
                name: "カツミ".to_string(),
                voice: "Kore".to_string(),
                style: "Katsumi".to_string(),
                color: "&H00B5E4FF".to_string(),
                outline: "&H00000000".to_string(),
                margin_v: 0.35,
            },
            Character {
                name: "ヒロシ".to_string(),
                voice: "Puck".to_string(),
                style: "Hiroshi".to_string(),
                color: "&H00ED9564".to_string(),
                outline: "&H00000000".to_string(),
                margin_v: 0.20,
            },
        ])
    }
}

impl Cast {
    pub fn new(characters: Vec<Character>) -> Self {
        Self {
            characters,
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn characters(&self) -> &[Character] {
        &self.characters
    }

    pub fn get(&self, speaker: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.name == speaker)
    }

    /// The first character; speaks generated announcements.
    pub fn announcer(&self) -> Option<&Character> {
        self.characters.first()
    }

    /// Voice for a speaker, falling back to the announcer's voice.
    pub fn voice_for(&self, speaker: &str) -> Option<&str> {
        match self.get(speaker) {
            Some(c) => Some(&c.voice),
            None => {
                self.warn_unknown(speaker);
                self.announcer().map(|c| c.voice.as_str())
            }
        }
    }

    /// ASS style for a speaker, `Default` when the speaker is unknown.
    pub fn style_for(&self, speaker: &str) -> &str {
        match self.get(speaker) {
            Some(c) => &c.style,
            None => {
                self.warn_unknown(speaker);
                DEFAULT_STYLE
            }
        }
    }

    fn warn_unknown(&self, speaker: &str) {
        if let Ok(mut warned) = self.warned.lock() {
            if warned.insert(speaker.to_string()) {
                warn!("Speaker '{}' is not in the cast; using defaults", speaker);
            }
        }
    }
}
