//! Recovery phrases and ownership digests
//!
//! A recovery phrase is issued once, at account creation. Only its digest
//! is stored server-side, next to the digest of the device fingerprint;
//! presenting either raw value later proves ownership of the username.

use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Words per recovery phrase.
pub const PHRASE_WORDS: usize = 6;

// Fixed dictionary; ~8 bits of entropy per word, ~48 bits per phrase.
static WORDS: &[&str] = &[
    "apple", "arrow", "artist", "autumn", "badge", "banana", "basket", "beach",
    "beacon", "berry", "blanket", "bloom", "bottle", "branch", "breeze", "bridge",
    "bright", "bronze", "brook", "brush", "bubble", "butter", "button", "cabin",
    "cactus", "camera", "candle", "candy", "canvas", "canyon", "carbon", "carpet",
    "carrot", "castle", "cedar", "cherry", "circle", "cliff", "cloud", "clover",
    "cobalt", "coffee", "comet", "cookie", "copper", "coral", "corner", "cotton",
    "crayon", "creek", "cricket", "crown", "crystal", "curtain", "dagger", "dahlia",
    "daisy", "dancer", "dawn", "desert", "diamond", "dolphin", "dragon", "dream",
    "drift", "drum", "eagle", "echo", "eclipse", "ember", "emerald", "falcon",
    "feather", "fern", "fiddle", "field", "fig", "finch", "fire", "flame",
    "flash", "flint", "flower", "flute", "forest", "fossil", "fountain", "fox",
    "frost", "galaxy", "garden", "garnet", "geyser", "ginger", "glacier", "glass",
    "globe", "glory", "glove", "gold", "grape", "grass", "grove", "guitar",
    "hammer", "harbor", "harvest", "hawk", "hazel", "heart", "hedge", "helmet",
    "hero", "hill", "honey", "horizon", "horn", "horse", "ice", "igloo",
    "ink", "iris", "iron", "island", "ivory", "jacket", "jade", "jasmine",
    "jewel", "jungle", "kernel", "kettle", "kite", "koala", "lake", "lamp",
    "lantern", "lark", "laurel", "lava", "leaf", "lemon", "lens", "leopard",
    "light", "lily", "linen", "lion", "lizard", "lotus", "lunar", "magnet",
    "mango", "maple", "marble", "marsh", "meadow", "melon", "mesa", "metal",
    "mirror", "mist", "moon", "moss", "moth", "mountain", "mouse", "muffin",
    "nectar", "needle", "nest", "night", "north", "nova", "oak", "oasis",
    "ocean", "olive", "onyx", "orange", "orchid", "otter", "owl", "palm",
    "panda", "panther", "paper", "path", "peach", "pearl", "pebble", "pepper",
    "piano", "pickle", "pilot", "pine", "planet", "plum", "pond", "poplar",
    "prism", "pumpkin", "puzzle", "quartz", "rabbit", "radar", "rain", "rainbow",
    "raven", "reef", "ribbon", "ridge", "river", "robin", "rock", "rocket",
    "rose", "ruby", "sage", "salmon", "sand", "sapphire", "saturn", "scale",
    "scarlet", "scroll", "shadow", "shell", "silver", "sketch", "sky", "slate",
    "snow", "solar", "spark", "spice", "spider", "spiral", "splash", "spring",
    "spruce", "star", "steam", "stone", "storm", "stream", "sugar", "summit",
    "sun", "sunset", "surf", "swan", "swift", "table", "tango", "temple",
];

/// Generate a fresh recovery phrase: six dictionary words joined by `-`.
pub fn generate_recovery_phrase() -> String {
    let mut rng = OsRng;
    let mut words = Vec::with_capacity(PHRASE_WORDS);
    for _ in 0..PHRASE_WORDS {
        words.push(WORDS[rng.gen_range(0..WORDS.len())]);
    }
    words.join("-")
}

/// SHA-256 digest of a raw value, hex-encoded.
///
/// Fingerprints and recovery phrases are high-entropy opaque tokens, so a
/// plain digest suffices; no salt is stored.
pub fn hash_value(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phrase_has_six_dictionary_words() {
        let phrase = generate_recovery_phrase();
        let words: Vec<&str> = phrase.split('-').collect();
        assert_eq!(words.len(), PHRASE_WORDS);
        for word in words {
            assert!(WORDS.contains(&word), "unexpected word {word:?}");
        }
    }

    #[test]
    fn phrases_are_not_constant() {
        // 48 bits of entropy; a collision across ten draws means the
        // generator is broken, not unlucky.
        let phrases: std::collections::HashSet<String> =
            (0..10).map(|_| generate_recovery_phrase()).collect();
        assert!(phrases.len() > 1);
    }

    #[test]
    fn hash_is_stable_sha256_hex() {
        assert_eq!(
            hash_value("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash_value("abc"), hash_value("abc"));
        assert_ne!(hash_value("abc"), hash_value("abd"));
        assert_eq!(hash_value("").len(), 64);
    }
}
