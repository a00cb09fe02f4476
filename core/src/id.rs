//! Identifier generation.
//!
//! Container IDs are random; image IDs and CRI identifiers are derived
//! from content or metadata and must stay stable across releases.

use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};

/// Length of the abbreviated ID shown to users.
pub const SHORT_ID_LEN: usize = 12;

/// Length of an image ID in hex characters.
pub const IMAGE_ID_LEN: usize = 16;

/// Generate a new random container ID (32 lowercase hex chars).
pub fn generate_container_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Abbreviate an ID for display.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Image ID from a content digest such as `sha256:<hex>`.
pub fn image_id_from_digest(digest: &str) -> String {
    let hex_part = digest.split_once(':').map(|(_, h)| h).unwrap_or(digest);
    hex_part.chars().take(IMAGE_ID_LEN).collect()
}

/// CRI pod sandbox ID: `pod-` + first 8 bytes of
/// sha256("{name}-{namespace}-{uid}-{attempt}") in hex.
pub fn pod_sandbox_id(name: &str, namespace: &str, uid: &str, attempt: u32) -> String {
    let hash = Sha256::digest(format!("{}-{}-{}-{}", name, namespace, uid, attempt).as_bytes());
    format!("pod-{}", hex::encode(&hash[..8]))
}

/// CRI container ID: `ctr-` + first 8 bytes of
/// sha256("{name}-{pod_sandbox_id}-{attempt}-{unix_nanos}") in hex.
pub fn cri_container_id(name: &str, pod_sandbox_id: &str, attempt: u32, unix_nanos: i64) -> String {
    let hash = Sha256::digest(
        format!("{}-{}-{}-{}", name, pod_sandbox_id, attempt, unix_nanos).as_bytes(),
    );
    format!("ctr-{}", hex::encode(&hash[..8]))
}

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "eager", "fancy", "gentle", "happy", "jolly", "keen", "lively", "merry",
    "nimble", "proud", "quiet", "rapid", "sharp", "swift", "tidy", "vivid", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "otter", "falcon", "panda", "heron", "lynx", "maple", "cedar", "comet", "delta", "ember",
    "fjord", "glacier", "harbor", "island", "lagoon", "meadow", "nebula", "orchid", "pine", "quartz",
];

/// Random `<adjective>_<noun>` container name.
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{}_{}", adjective, noun)
}
