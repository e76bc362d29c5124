use pg_stream_config::shared::{
    MAX_SLOT_NAME_LENGTH, SLOT_NAME_PREFIX, ValidationError, validate_slot_name,
};
use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;

/// Length of the random suffix appended to generated slot names.
const RANDOM_SUFFIX_LENGTH: usize = 5;

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "daring", "eager", "fancy", "gentle", "hidden", "icy", "jolly",
    "keen", "lucky", "mellow", "noble", "quiet", "rapid", "silent", "tidy", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "otter", "falcon", "badger", "heron", "lynx", "marmot", "newt", "osprey", "panda", "quokka",
    "raven", "salmon", "tapir", "urchin", "viper", "walrus", "yak", "zebra", "bison", "gecko",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplicationSlotError {
    #[error("replication slot name `{0}` exceeds {MAX_SLOT_NAME_LENGTH} bytes")]
    InvalidSlotNameLength(String),

    #[error(
        "replication slot name `{0}` may only contain lowercase letters, digits and underscores"
    )]
    InvalidSlotName(String),
}

/// Returns the server-side slot name for `name`, which is `rs_{name}`.
///
/// Legality is decided by [`validate_slot_name`], the same check configuration validation runs.
pub fn server_slot_name(name: &str) -> Result<String, ReplicationSlotError> {
    let slot_name = format!("{SLOT_NAME_PREFIX}{name}");

    match validate_slot_name(name) {
        Ok(()) => Ok(slot_name),
        Err(ValidationError::SlotNameTooLong { .. }) => {
            Err(ReplicationSlotError::InvalidSlotNameLength(slot_name))
        }
        Err(_) => Err(ReplicationSlotError::InvalidSlotName(name.to_owned())),
    }
}

/// Supplies a slot name when none is configured.
///
/// Called once while the slot is resolved; the result is kept for the lifetime of the connector.
pub trait SlotNameGenerator {
    fn generate(&self) -> String;
}

/// Generates names such as `quiet_heron_x3k9a`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSlotNameGenerator;

impl RandomSlotNameGenerator {
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> String {
        let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("quiet");
        let noun = NOUNS.choose(rng).copied().unwrap_or("otter");
        let suffix: String = (0..RANDOM_SUFFIX_LENGTH)
            .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
            .collect();

        format!("{adjective}_{noun}_{suffix}")
    }
}

impl SlotNameGenerator for RandomSlotNameGenerator {
    fn generate(&self) -> String {
        Self::generate_with(&mut rand::thread_rng())
    }
}

/// Always returns the same name.
#[derive(Debug, Clone)]
pub struct FixedSlotNameGenerator(pub String);

impl SlotNameGenerator for FixedSlotNameGenerator {
    fn generate(&self) -> String {
        self.0.clone()
    }
}
