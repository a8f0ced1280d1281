//! Deterministic link identities.
//!
//! A [`LinkIdentity`] is the 32-bit xxHash (seed 0) of the raw href bytes. It
//! is written verbatim into the `data-link-preview` attribute and used as the
//! file stem of the generated preview image, so its decimal rendering must
//! never change for a given href.
//!
//! Two distinct hrefs can collide in 32 bits. Colliding links share one
//! annotation and one preview image; nothing detects or repairs this.

use std::fmt;
use twox_hash::XxHash32;

const SEED: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkIdentity(u32);

impl LinkIdentity {
    pub fn of(url: &str) -> Self {
        LinkIdentity(XxHash32::oneshot(SEED, url.as_bytes()))
    }

    pub const fn from_raw(value: u32) -> Self {
        LinkIdentity(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for LinkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hashes a raw href into its identity.
pub fn identity(url: &str) -> LinkIdentity {
    LinkIdentity::of(url)
}
