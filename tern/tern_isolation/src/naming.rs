//! Random names for transient filesystem objects.
//!
//! Uniqueness is statistical: names are drawn at random and collisions are
//! detected by the exclusive create that follows, never prevented by a lock.

use rand::distr::{Alphanumeric, SampleString};

/// A random alphanumeric token of `len` characters.
pub(crate) fn random_token(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::rng(), len)
}
