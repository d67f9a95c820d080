//! Strand naming helpers.
//!
//! Strand ordering itself lives in the database (triggers plus per-strand
//! advisory locks); this module only resolves the names clients enqueue
//! under. An n-strand fans a logical name out over a configured number of
//! serial sub-strands, trading strict ordering for bounded parallelism.

use rand::Rng;

use crate::settings::Settings;

/// Advisory lock key string serializing health reaper sweeps cluster-wide.
pub const HEALTH_CHECK_LOCK_KEY: &str = "braid:health_check";

/// Resolve an n-strand name to the concrete strand a job lands on.
///
/// `name` is a strand name, optionally with a `/`-separated discriminator
/// (`"sync_user/1234"`). The sub-strand count is looked up for the full
/// name first, then the bare name. A count above one appends a
/// uniform-random 1-indexed `":<i>"` suffix; otherwise the name passes
/// through unchanged.
pub fn resolve_n_strand(settings: &Settings, name: &str) -> String {
    let num_strands = settings.num_strands_for(name);
    if num_strands > 1 {
        let i = rand::thread_rng().gen_range(1..=num_strands);
        format!("{name}:{i}")
    } else {
        name.to_string()
    }
}
