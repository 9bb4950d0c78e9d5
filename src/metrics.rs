use once_cell::sync::Lazy;
use prometheus::{
    exponential_buckets, histogram_opts, register_gauge, register_histogram, register_int_counter,
    Gauge, Histogram, IntCounter,
};

/// Counts leader elections, observed as term increments.
pub static RAFT_ELECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "raft_elections_total",
        "Total number of Raft leader elections observed (term increments)."
    )
    .expect("register raft_elections_total")
});

/// Current Raft term.
pub static RAFT_TERM: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("raft_term", "Current Raft term.").expect("register raft_term"));

/// Current Raft role: 0=Follower, 1=Candidate, 2=Leader, 3=Shutdown.
pub static RAFT_STATE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "raft_state",
        "Current Raft state: 0=Follower, 1=Candidate, 2=Leader, 3=Shutdown."
    )
    .expect("register raft_state")
});

/// Wall-clock latency from Apply submission to commit confirmation.
pub static RAFT_REPLICATION_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(histogram_opts!(
        "raft_replication_latency_ms",
        "Raft replication latency in milliseconds, from submission to commit.",
        exponential_buckets(1.0, 2.0, 12).expect("latency buckets")
    ))
    .expect("register raft_replication_latency_ms")
});

/// Registers every collector with the default registry so the exposition
/// is complete from the first scrape, before any of them is touched.
pub fn init() {
    Lazy::force(&RAFT_ELECTIONS_TOTAL);
    Lazy::force(&RAFT_TERM);
    Lazy::force(&RAFT_STATE);
    Lazy::force(&RAFT_REPLICATION_LATENCY_MS);
}

/// Records one term observation: updates the term gauge and counts an
/// election only when the term rose from a previously seen positive value.
/// Returns the value to carry into the next observation.
pub fn observe_term(last_term: u64, term: u64) -> u64 {
    RAFT_TERM.set(term as f64);
    if last_term > 0 && term > last_term {
        RAFT_ELECTIONS_TOTAL.inc();
    }
    term
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_term_counts_only_positive_increments() {
        let base = RAFT_ELECTIONS_TOTAL.get();

        // First observation: no previous positive term, no election counted.
        let last = observe_term(0, 3);
        assert_eq!(last, 3);
        assert_eq!(RAFT_ELECTIONS_TOTAL.get(), base);

        // Term rose from a positive value: one election.
        let last = observe_term(last, 4);
        assert_eq!(RAFT_ELECTIONS_TOTAL.get(), base + 1);

        // Unchanged term: nothing.
        let last = observe_term(last, 4);
        assert_eq!(RAFT_ELECTIONS_TOTAL.get(), base + 1);

        // A term decrease is ignored.
        let last = observe_term(last, 2);
        assert_eq!(RAFT_ELECTIONS_TOTAL.get(), base + 1);

        // But the lower value becomes the new baseline.
        observe_term(last, 5);
        assert_eq!(RAFT_ELECTIONS_TOTAL.get(), base + 2);
    }
}
