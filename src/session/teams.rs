//! Team assignment
//!
//! Both functions are pure apart from the injected RNG, so a seeded
//! `StdRng` makes every assignment reproducible.

use rand::Rng;

/// Pick the team for a new player.
///
/// Returns the least-populated team (lowest index among equals) whenever
/// some team has strictly fewer players than another. When every team has
/// the same count, picks uniformly at random. `counts` must not be empty.
pub fn choose_team<R: Rng + ?Sized>(counts: &[u32], rng: &mut R) -> usize {
    let Some(&min) = counts.iter().min() else {
        return 0;
    };
    let max = counts.iter().copied().max().unwrap_or(min);

    if min == max {
        return rng.gen_range(0..counts.len());
    }

    counts.iter().position(|&c| c == min).unwrap_or(0)
}

/// Round-robin to the next team after `current` with room for one more player.
///
/// Teams with `count >= capacity` are skipped. Returns `current` when every
/// other team is full.
pub fn next_open_team(current: usize, counts: &[u32], capacity: u32) -> usize {
    let teams = counts.len();
    if teams == 0 {
        return current;
    }

    (1..teams)
        .map(|step| (current + step) % teams)
        .find(|&team| counts[team] < capacity)
        .unwrap_or(current)
}

/// Players one team may hold: an even split of the slots plus slack
pub fn team_capacity(total_slots: u32, total_teams: u32, slack: u32) -> u32 {
    if total_teams == 0 {
        return total_slots;
    }
    total_slots / total_teams + slack
}
