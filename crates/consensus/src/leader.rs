//! Leader selection.
//!
//! Each height has a leader schedule: the sorted committee shuffled by a
//! ChaCha20 stream seeded from the parent block's VRF output. Round `r`
//! is led by `schedule[r mod n]`. The seed is unknown until the parent
//! block is decided, and anyone holding the parent can recompute the
//! schedule.

use rand::RngCore;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use vbft_cryptography::VrfOutput;

/// Permutation of `committee` for the height seeded by `seed`.
pub fn leader_schedule(committee: &[u32], seed: &VrfOutput) -> Vec<u32> {
    let mut schedule = committee.to_vec();
    schedule.sort_unstable();
    schedule.dedup();

    let mut rng = ChaCha20Rng::from_seed(seed.seed());
    for i in (1..schedule.len()).rev() {
        let j = (rng.next_u64() % (i as u64 + 1)) as usize;
        schedule.swap(i, j);
    }
    schedule
}

/// Leader of `round`, or `None` for an empty committee.
pub fn select_leader(committee: &[u32], seed: &VrfOutput, round: u32) -> Option<u32> {
    let schedule = leader_schedule(committee, seed);
    if schedule.is_empty() {
        return None;
    }
    Some(schedule[round as usize % schedule.len()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn seed(byte: u8) -> VrfOutput {
        VrfOutput([byte; 64])
    }

    #[test]
    fn test_schedule_is_permutation() {
        let committee = [3, 0, 2, 1];
        let mut schedule = leader_schedule(&committee, &seed(1));
        schedule.sort_unstable();
        assert_eq!(schedule, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        assert_eq!(
            leader_schedule(&[0, 1, 2, 3], &seed(5)),
            leader_schedule(&[3, 1, 0, 2], &seed(5))
        );
    }

    #[test]
    fn test_consecutive_rounds_rotate() {
        let committee = [0, 1, 2, 3];
        for round in 0..8 {
            assert_ne!(
                select_leader(&committee, &seed(9), round),
                select_leader(&committee, &seed(9), round + 1)
            );
        }
    }

    #[test]
    fn test_seed_changes_schedule() {
        let committee: Vec<u32> = (0..16).collect();
        let schedules: std::collections::HashSet<_> = (0..8u8)
            .map(|b| leader_schedule(&committee, &seed(b)))
            .collect();
        assert!(schedules.len() > 1);
    }

    #[test]
    fn test_empty_committee() {
        assert_eq!(select_leader(&[], &seed(0), 0), None);
        assert_eq!(select_leader(&[7], &seed(0), 42), Some(7));
    }

    proptest! {
        #[test]
        fn prop_selection_is_pure(bytes in any::<[u8; 32]>(), round in 0u32..1000, n in 1u32..22) {
            let mut out = [0u8; 64];
            out[..32].copy_from_slice(&bytes);
            let committee: Vec<u32> = (0..n).collect();
            let a = select_leader(&committee, &VrfOutput(out), round);
            let b = select_leader(&committee, &VrfOutput(out), round);
            prop_assert_eq!(a, b);
            prop_assert!(a.map_or(false, |l| l < n));
        }
    }
}
