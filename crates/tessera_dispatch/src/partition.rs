//! Splitting outstanding keys between workers.

use std::num::NonZeroUsize;

use rand::seq::SliceRandom;
use rand::Rng;

/// Shuffles `keys` and splits them into `parts` sublists.
///
/// Sublist lengths differ by at most one; earlier sublists get the extra
/// elements. Every key lands in exactly one sublist. The shuffle spreads
/// expensive items evenly when the input is ordered by size.
pub fn partition<K>(keys: impl IntoIterator<Item = K>, parts: NonZeroUsize) -> Vec<Vec<K>> {
    partition_with(&mut rand::thread_rng(), keys, parts)
}

/// [`partition`] with an explicit random source.
pub fn partition_with<K, R>(
    rng: &mut R,
    keys: impl IntoIterator<Item = K>,
    parts: NonZeroUsize,
) -> Vec<Vec<K>>
where
    R: Rng + ?Sized,
{
    let mut rest: Vec<K> = keys.into_iter().collect();
    rest.shuffle(rng);

    let parts = parts.get();
    let base = rest.len() / parts;
    let extra = rest.len() % parts;

    let mut out = Vec::with_capacity(parts);
    for i in 0..parts {
        let size = base + usize::from(i < extra);
        let tail = rest.split_off(size);
        out.push(std::mem::replace(&mut rest, tail));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeSet;

    fn parts(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn extra_elements_go_to_earlier_sublists() {
        let mut rng = StdRng::seed_from_u64(7);
        let lists = partition_with(&mut rng, 0..10, parts(4));
        let sizes: Vec<_> = lists.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2]);
    }

    #[test]
    fn more_parts_than_keys_leaves_empty_tails() {
        let lists = partition(["a", "b"], parts(4));
        let sizes: Vec<_> = lists.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1, 0, 0]);
    }

    #[test]
    fn single_part_keeps_everything() {
        let lists = partition(0..5, parts(1));
        assert_eq!(lists.len(), 1);
        let set: BTreeSet<_> = lists[0].iter().copied().collect();
        assert_eq!(set, (0..5).collect());
    }

    #[test]
    fn empty_input_gives_empty_sublists() {
        let lists = partition(Vec::<u8>::new(), parts(3));
        assert_eq!(lists, vec![Vec::<u8>::new(); 3]);
    }
}
