//! Deterministic parameter partitioning across data-parallel ranks.

/// Zero-padding needed to make `numel` divisible by `world_size`.
pub fn padding_for(numel: usize, world_size: usize) -> usize {
    (world_size - numel % world_size) % world_size
}

/// Greedy longest-processing-time assignment of parameters to ranks.
///
/// Parameters are visited in descending element count (ties broken by
/// registration order) and each goes to the rank with the smallest cumulative
/// element count (ties broken by lowest rank). The result depends only on the
/// input ordering, so every rank computes the identical assignment.
///
/// Returns one owning rank per parameter, indexed like `numels`.
pub fn partition_balanced(numels: &[usize], world_size: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..numels.len()).collect();
    order.sort_by(|&a, &b| numels[b].cmp(&numels[a]).then(a.cmp(&b)));

    let mut numel_per_rank = vec![0usize; world_size];
    let mut assignment = vec![0usize; numels.len()];

    for idx in order {
        let rank_to_go = numel_per_rank
            .iter()
            .enumerate()
            .min_by_key(|&(rank, &numel)| (numel, rank))
            .map(|(rank, _)| rank)
            .expect("world_size must be > 0");
        assignment[idx] = rank_to_go;
        numel_per_rank[rank_to_go] += numels[idx];
    }

    assignment
}
