use anyhow::bail;
use log::{info, warn};
use nalgebra::DMatrix;

use crate::tree::cluster_matrix::ClusterMatrix;
use crate::tree::tree_builder::TreeBuilder;
use crate::tree::{NodeArena, NodeIdx, Tree};
use crate::Result;

/// Divergence-corrected clustering over at least four taxa.
///
/// Clusters merge pairwise while more than three remain; the final three are
/// joined under a single ternary root, which is how an unrooted NJ tree is
/// rooted. Limb lengths keep their sign on non-additive input, so on an
/// additive matrix the tree reproduces every input distance exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeighborJoiningBuilder;

const MIN_NJ_TAXA: usize = 4;

impl TreeBuilder for NeighborJoiningBuilder {
    fn build_tree(&self, distances: &DMatrix<f64>) -> Result<Tree> {
        NeighborJoiningBuilder::build_nj_tree(distances)
    }
}

impl NeighborJoiningBuilder {
    fn build_nj_tree(distances: &DMatrix<f64>) -> Result<Tree> {
        let mut matrix = ClusterMatrix::validated(distances, MIN_NJ_TAXA)?;
        let n = matrix.taxa();
        info!("Building neighbour-joining tree for {} taxa.", n);

        let mut arena = NodeArena::new();
        let mut clusters: Vec<NodeIdx> = (0..n).map(|i| arena.leaf(i)).collect();

        loop {
            matrix.recompute_divergence();
            let m = matrix.active_count();
            let (i, j) = match matrix.min_q_pair() {
                Some(pair) => pair,
                None => bail!("No active pair remains before the final join"),
            };

            let d_ij = matrix.distance(i, j);
            let denom = (m - 2) as f64;
            let limb_i = 0.5 * (d_ij + (matrix.divergence(i) - matrix.divergence(j)) / denom);
            let limb_j = 0.5 * (d_ij + (matrix.divergence(j) - matrix.divergence(i)) / denom);

            if m > 3 {
                warn_negative_limbs(&[limb_i, limb_j]);
                let merged = arena.internal(vec![clusters[i], clusters[j]], vec![limb_i, limb_j])?;
                clusters[i] = merged;
                matrix.retire(j);
                matrix.merge_reduced(i, j);
            } else {
                matrix.retire(i);
                matrix.retire(j);
                let k = match matrix.active().next() {
                    Some(k) => k,
                    None => bail!("The final join requires a third active cluster"),
                };
                let limb_k = 0.5 * (matrix.distance(i, k) + matrix.distance(j, k) - d_ij);
                warn_negative_limbs(&[limb_i, limb_j, limb_k]);
                let root = arena.internal(
                    vec![clusters[i], clusters[j], clusters[k]],
                    vec![limb_i, limb_j, limb_k],
                )?;
                return Tree::new(arena, root);
            }
        }
    }
}

fn warn_negative_limbs(limbs: &[f64]) {
    if limbs.iter().any(|&limb| limb < 0.0) {
        warn!("Non-additive input produced a negative branch length, keeping the signed value.");
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use assert_matches::assert_matches;
    use nalgebra::dmatrix;

    use super::NeighborJoiningBuilder;
    use crate::tree::{NodeArena, Tree, TreeBuilder, ValidationError};
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn six_taxon_distances() -> nalgebra::DMatrix<f64> {
        dmatrix![
            0.0, 5.0, 4.0, 7.0, 6.0, 8.0;
            5.0, 0.0, 7.0, 10.0, 9.0, 11.0;
            4.0, 7.0, 0.0, 7.0, 6.0, 8.0;
            7.0, 10.0, 7.0, 0.0, 5.0, 9.0;
            6.0, 9.0, 6.0, 5.0, 0.0, 8.0;
            8.0, 11.0, 8.0, 9.0, 8.0, 0.0]
    }

    // (((0:1,1:4):1,2:2):1,(3:3,4:2):1,5:5) with a ternary root.
    fn six_taxon_reference() -> Tree {
        let mut arena = NodeArena::new();
        let leaves: Vec<_> = (0..6).map(|i| arena.leaf(i)).collect();
        let ab = arena
            .internal(vec![leaves[0], leaves[1]], vec![1.0, 4.0])
            .unwrap();
        let abc = arena.internal(vec![ab, leaves[2]], vec![1.0, 2.0]).unwrap();
        let de = arena
            .internal(vec![leaves[3], leaves[4]], vec![3.0, 2.0])
            .unwrap();
        let root = arena
            .internal(vec![abc, de, leaves[5]], vec![1.0, 1.0, 5.0])
            .unwrap();
        Tree::new(arena, root).unwrap()
    }

    #[test]
    fn nj_six_taxon_reference_topology() {
        let tree = NeighborJoiningBuilder.build_tree(&six_taxon_distances()).unwrap();
        assert_eq!(tree, six_taxon_reference());
    }

    #[test]
    fn nj_six_taxon_reference_hash_agrees() {
        let tree = NeighborJoiningBuilder.build_tree(&six_taxon_distances()).unwrap();
        let reference = six_taxon_reference();
        let mut tree_hasher = DefaultHasher::new();
        let mut reference_hasher = DefaultHasher::new();
        tree.hash(&mut tree_hasher);
        reference.hash(&mut reference_hasher);
        assert_eq!(tree_hasher.finish(), reference_hasher.finish());
    }

    #[test]
    fn nj_root_is_ternary() {
        let tree = NeighborJoiningBuilder.build_tree(&six_taxon_distances()).unwrap();
        assert_eq!(tree.node(&tree.root()).children().len(), 3);
        for idx in tree.preorder() {
            let node = tree.node(&idx);
            if !node.is_leaf() && idx != tree.root() {
                assert_eq!(node.children().len(), 2);
            }
        }
    }

    #[test]
    fn nj_reproduces_additive_distances() {
        // The six-taxon matrix is additive, so every patristic distance must
        // match the input entry.
        let distances = six_taxon_distances();
        let tree = NeighborJoiningBuilder.build_tree(&distances).unwrap();
        for i in 0..6 {
            for j in 0..6 {
                assert_relative_eq!(
                    tree.distance(i, j).unwrap(),
                    distances[(i, j)],
                    epsilon = 1e-9
                );
            }
        }
    }

    #[test]
    fn nj_wiki_example_limbs() {
        // https://en.wikipedia.org/wiki/Neighbor_joining, five taxa.
        let distances = dmatrix![
            0.0, 5.0, 9.0, 9.0, 8.0;
            5.0, 0.0, 10.0, 10.0, 9.0;
            9.0, 10.0, 0.0, 8.0, 7.0;
            9.0, 10.0, 8.0, 0.0, 3.0;
            8.0, 9.0, 7.0, 3.0, 0.0];
        let tree = NeighborJoiningBuilder.build_tree(&distances).unwrap();

        let mut arena = NodeArena::new();
        let a = arena.leaf(0);
        let b = arena.leaf(1);
        let c = arena.leaf(2);
        let d = arena.leaf(3);
        let e = arena.leaf(4);
        let u = arena.internal(vec![b, a], vec![3.0, 2.0]).unwrap();
        let v = arena.internal(vec![c, u], vec![4.0, 3.0]).unwrap();
        let root = arena.internal(vec![d, v, e], vec![2.0, 2.0, 1.0]).unwrap();
        let expected = Tree::new(arena, root).unwrap();
        assert_eq!(tree, expected);
    }

    #[test]
    fn nj_symmetric_distances() {
        let tree = NeighborJoiningBuilder.build_tree(&six_taxon_distances()).unwrap();
        for i in 0..6 {
            for j in 0..6 {
                assert_eq!(tree.distance(i, j).unwrap(), tree.distance(j, i).unwrap());
                assert_eq!(
                    tree.topological_distance(i, j).unwrap(),
                    tree.topological_distance(j, i).unwrap()
                );
            }
        }
    }

    #[test]
    fn nj_requires_four_taxa() {
        let distances = dmatrix![
            0.0, 1.0, 2.0;
            1.0, 0.0, 3.0;
            2.0, 3.0, 0.0];
        let err = NeighborJoiningBuilder.build_tree(&distances).unwrap_err();
        assert_matches!(
            err.downcast_ref::<ValidationError>(),
            Some(ValidationError::TooFewTaxa {
                required: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn nj_four_taxa_root_directly() {
        // With four taxa a single binary merge happens before the ternary
        // root closes over the remaining three clusters.
        let distances = dmatrix![
            0.0, 4.0, 5.0, 10.0;
            4.0, 0.0, 7.0, 12.0;
            5.0, 7.0, 0.0, 9.0;
            10.0, 12.0, 9.0, 0.0];
        let tree = NeighborJoiningBuilder.build_tree(&distances).unwrap();
        assert_eq!(tree.node(&tree.root()).children().len(), 3);
        for i in 0..4 {
            for j in 0..4 {
                assert_relative_eq!(
                    tree.distance(i, j).unwrap(),
                    distances[(i, j)],
                    epsilon = 1e-9
                );
            }
        }
    }

    #[test]
    fn nj_does_not_mutate_input() {
        let distances = six_taxon_distances();
        let copy = distances.clone();
        NeighborJoiningBuilder.build_tree(&distances).unwrap();
        assert_eq!(distances, copy);
    }
}
