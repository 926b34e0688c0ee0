use log::info;
use nalgebra::DMatrix;

use crate::tree::cluster_matrix::ClusterMatrix;
use crate::tree::tree_builder::TreeBuilder;
use crate::tree::{NodeArena, NodeIdx, Tree};
use crate::Result;

/// Agglomerative clustering under a constant-rate assumption; merged pairs
/// sit at half their distance, so every leaf ends up equidistant from the
/// root (the tree is ultrametric).
///
/// # Example
/// ```
/// use dendro::tree::{TreeBuilder, UpgmaBuilder};
/// use nalgebra::dmatrix;
///
/// let distances = dmatrix![
///     0.0, 2.0, 6.0;
///     2.0, 0.0, 6.0;
///     6.0, 6.0, 0.0];
/// let tree = UpgmaBuilder.build_tree(&distances).unwrap();
/// assert_eq!(tree.distance(0, 1).unwrap(), 2.0);
/// assert_eq!(tree.distance(0, 2).unwrap(), 6.0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct UpgmaBuilder;

impl TreeBuilder for UpgmaBuilder {
    fn build_tree(&self, distances: &DMatrix<f64>) -> Result<Tree> {
        UpgmaBuilder::build_upgma_tree(distances)
    }
}

impl UpgmaBuilder {
    fn build_upgma_tree(distances: &DMatrix<f64>) -> Result<Tree> {
        let mut matrix = ClusterMatrix::validated(distances, 1)?;
        let n = matrix.taxa();
        info!("Building UPGMA tree for {} taxa.", n);

        let mut arena = NodeArena::new();
        let mut clusters: Vec<NodeIdx> = (0..n).map(|i| arena.leaf(i)).collect();
        let mut heights = vec![0.0; n];
        let mut sizes = vec![1usize; n];

        let mut root = clusters[0];
        while let Some((i, j)) = matrix.min_active_pair() {
            let height = matrix.distance(i, j) / 2.0;
            let merged = arena.internal(
                vec![clusters[i], clusters[j]],
                vec![height - heights[i], height - heights[j]],
            )?;
            matrix.retire(j);
            matrix.merge_weighted(i, j, sizes[i], sizes[j]);
            clusters[i] = merged;
            sizes[i] += sizes[j];
            heights[i] = height;
            root = merged;
        }
        Tree::new(arena, root)
    }
}
