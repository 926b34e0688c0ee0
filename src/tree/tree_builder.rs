use nalgebra::DMatrix;

use crate::tree::Tree;
use crate::Result;

/// Builds a rooted tree from a pairwise distance matrix.
///
/// Implementations work on a private copy; the caller's matrix is never
/// mutated.
pub trait TreeBuilder {
    fn build_tree(&self, distances: &DMatrix<f64>) -> Result<Tree>;
}
