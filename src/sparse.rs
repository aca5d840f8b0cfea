//! Sparse tensor record and the geometry collaborator contract.
//!
//! A [`SparseConvTensor`] pairs a dense feature matrix (one row per active
//! spatial site) with the coordinate rows of those sites. The convolution
//! layer consumes one and produces a new one; it never inspects coordinates
//! itself.
//!
//! Index correspondences between input and output sites are computed by an
//! external sparse-geometry engine behind the [`IndicePairProvider`] trait:
//! per kernel offset, the list of `(input_row, output_row)` pairs that offset
//! connects. The engine's internal hashing/indexing is its own business; this
//! crate treats it as an oracle and defensively bounds-checks what it
//! returns.
//!
//! [`output_spatial_shape`] implements the standard convolution output
//! arithmetic shared by providers and the layer.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::KanConvConfig;
use crate::error::{KanConvError, KanConvResult};

/// Sparse feature tensor: a dense feature row per active coordinate.
///
/// `features` is `[num_active × channels]` row-major; `indices` is
/// `[num_active × (1 + ndim)]` row-major, each row `(batch, spatial...)`.
/// Row order is whatever the producing geometry engine defined; feature row
/// `i` corresponds to coordinate row `i`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SparseConvTensor {
    /// Active-site features, `[num_active × channels]` row-major.
    pub features: Vec<f32>,
    /// Feature channels per active site.
    pub channels: usize,
    /// Active coordinates, `[num_active × (1 + ndim)]` row-major.
    pub indices: Vec<i32>,
    /// Coordinate row width: `1 + ndim` (batch index plus spatial coords).
    pub coord_width: usize,
    /// Number of samples in the batch.
    pub batch_size: usize,
    /// Spatial extent per dimension.
    pub spatial_shape: Vec<i32>,
}

impl SparseConvTensor {
    /// Creates a tensor, checking that `features` and `indices` agree on the
    /// number of active sites.
    pub fn new(
        features: Vec<f32>,
        channels: usize,
        indices: Vec<i32>,
        batch_size: usize,
        spatial_shape: Vec<i32>,
    ) -> KanConvResult<Self> {
        let coord_width = 1 + spatial_shape.len();
        if channels == 0 || features.len() % channels != 0 {
            return Err(KanConvError::shape_mismatch(
                &[channels],
                &[features.len()],
            ));
        }
        let num_active = features.len() / channels;
        if indices.len() != num_active * coord_width {
            return Err(KanConvError::shape_mismatch(
                &[num_active, coord_width],
                &[indices.len() / coord_width.max(1), coord_width],
            ));
        }
        Ok(Self {
            features,
            channels,
            indices,
            coord_width,
            batch_size,
            spatial_shape,
        })
    }

    /// Number of active sites.
    #[inline]
    pub fn num_active(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.features.len() / self.channels
        }
    }

    /// One site's feature row.
    #[inline]
    pub fn feature_row(&self, row: usize) -> &[f32] {
        &self.features[row * self.channels..(row + 1) * self.channels]
    }

    /// One site's coordinate row: `(batch, spatial...)`.
    #[inline]
    pub fn coord_row(&self, row: usize) -> &[i32] {
        &self.indices[row * self.coord_width..(row + 1) * self.coord_width]
    }
}

/// Per-offset index correspondences produced by a geometry engine.
#[derive(Debug, Clone, Default)]
pub struct IndicePairSet {
    /// Output-site coordinate rows, `[num_out_active × (1 + ndim)]`.
    pub out_indices: Vec<i32>,
    /// Number of output active sites.
    pub num_out_active: usize,
    /// Per offset, the matched `(input_row, output_row)` pairs.
    pairs: Vec<Vec<(u32, u32)>>,
}

impl IndicePairSet {
    /// Creates an empty pair set for `num_offsets` kernel offsets.
    pub fn new(num_offsets: usize, out_indices: Vec<i32>, num_out_active: usize) -> Self {
        Self {
            out_indices,
            num_out_active,
            pairs: vec![Vec::new(); num_offsets],
        }
    }

    /// Number of kernel offsets this set covers.
    #[inline]
    pub fn num_offsets(&self) -> usize {
        self.pairs.len()
    }

    /// The matched pairs for one offset.
    #[inline]
    pub fn pairs(&self, offset: usize) -> &[(u32, u32)] {
        &self.pairs[offset]
    }

    /// Matched-pair count for one offset.
    #[inline]
    pub fn pair_count(&self, offset: usize) -> usize {
        self.pairs[offset].len()
    }

    /// Total matched pairs across all offsets.
    pub fn total_pairs(&self) -> usize {
        self.pairs.iter().map(Vec::len).sum()
    }

    /// Adds a correspondence to one offset's list.
    pub fn push_pair(&mut self, offset: usize, input_row: u32, output_row: u32) {
        self.pairs[offset].push((input_row, output_row));
    }
}

/// The external sparse-geometry engine.
///
/// Given the input's active coordinates and the convolution configuration,
/// the provider returns the output coordinate set and, per kernel offset,
/// the `(input_row, output_row)` correspondences that offset induces. The
/// layer treats the result as an oracle but bounds-checks every pair before
/// touching feature storage.
pub trait IndicePairProvider {
    /// Computes output coordinates and per-offset index pairs.
    fn compute_indice_pairs(
        &self,
        indices: &[i32],
        batch_size: usize,
        spatial_shape: &[i32],
        config: &KanConvConfig,
    ) -> KanConvResult<IndicePairSet>;
}

/// Standard convolution output extent per spatial dimension:
///
/// `out = floor((in + 2·pad − dilation·(kernel−1) − 1) / stride) + 1`
pub fn output_spatial_shape(
    spatial_shape: &[i32],
    kernel_size: &[usize],
    stride: &[usize],
    padding: &[usize],
    dilation: &[usize],
) -> Vec<i32> {
    spatial_shape
        .iter()
        .zip(kernel_size)
        .zip(stride)
        .zip(padding)
        .zip(dilation)
        .map(|((((&dim, &k), &s), &p), &d)| {
            let numer = dim as i64 + 2 * p as i64 - d as i64 * (k as i64 - 1) - 1;
            (numer.div_euclid(s as i64) + 1) as i32
        })
        .collect()
}

/// Transposed convolution output extent per spatial dimension:
///
/// `out = (in − 1)·stride − 2·pad + dilation·(kernel−1) + output_padding + 1`
pub fn transposed_output_spatial_shape(
    spatial_shape: &[i32],
    kernel_size: &[usize],
    stride: &[usize],
    padding: &[usize],
    dilation: &[usize],
    output_padding: &[usize],
) -> Vec<i32> {
    spatial_shape
        .iter()
        .zip(kernel_size)
        .zip(stride)
        .zip(padding)
        .zip(dilation)
        .zip(output_padding)
        .map(|(((((&dim, &k), &s), &p), &d), &op)| {
            ((dim as i64 - 1) * s as i64 - 2 * p as i64 + d as i64 * (k as i64 - 1) + op as i64 + 1)
                as i32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_row_accessors() {
        let t = SparseConvTensor::new(
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            3,
            vec![0, 5, 6, 7, 0, 1, 2, 3],
            1,
            vec![16, 16, 16],
        )
        .unwrap();
        assert_eq!(t.num_active(), 2);
        assert_eq!(t.feature_row(1), &[4.0, 5.0, 6.0]);
        assert_eq!(t.coord_row(0), &[0, 5, 6, 7]);
    }

    #[test]
    fn test_tensor_shape_validation() {
        // 7 feature values cannot be 3-channel rows.
        let err = SparseConvTensor::new(vec![0.0; 7], 3, vec![0; 8], 1, vec![4, 4, 4]);
        assert!(err.is_err());

        // indices rows must match feature rows.
        let err = SparseConvTensor::new(vec![0.0; 6], 3, vec![0; 4], 1, vec![4, 4, 4]);
        assert!(err.is_err());
    }

    #[test]
    fn test_pair_set() {
        let mut set = IndicePairSet::new(27, vec![0; 8], 2);
        set.push_pair(0, 0, 1);
        set.push_pair(0, 1, 0);
        set.push_pair(13, 0, 0);
        assert_eq!(set.num_offsets(), 27);
        assert_eq!(set.pair_count(0), 2);
        assert_eq!(set.pair_count(13), 1);
        assert_eq!(set.pair_count(26), 0);
        assert_eq!(set.total_pairs(), 3);
        assert_eq!(set.pairs(0)[1], (1, 0));
    }

    #[test]
    fn test_output_shape_arithmetic() {
        // 3x3 kernel, stride 1, no padding: shrink by 2.
        assert_eq!(
            output_spatial_shape(&[16, 16, 16], &[3, 3, 3], &[1, 1, 1], &[0, 0, 0], &[1, 1, 1]),
            vec![14, 14, 14]
        );
        // Padding 1 preserves the extent.
        assert_eq!(
            output_spatial_shape(&[16, 16], &[3, 3], &[1, 1], &[1, 1], &[1, 1]),
            vec![16, 16]
        );
        // Stride 2 halves (floor).
        assert_eq!(
            output_spatial_shape(&[15, 16], &[3, 3], &[2, 2], &[1, 1], &[1, 1]),
            vec![8, 8]
        );
        // Dilation widens the effective kernel.
        assert_eq!(
            output_spatial_shape(&[16], &[3], &[1], &[0], &[2]),
            vec![12]
        );
    }

    #[test]
    fn test_transposed_shape_inverts_strided() {
        let fwd = output_spatial_shape(&[15], &[3], &[2], &[1], &[1]);
        let back =
            transposed_output_spatial_shape(&fwd, &[3], &[2], &[1], &[1], &[0]);
        assert_eq!(back, vec![15]);
    }
}
