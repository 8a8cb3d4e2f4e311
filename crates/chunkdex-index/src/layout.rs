//! Chunked array geometry.
//!
//! Coordinates handed to an index are *scaled*: chunk numbers along each
//! axis, not element offsets. The slowest-varying dimension comes first.

use serde::{Deserialize, Serialize};
use chunkdex_common::{ChunkdexError, Result};

/// Shape of a chunked array and of its chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawChunkLayout")]
pub struct ChunkLayout {
    /// Current extent of each dimension, in elements.
    dims: Vec<u64>,
    /// Maximum extent of each dimension; `None` means unlimited.
    max_dims: Vec<Option<u64>>,
    /// Chunk extent along each dimension, in elements.
    chunk_dims: Vec<u32>,
    /// Size of one element in bytes.
    element_size: u32,
}

/// Unvalidated wire form of `ChunkLayout`.
#[derive(Deserialize)]
struct RawChunkLayout {
    dims: Vec<u64>,
    max_dims: Vec<Option<u64>>,
    chunk_dims: Vec<u32>,
    element_size: u32,
}

impl TryFrom<RawChunkLayout> for ChunkLayout {
    type Error = ChunkdexError;

    fn try_from(raw: RawChunkLayout) -> Result<Self> {
        Self::new(raw.dims, raw.max_dims, raw.chunk_dims, raw.element_size)
    }
}

impl ChunkLayout {
    /// Builds a layout, validating every extent.
    pub fn new(
        dims: Vec<u64>,
        max_dims: Vec<Option<u64>>,
        chunk_dims: Vec<u32>,
        element_size: u32,
    ) -> Result<Self> {
        if dims.is_empty() {
            return Err(invalid("ndims", 0));
        }
        if max_dims.len() != dims.len() {
            return Err(invalid("max_dims.len", max_dims.len()));
        }
        if chunk_dims.len() != dims.len() {
            return Err(invalid("chunk_dims.len", chunk_dims.len()));
        }
        if element_size == 0 {
            return Err(invalid("element_size", 0));
        }
        if let Some(i) = chunk_dims.iter().position(|c| *c == 0) {
            return Err(invalid(&format!("chunk_dims[{}]", i), 0));
        }
        for (i, (dim, max)) in dims.iter().zip(&max_dims).enumerate() {
            if let Some(max) = max {
                if dim > max {
                    return Err(invalid(&format!("dims[{}]", i), dim));
                }
            }
        }

        let layout = Self {
            dims,
            max_dims,
            chunk_dims,
            element_size,
        };

        // Everything derived later must fit in 64 bits
        let bytes = layout
            .chunk_dims
            .iter()
            .try_fold(layout.element_size as u64, |acc, c| acc.checked_mul(*c as u64));
        if !bytes.is_some_and(|b| b <= u32::MAX as u64) {
            return Err(invalid("chunk_byte_size", "over 4 GiB"));
        }
        if checked_product(&layout.chunks()).is_none() {
            return Err(invalid("nchunks", "overflow"));
        }
        if let Some(max_chunks) = layout.max_chunks() {
            let total = checked_product(&max_chunks)
                .and_then(|n| n.checked_mul(layout.chunk_byte_size() as u64));
            if total.is_none() {
                return Err(invalid("max_nchunks", "overflow"));
            }
        }

        Ok(layout)
    }

    /// Builds a layout whose maximum extents equal its current extents.
    pub fn fixed(dims: Vec<u64>, chunk_dims: Vec<u32>, element_size: u32) -> Result<Self> {
        let max_dims = dims.iter().copied().map(Some).collect();
        Self::new(dims, max_dims, chunk_dims, element_size)
    }

    /// Number of chunked dimensions.
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Current extents.
    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    /// Maximum extents.
    pub fn max_dims(&self) -> &[Option<u64>] {
        &self.max_dims
    }

    /// Chunk extents.
    pub fn chunk_dims(&self) -> &[u32] {
        &self.chunk_dims
    }

    /// Element size in bytes.
    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    /// Bytes in one unfiltered chunk.
    pub fn chunk_byte_size(&self) -> u32 {
        self.chunk_dims
            .iter()
            .fold(self.element_size, |acc, c| acc.saturating_mul(*c))
    }

    /// Chunks along each dimension at the current extents.
    pub fn chunks(&self) -> Vec<u64> {
        self.dims
            .iter()
            .zip(&self.chunk_dims)
            .map(|(d, c)| d.div_ceil(*c as u64))
            .collect()
    }

    /// Chunks along each dimension at the maximum extents, if all are bounded.
    pub fn max_chunks(&self) -> Option<Vec<u64>> {
        self.max_dims
            .iter()
            .zip(&self.chunk_dims)
            .map(|(max, c)| max.map(|m| m.div_ceil(*c as u64)))
            .collect()
    }

    /// Linearization multipliers for the current extents.
    pub fn down_chunks(&self) -> Vec<u64> {
        down_products(&self.chunks())
    }

    /// Linearization multipliers for the maximum extents.
    pub fn max_down_chunks(&self) -> Option<Vec<u64>> {
        self.max_chunks().map(|m| down_products(&m))
    }

    /// Total chunks at the current extents.
    pub fn nchunks(&self) -> u64 {
        self.chunks().iter().product()
    }

    /// Total chunks at the maximum extents, if all are bounded.
    pub fn max_nchunks(&self) -> Option<u64> {
        self.max_chunks().map(|m| m.iter().product())
    }

    /// Number of unlimited dimensions.
    pub fn unlimited_dims(&self) -> usize {
        self.max_dims.iter().filter(|m| m.is_none()).count()
    }

    /// True if any dimension can still grow.
    pub fn is_extensible(&self) -> bool {
        self.dims
            .iter()
            .zip(&self.max_dims)
            .any(|(d, max)| *max != Some(*d))
    }

    /// Grows or shrinks the current extents within the maximum extents.
    pub fn set_dims(&mut self, dims: Vec<u64>) -> Result<()> {
        let updated = Self::new(
            dims,
            self.max_dims.clone(),
            self.chunk_dims.clone(),
            self.element_size,
        )?;
        *self = updated;
        Ok(())
    }

    /// Checks that `scaled` has one coordinate per dimension and that the
    /// element offset one chunk past it still fits in 64 bits.
    pub fn check_scaled(&self, scaled: &[u64]) -> Result<()> {
        if scaled.len() != self.ndims() {
            return Err(ChunkdexError::InvalidParameter {
                name: "scaled.len".to_string(),
                value: scaled.len().to_string(),
            });
        }
        for (i, (s, c)) in scaled.iter().zip(&self.chunk_dims).enumerate() {
            if s.checked_add(1).and_then(|n| n.checked_mul(*c as u64)).is_none() {
                return Err(ChunkdexError::InvalidParameter {
                    name: format!("scaled[{}]", i),
                    value: s.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn invalid(name: &str, value: impl ToString) -> ChunkdexError {
    ChunkdexError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}

fn checked_product(values: &[u64]) -> Option<u64> {
    values.iter().try_fold(1u64, |acc, v| acc.checked_mul(*v))
}

/// Returns, for each dimension, the product of the counts of every faster
/// dimension.
pub fn down_products(counts: &[u64]) -> Vec<u64> {
    let mut down = vec![1u64; counts.len()];
    for i in (0..counts.len().saturating_sub(1)).rev() {
        down[i] = down[i + 1].saturating_mul(counts[i + 1]);
    }
    down
}

/// Maps a scaled coordinate to its row-major chunk number.
pub fn linearize(scaled: &[u64], down: &[u64]) -> u64 {
    scaled
        .iter()
        .zip(down)
        .fold(0u64, |acc, (s, d)| acc.wrapping_add(s.wrapping_mul(*d)))
}

/// Walks every coordinate below `limits` in row-major order.
///
/// The last dimension varies fastest; overflow carries into slower ones.
#[derive(Debug, Clone)]
pub struct Odometer {
    limits: Vec<u64>,
    next: Option<Vec<u64>>,
}

impl Odometer {
    /// Starts at the origin. Yields nothing if any limit is zero.
    pub fn new(limits: Vec<u64>) -> Self {
        let next = if limits.iter().all(|l| *l > 0) {
            Some(vec![0; limits.len()])
        } else {
            None
        };
        Self { limits, next }
    }
}

impl Iterator for Odometer {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Vec<u64>> {
        let current = self.next.take()?;

        let mut following = current.clone();
        let mut carried = true;
        for i in (0..following.len()).rev() {
            following[i] += 1;
            if following[i] < self.limits[i] {
                carried = false;
                break;
            }
            following[i] = 0;
        }
        if !carried {
            self.next = Some(following);
        }

        Some(current)
    }
}
