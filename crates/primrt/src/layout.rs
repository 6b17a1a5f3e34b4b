//! Tensor layout descriptors: shape (static or ranged), element type and memory format.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Concrete extents of a tensor, one entry per axis.
pub type Dims = SmallVec<[usize; 4]>;

/// Scalar element types understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F32,
    I32,
    U8,
}

impl DType {
    pub const ALL: [DType; 3] = [DType::F32, DType::I32, DType::U8];

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::U8 => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }
}

/// Memory arrangement tag. `Any` leaves the arrangement unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Format {
    Any,
    RowMajor,
    Nhwc,
    Blocked16,
}

impl Format {
    /// Returns true when a layout tagged `self` can be consumed by something that asks for
    /// `requested` without reordering.
    pub fn satisfies(self, requested: Format) -> bool {
        self == requested || self == Format::Any
    }
}

/// Extent of a single axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Fixed(usize),
    Range { min: usize, max: usize },
    Unbounded,
}

impl Dim {
    pub fn range(min: usize, max: usize) -> Self {
        Dim::Range { min, max }
    }

    pub fn is_fixed(self) -> bool {
        matches!(self, Dim::Fixed(_))
    }

    pub fn contains(self, extent: usize) -> bool {
        match self {
            Dim::Fixed(value) => value == extent,
            Dim::Range { min, max } => (min..=max).contains(&extent),
            Dim::Unbounded => true,
        }
    }

    pub fn upper_bound(self) -> Option<usize> {
        match self {
            Dim::Fixed(value) => Some(value),
            Dim::Range { max, .. } => Some(max),
            Dim::Unbounded => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(value) => write!(f, "{value}"),
            Dim::Range { min, max } => write!(f, "{min}..{max}"),
            Dim::Unbounded => write!(f, "?"),
        }
    }
}

/// Declared tensor shape; rank is fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dim>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dim>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn fixed(extents: &[usize]) -> Self {
        Self {
            dims: extents.iter().copied().map(Dim::Fixed).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|dim| dim.is_fixed())
    }

    /// Returns the extents when every dimension is fixed.
    pub fn static_dims(&self) -> Option<Dims> {
        let mut out = Dims::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dim::Fixed(value) => out.push(*value),
                Dim::Range { .. } | Dim::Unbounded => return None,
            }
        }
        Some(out)
    }

    /// Checks rank and per-axis bounds of a concrete shape.
    pub fn accepts(&self, concrete: &[usize]) -> bool {
        concrete.len() == self.dims.len()
            && self
                .dims
                .iter()
                .zip(concrete.iter())
                .all(|(dim, extent)| dim.contains(*extent))
    }

    /// Largest element count the shape can take, when every axis is bounded.
    pub fn max_element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for dim in &self.dims {
            count = count.checked_mul(dim.upper_bound()?)?;
        }
        Some(count)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, "x")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

/// Shape, element type and memory format of one tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    pub shape: Shape,
    pub dtype: DType,
    pub format: Format,
}

impl Layout {
    pub fn new(shape: Shape, dtype: DType, format: Format) -> Self {
        Self {
            shape,
            dtype,
            format,
        }
    }

    /// Row-major layout with fully static extents.
    pub fn fixed(dtype: DType, extents: &[usize]) -> Self {
        Self::new(Shape::fixed(extents), dtype, Format::RowMajor)
    }

    /// Row-major layout with arbitrary (possibly dynamic) dimensions.
    pub fn dynamic(dtype: DType, dims: impl Into<Vec<Dim>>) -> Self {
        Self::new(Shape::new(dims), dtype, Format::RowMajor)
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn is_static(&self) -> bool {
        self.shape.is_static()
    }

    /// Same dtype and format, with every axis pinned to the given extents.
    pub fn concretize(&self, extents: &[usize]) -> Layout {
        Layout::new(Shape::fixed(extents), self.dtype, self.format)
    }

    /// Element capacity a buffer must provide for any admissible binding of this layout.
    pub fn capacity_elements(&self) -> Option<usize> {
        self.shape.max_element_count()
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{}/{:?}", self.dtype, self.shape, self.format)
    }
}

/// Checked product of extents.
pub fn element_count(dims: &[usize]) -> Option<usize> {
    dims.iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
}

pub fn format_layouts(layouts: &[Layout]) -> String {
    let parts: Vec<String> = layouts.iter().map(|layout| layout.to_string()).collect();
    format!("({})", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranged_shape_accepts_only_in_bounds_extents() {
        let shape = Shape::new(vec![Dim::range(1, 8), Dim::Fixed(3)]);
        assert!(shape.accepts(&[1, 3]));
        assert!(shape.accepts(&[8, 3]));
        assert!(!shape.accepts(&[9, 3]));
        assert!(!shape.accepts(&[2, 4]));
        assert!(!shape.accepts(&[2]));
        assert_eq!(shape.max_element_count(), Some(24));
        assert!(shape.static_dims().is_none());
    }

    #[test]
    fn unbounded_shape_has_no_capacity() {
        let layout = Layout::dynamic(DType::F32, vec![Dim::Unbounded, Dim::Fixed(2)]);
        assert_eq!(layout.capacity_elements(), None);
        assert_eq!(layout.to_string(), "F32[?x2]/RowMajor");
    }

    #[test]
    fn any_format_satisfies_every_request() {
        assert!(Format::Any.satisfies(Format::Nhwc));
        assert!(Format::RowMajor.satisfies(Format::RowMajor));
        assert!(!Format::RowMajor.satisfies(Format::Blocked16));
    }
}
