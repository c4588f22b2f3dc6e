//! Tensor API.
//!
//! Tensors are the inputs and outputs of the action classifier. A tensor is an N-dimensional array
//! of `f32`s stored in row-major order: the last dimension has stride 1.

use std::fmt;

use tinyvec::TinyVec;

/// Shape and strides of a tensor, stored back to back.
#[derive(Clone, PartialEq, Eq)]
struct Layout(TinyVec<[usize; 10]>);

impl Layout {
    fn from_shape(shape: &[usize]) -> Self {
        let mut vec = TinyVec::from(shape);
        vec.extend(shape.iter().map(|_| 0));

        let rank = shape.len();
        let mut stride = 1;
        for dim in (0..rank).rev() {
            vec[rank + dim] = stride;
            stride *= shape[dim];
        }

        Self(vec)
    }

    fn shape(&self) -> &[usize] {
        &self.0[..self.0.len() / 2]
    }

    fn strides(&self) -> &[usize] {
        &self.0[self.0.len() / 2..]
    }

    fn elements(&self) -> usize {
        self.shape().iter().product()
    }

    fn remove_prefix(&self, num: usize) -> Layout {
        assert!(num <= self.shape().len());

        let mut vec = TinyVec::with_capacity(2 * (self.shape().len() - num));
        vec.extend(self.shape()[num..].iter().copied());
        vec.extend(self.strides()[num..].iter().copied());
        Layout(vec)
    }
}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.shape()).finish()
    }
}

/// Advances `index` to the next position in row-major order.
///
/// Returns `false` once every position of `shape` has been visited.
fn advance(index: &mut [usize], shape: &[usize]) -> bool {
    for (next, &size) in index.iter_mut().zip(shape).rev() {
        if *next + 1 < size {
            *next += 1;
            return true;
        }
        *next = 0;
    }
    false
}

/// A dynamically sized `f32` tensor.
///
/// # Construction
///
/// Tensors are created with [`Tensor::from_array_shape_fn`], [`Tensor::from_iter`] or
/// [`Tensor::zeros`], or via the provided `From` impls for 1-dimensional data.
///
/// # Data Access
///
/// [`Tensor::index`] creates a [`TensorView`] of a suffix of the tensor's dimensions, and
/// [`Tensor::get`] reads a single element. [`Tensor::as_raw_data`] exposes all elements in
/// row-major order.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    layout: Layout,
    data: Box<[f32]>,
}

/// A borrowed view into a [`Tensor`].
#[derive(Clone)]
pub struct TensorView<'a> {
    layout: Layout,
    data: &'a [f32],
}

impl Tensor {
    /// Creates an `N`-dimensional tensor of the given shape by calling `f` for each element.
    ///
    /// `f` is invoked with successive indices in row-major order, starting with `[0, ..., 0, 0]`,
    /// then `[0, ..., 0, 1]` and so on.
    pub fn from_array_shape_fn<const N: usize, F: FnMut([usize; N]) -> f32>(
        shape: [usize; N],
        mut f: F,
    ) -> Self {
        let layout = Layout::from_shape(&shape);
        let mut data = Vec::with_capacity(layout.elements());
        if layout.elements() != 0 {
            let mut index = [0; N];
            loop {
                data.push(f(index));
                if !advance(&mut index, &shape) {
                    break;
                }
            }
        }
        Self {
            layout,
            data: data.into_boxed_slice(),
        }
    }

    /// Creates a tensor of the given shape with every element set to `0.0`.
    pub fn zeros(shape: &[usize]) -> Self {
        let layout = Layout::from_shape(shape);
        Self {
            data: vec![0.0; layout.elements()].into_boxed_slice(),
            layout,
        }
    }

    /// Creates a tensor of the given shape by pulling elements from an iterator.
    ///
    /// # Panics
    ///
    /// `iter` must yield exactly as many elements as `shape` describes, otherwise this method will
    /// panic.
    pub fn from_iter<I: IntoIterator<Item = f32>>(shape: &[usize], iter: I) -> Self {
        let layout = Layout::from_shape(shape);
        let data: Box<[f32]> = iter.into_iter().collect();
        assert_eq!(
            data.len(),
            layout.elements(),
            "element count does not match tensor shape {:?}",
            shape,
        );
        Self { layout, data }
    }

    pub(super) fn from_tract(tract: &tract_onnx::prelude::Tensor) -> anyhow::Result<Self> {
        let data = tract.as_slice::<f32>()?;
        Ok(Self::from_iter(tract.shape(), data.iter().copied()))
    }

    pub(super) fn to_tract(&self) -> anyhow::Result<tract_onnx::prelude::Tensor> {
        Ok(tract_onnx::prelude::Tensor::from_shape(
            self.shape(),
            &self.data,
        )?)
    }

    /// Returns the tensor's elements in row-major order.
    pub fn as_raw_data(&self) -> &[f32] {
        &self.data
    }

    /// Returns the shape of this tensor (the number of entries in each dimension).
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    /// Returns the number of dimensions of this tensor.
    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    /// Returns the total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reads the element at the fully specified position `indices`.
    ///
    /// # Panics
    ///
    /// Panics if `indices` does not address exactly one element of `self`.
    #[track_caller]
    pub fn get<const N: usize>(&self, indices: [usize; N]) -> f32 {
        assert_eq!(
            N,
            self.rank(),
            "attempted to read element {:?} of tensor with shape {:?}",
            indices,
            self.shape(),
        );
        self.index(indices).as_singular()
    }

    /// Indexes a prefix of the tensor's dimensions with `indices`.
    ///
    /// Indexing a tensor of shape `[2, 3, 4, 5]` with `[a, b]` returns a view of shape `[4, 5]`;
    /// indexing it with 4 indices returns a view of shape `[]` (a single value).
    ///
    /// # Panics
    ///
    /// This method will panic if `indices` has more entries than `self` has dimensions, or if any
    /// index is out of bounds.
    #[track_caller]
    pub fn index<const N: usize>(&self, indices: [usize; N]) -> TensorView<'_> {
        TensorView {
            layout: self.layout.clone(),
            data: &self.data,
        }
        .index(indices)
    }

    /// Returns the value stored in a 0-dimensional tensor.
    ///
    /// # Panics
    ///
    /// `self` must have exactly 0 dimensions, otherwise this method will panic.
    #[track_caller]
    pub fn as_singular(&self) -> f32 {
        assert_eq!(
            self.rank(),
            0,
            "attempted to access tensor of shape {:?} as singular element",
            self.shape(),
        );
        self.data[0]
    }
}

impl From<&[f32]> for Tensor {
    fn from(slice: &[f32]) -> Self {
        Tensor::from_iter(&[slice.len()], slice.iter().copied())
    }
}

impl<const N: usize> From<[f32; N]> for Tensor {
    fn from(arr: [f32; N]) -> Self {
        Tensor::from_iter(&[N], arr)
    }
}

impl<'d> TensorView<'d> {
    /// Returns the shape of this tensor view.
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    /// Returns the number of dimensions of this tensor view.
    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    /// Indexes a prefix of the view's dimensions with `indices`.
    ///
    /// # Panics
    ///
    /// This method will panic if `indices` has more entries than `self` has dimensions, or if any
    /// index is out of bounds.
    #[track_caller]
    pub fn index<const N: usize>(&self, indices: [usize; N]) -> TensorView<'d> {
        assert!(
            N <= self.rank(),
            "attempted to index tensor of shape {:?} with {:?}",
            self.shape(),
            indices
        );
        let mut data = self.data;
        for ((&length, &stride), &index) in self
            .layout
            .shape()
            .iter()
            .zip(self.layout.strides())
            .zip(&indices)
        {
            assert!(
                index < length,
                "attempted to index tensor of shape {:?} with {:?}",
                self.shape(),
                indices
            );
            data = &data[index * stride..(index + 1) * stride];
        }
        TensorView {
            layout: self.layout.remove_prefix(N),
            data,
        }
    }

    /// Returns the value stored in a 0-dimensional view.
    ///
    /// # Panics
    ///
    /// `self` must have exactly 0 dimensions, otherwise this method will panic.
    #[track_caller]
    pub fn as_singular(&self) -> f32 {
        assert_eq!(
            self.rank(),
            0,
            "attempted to access view of shape {:?} as singular element",
            self.shape(),
        );
        self.data[0]
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.layout)
            .finish()
    }
}

impl fmt::Debug for TensorView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorView")
            .field("shape", &self.layout)
            .finish()
    }
}
