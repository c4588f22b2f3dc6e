//! Neural Network inference.
//!
//! The action classifier is an ONNX model that is loaded and optimized with [`tract_onnx`].

pub mod tensor;

use std::{
    borrow::Cow,
    ops::{Index, Range},
    path::Path,
    sync::Arc,
};

use anyhow::{bail, Context};
use tensor::Tensor;
use tract_onnx::{
    prelude::{
        tvec, DatumExt, Framework, Graph, InferenceModelExt, SimplePlan, TValue, TVec, TypedFact,
        TypedOp,
    },
    tract_hir::infer::{GenericFactoid, ShapeFactoid},
};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Neural network loader.
pub struct Loader<'a> {
    model_data: Cow<'a, [u8]>,
    outputs: Option<Vec<usize>>,
    input_shape: Option<Vec<usize>>,
}

impl<'a> Loader<'a> {
    fn new(data: Cow<'a, [u8]>) -> Self {
        Self {
            model_data: data,
            outputs: None,
            input_shape: None,
        }
    }

    /// Only compute the specified outputs during inference.
    ///
    /// This takes a list of network output indices. The [`Outputs`] returned from
    /// [`NeuralNetwork::estimate`] will only contain the chosen output tensors, in the given order.
    pub fn with_output_selection<O>(mut self, outputs: O) -> Self
    where
        O: Into<Vec<usize>>,
    {
        self.outputs = Some(outputs.into());
        self
    }

    /// Pins the shape of the network's first input.
    ///
    /// Models exported with dynamic axes (eg. a symbolic batch size) have to be given a concrete
    /// input shape before they can be optimized. Loading fails if the model declares a different
    /// rank, or a concrete dimension that differs from `shape`.
    pub fn with_input_shape(mut self, shape: &[usize]) -> Self {
        self.input_shape = Some(shape.to_vec());
        self
    }

    /// Loads and optimizes the network.
    ///
    /// Returns an error if the network data is malformed, incomplete, uses unimplemented
    /// operations, if an output selection refers to a nonexistent output, or if the declared input
    /// shape conflicts with the one passed to [`Loader::with_input_shape`].
    pub fn load(self) -> anyhow::Result<NeuralNetwork> {
        let mut model = tract_onnx::onnx().model_for_read(&mut &*self.model_data)?;
        if let Some(shape) = self.input_shape {
            check_declared_shape(&model.input_fact(0)?.shape, &shape)?;
            model = model.with_input_fact(0, f32::fact(shape).into())?;
        }
        let graph = model.into_optimized()?;
        let outputs = graph.output_outlets()?;
        let selected_outputs = match self.outputs {
            Some(indices) => indices
                .iter()
                .map(|&i| {
                    outputs.get(i).copied().with_context(|| {
                        format!("output {i} selected, but network has {}", outputs.len())
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            None => outputs.to_vec(),
        };
        let model = SimplePlan::new_for_outputs(graph, &selected_outputs)?;

        Ok(NeuralNetwork(Arc::new(NeuralNetworkImpl { inner: model })))
    }
}

/// Checks that `declared` can be pinned to `expected`.
///
/// Symbolic and unknown dimensions match anything.
fn check_declared_shape(declared: &ShapeFactoid, expected: &[usize]) -> anyhow::Result<()> {
    let rank = declared.dims().count();
    if rank > expected.len() || (!declared.is_open() && rank != expected.len()) {
        bail!("network input has shape {declared:?}, expected {expected:?}");
    }
    for (dim, &want) in declared.dims().zip(expected) {
        if let GenericFactoid::Only(dim) = dim {
            match dim.to_i64() {
                Ok(have) if have != want as i64 => {
                    bail!("network input has shape {declared:?}, expected {expected:?}");
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// A neural network that can be used for inference.
///
/// This is a cheaply [`Clone`]able handle to the underlying network structures.
#[derive(Clone)]
pub struct NeuralNetwork(Arc<NeuralNetworkImpl>);

struct NeuralNetworkImpl {
    inner: Model,
}

impl NeuralNetwork {
    /// Loads a pre-trained model from an ONNX file path.
    ///
    /// The path must have a `.onnx` extension.
    pub fn from_path<'a, P: AsRef<Path>>(path: P) -> anyhow::Result<Loader<'a>> {
        Self::from_path_impl(path.as_ref())
    }

    fn from_path_impl<'a>(path: &Path) -> anyhow::Result<Loader<'a>> {
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => anyhow::bail!("neural network file must have `.onnx` extension"),
        }

        let model_data = std::fs::read(path)
            .with_context(|| format!("failed to read model from '{}'", path.display()))?;
        Ok(Loader::new(model_data.into()))
    }

    /// Loads a pre-trained model from an in-memory ONNX file.
    pub fn from_onnx(raw: &[u8]) -> Loader<'_> {
        Loader::new(raw.into())
    }

    /// Returns the number of input nodes of the network.
    pub fn num_inputs(&self) -> usize {
        self.0.inner.model().inputs.len()
    }

    /// Returns the number of output nodes of the network.
    pub fn num_outputs(&self) -> usize {
        self.0.inner.model().outputs.len()
    }

    /// Returns an iterator over the network's input node information.
    pub fn inputs(&self) -> InfoIter<'_> {
        InfoIter {
            net: self,
            ids: 0..self.num_inputs(),
            kind: NodeKind::Input,
        }
    }

    /// Returns an iterator over the network's output node information.
    pub fn outputs(&self) -> InfoIter<'_> {
        InfoIter {
            net: self,
            ids: 0..self.num_outputs(),
            kind: NodeKind::Output,
        }
    }

    /// Runs the network on a set of [`Inputs`], returning the estimated [`Outputs`].
    #[doc(alias = "infer")]
    pub fn estimate(&self, inputs: &Inputs) -> anyhow::Result<Outputs> {
        let inputs = inputs
            .iter()
            .map(|t| Ok(TValue::from_const(Arc::new(t.to_tract()?))))
            .collect::<anyhow::Result<TVec<_>>>()?;
        let outputs = self.0.inner.run(inputs)?;
        let inner = outputs
            .iter()
            .map(|tract| Tensor::from_tract(tract))
            .collect::<anyhow::Result<_>>()?;
        Ok(Outputs { inner })
    }
}

#[derive(Clone, Copy)]
enum NodeKind {
    Input,
    Output,
}

/// Iterator over a [`NeuralNetwork`]s input or output node information.
pub struct InfoIter<'a> {
    net: &'a NeuralNetwork,
    ids: Range<usize>,
    kind: NodeKind,
}

impl<'a> Iterator for InfoIter<'a> {
    type Item = NodeInfo<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;

        let model = self.net.0.inner.model();
        let (fact, outlet) = match self.kind {
            NodeKind::Input => (model.input_fact(id).ok()?, model.input_outlets().ok()?[id]),
            NodeKind::Output => (model.output_fact(id).ok()?, model.output_outlets().ok()?[id]),
        };

        Some(NodeInfo {
            shape: fact.shape.as_concrete(),
            name: &model.node(outlet.node).name,
        })
    }
}

/// Information about a neural network input or output node.
#[derive(Debug)]
pub struct NodeInfo<'a> {
    shape: Option<&'a [usize]>,
    name: &'a str,
}

impl<'a> NodeInfo<'a> {
    /// Returns the tensor shape of this node.
    ///
    /// Returns [`None`] if the shape is symbolic (for example, when the network was exported with a
    /// dynamic batch size and no shape was pinned with [`Loader::with_input_shape`]).
    #[inline]
    pub fn shape(&self) -> Option<&'a [usize]> {
        self.shape
    }

    /// Returns the name of this node.
    #[inline]
    pub fn name(&self) -> &'a str {
        self.name
    }
}

/// The result of a neural network inference pass.
///
/// This is a list of tensors corresponding to the network's output nodes.
#[derive(Debug)]
pub struct Outputs {
    inner: TVec<Tensor>,
}

impl Outputs {
    /// Returns the number of tensors in this inference output.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Index<usize> for Outputs {
    type Output = Tensor;

    fn index(&self, index: usize) -> &Tensor {
        &self.inner[index]
    }
}

/// List of input tensors for neural network inference.
#[derive(Debug)]
pub struct Inputs {
    inner: TVec<Tensor>,
}

impl Inputs {
    /// Returns the number of input tensors stored in `self`.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.inner.iter()
    }
}

impl From<Tensor> for Inputs {
    fn from(t: Tensor) -> Self {
        Self { inner: tvec![t] }
    }
}
