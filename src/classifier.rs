//! Action classification backends.

use std::path::Path;

use anyhow::bail;

use crate::{
    assemble::TensorLayout,
    nn::{tensor::Tensor, Inputs, Loader, NeuralNetwork},
    postprocess::NUM_CLASSES,
};

/// Maps an assembled skeleton tensor to raw, unnormalized class scores.
///
/// Inference is synchronous and may block for a while. Implementations are only ever invoked from
/// the scheduler thread, one call at a time.
///
/// Closures of type `FnMut(&Tensor) -> anyhow::Result<Vec<f32>>` implement this trait, which is
/// handy for tests and for hooking up inference backends that live outside this crate.
pub trait ActionClassifier: Send {
    fn infer(&mut self, input: &Tensor) -> anyhow::Result<Vec<f32>>;
}

impl<F> ActionClassifier for F
where
    F: FnMut(&Tensor) -> anyhow::Result<Vec<f32>> + Send,
{
    fn infer(&mut self, input: &Tensor) -> anyhow::Result<Vec<f32>> {
        self(input)
    }
}

/// An ONNX graph-convolutional action classifier.
#[derive(Clone)]
pub struct OnnxClassifier {
    network: NeuralNetwork,
    layout: TensorLayout,
}

impl OnnxClassifier {
    /// Loads the classifier from an `.onnx` file.
    ///
    /// Returns an error if the model cannot be loaded, if it does not accept a single input
    /// tensor of the shape described by `layout`, or if it produces fewer than [`NUM_CLASSES`]
    /// scores.
    ///
    /// Symbolic input dimensions (such as a dynamic batch axis) are pinned to `layout`.
    pub fn from_path<P: AsRef<Path>>(path: P, layout: TensorLayout) -> anyhow::Result<Self> {
        Self::load(NeuralNetwork::from_path(path)?, layout)
    }

    /// Loads the classifier from an in-memory ONNX model.
    pub fn from_onnx(raw: &[u8], layout: TensorLayout) -> anyhow::Result<Self> {
        Self::load(NeuralNetwork::from_onnx(raw), layout)
    }

    fn load(loader: Loader<'_>, layout: TensorLayout) -> anyhow::Result<Self> {
        let expected = layout.shape();
        let network = loader
            .with_input_shape(&expected)
            .with_output_selection([0])
            .load()?;

        if network.num_inputs() != 1 {
            bail!(
                "action classifier must have 1 input, this one has {}",
                network.num_inputs()
            );
        }
        for info in network.outputs() {
            if let Some(shape) = info.shape() {
                let len = shape.iter().product::<usize>();
                if len < NUM_CLASSES {
                    bail!(
                        "action classifier output '{}' has {len} scores, expected {NUM_CLASSES}",
                        info.name(),
                    );
                }
            }
        }

        log::debug!("loaded action classifier with input shape {expected:?}");
        Ok(Self { network, layout })
    }

    #[inline]
    pub fn layout(&self) -> TensorLayout {
        self.layout
    }
}

impl ActionClassifier for OnnxClassifier {
    fn infer(&mut self, input: &Tensor) -> anyhow::Result<Vec<f32>> {
        if input.shape() != self.layout.shape() {
            bail!(
                "input tensor has shape {:?}, classifier expects {:?}",
                input.shape(),
                self.layout.shape()
            );
        }
        let outputs = self.network.estimate(&Inputs::from(input.clone()))?;
        Ok(outputs[0].as_raw_data().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;
    use tract_onnx::pb::{
        self,
        tensor_shape_proto::{dimension, Dimension},
    };

    use super::*;

    #[test]
    fn closures_are_classifiers() {
        let mut calls = 0;
        let mut classifier = |input: &Tensor| -> anyhow::Result<Vec<f32>> {
            calls += 1;
            Ok(vec![input.len() as f32])
        };
        let tensor = TensorLayout::SINGLE_PERSON_50.assemble(&crate::buffer::sample(&[], 40));
        assert_eq!(classifier.infer(&tensor).unwrap(), [3750.0]);
        assert_eq!(calls, 1);
    }

    #[test]
    fn boxed_classifier() {
        let mut classifier: Box<dyn ActionClassifier> =
            Box::new(|_: &Tensor| -> anyhow::Result<Vec<f32>> { bail!("no model") });
        assert!(classifier.infer(&Tensor::zeros(&[1])).is_err());
    }

    const FLOAT: i32 = pb::tensor_proto::DataType::Float as i32;

    fn fixed(shape: [usize; 5]) -> Vec<Dimension> {
        shape
            .iter()
            .map(|&n| Dimension {
                value: Some(dimension::Value::DimValue(n as i64)),
                ..Default::default()
            })
            .collect()
    }

    fn tensor_info(name: &str, dims: Vec<Dimension>) -> pb::ValueInfoProto {
        pb::ValueInfoProto {
            name: name.into(),
            r#type: Some(pb::TypeProto {
                value: Some(pb::type_proto::Value::TensorType(pb::type_proto::Tensor {
                    elem_type: FLOAT,
                    shape: Some(pb::TensorShapeProto { dim: dims }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Builds a model that flattens its input and returns the first `classes` values.
    fn first_values_model(input: Vec<Dimension>, len: usize, classes: usize) -> Vec<u8> {
        let weights = (0..len)
            .flat_map(|row| (0..classes).map(move |col| if row == col { 1.0 } else { 0.0 }))
            .collect();
        let graph = pb::GraphProto {
            name: "first_values".into(),
            node: vec![
                pb::NodeProto {
                    name: "flatten".into(),
                    op_type: "Flatten".into(),
                    input: vec!["skeleton".into()],
                    output: vec!["flat".into()],
                    ..Default::default()
                },
                pb::NodeProto {
                    name: "scores".into(),
                    op_type: "MatMul".into(),
                    input: vec!["flat".into(), "weights".into()],
                    output: vec!["scores".into()],
                    ..Default::default()
                },
            ],
            initializer: vec![pb::TensorProto {
                name: "weights".into(),
                dims: vec![len as i64, classes as i64],
                data_type: FLOAT,
                float_data: weights,
                ..Default::default()
            }],
            input: vec![tensor_info("skeleton", input)],
            output: vec![pb::ValueInfoProto {
                name: "scores".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        pb::ModelProto {
            ir_version: 7,
            opset_import: vec![pb::OperatorSetIdProto {
                domain: String::new(),
                version: 13,
            }],
            graph: Some(graph),
            ..Default::default()
        }
        .encode_to_vec()
    }

    #[test]
    fn onnx_classifier_scores() {
        let layout = TensorLayout::SINGLE_PERSON_50;
        let model = first_values_model(fixed(layout.shape()), 3 * 50 * 25, NUM_CLASSES);
        let mut classifier = OnnxClassifier::from_onnx(&model, layout).unwrap();
        assert_eq!(classifier.layout(), layout);

        let input = Tensor::from_array_shape_fn(layout.shape(), |[_, c, t, joint, _]| {
            (c * 10_000 + t * 100 + joint) as f32
        });
        let scores = classifier.infer(&input).unwrap();
        let expected = (0..NUM_CLASSES).map(|j| j as f32).collect::<Vec<_>>();
        assert_eq!(scores, expected);

        let wrong = Tensor::zeros(&TensorLayout::TWO_PERSON_144.shape());
        assert!(classifier.infer(&wrong).is_err());
    }

    #[test]
    fn dynamic_batch_is_pinned() {
        let layout = TensorLayout::SINGLE_PERSON_50;
        let mut input = fixed(layout.shape());
        input[0].value = Some(dimension::Value::DimParam("batch".into()));
        let model = first_values_model(input, 3 * 50 * 25, NUM_CLASSES);

        let mut classifier = OnnxClassifier::from_onnx(&model, layout).unwrap();
        let scores = classifier.infer(&Tensor::zeros(&layout.shape())).unwrap();
        assert_eq!(scores, [0.0; NUM_CLASSES]);
    }

    #[test]
    fn layout_mismatch() {
        let single = TensorLayout::SINGLE_PERSON_50;
        let model = first_values_model(fixed(single.shape()), 3 * 50 * 25, NUM_CLASSES);
        let err = OnnxClassifier::from_onnx(&model, TensorLayout::TWO_PERSON_144)
            .err()
            .unwrap();
        assert!(err.to_string().contains("[1, 3, 144, 25, 2]"), "{err}");

        let two = TensorLayout::TWO_PERSON_144;
        let model = first_values_model(fixed(two.shape()), 3 * 144 * 25 * 2, NUM_CLASSES);
        assert!(OnnxClassifier::from_onnx(&model, single).is_err());
        OnnxClassifier::from_onnx(&model, two).unwrap();
    }

    #[test]
    fn too_few_scores() {
        let layout = TensorLayout::SINGLE_PERSON_50;
        let model = first_values_model(fixed(layout.shape()), 3 * 50 * 25, 5);
        let err = OnnxClassifier::from_onnx(&model, layout).err().unwrap();
        assert!(err.to_string().contains("5 scores"), "{err}");
    }

    #[test]
    fn invalid_model() {
        let res = OnnxClassifier::from_onnx(&[0xff; 64], TensorLayout::SINGLE_PERSON_50);
        assert!(res.is_err());
        let res = OnnxClassifier::from_path("missing.onnx", TensorLayout::TWO_PERSON_144);
        assert!(res.is_err());
    }
}
