//! ONNX export of the fitted tree ensemble.
//!
//! Both model families map onto a single `ai.onnx.ml` `TreeEnsembleClassifier`
//! node: the forest averages leaf class fractions, boosting sums per-class
//! leaf scores on top of the log priors and applies a softmax.
//!
//! The message types below mirror the subset of `onnx.proto` (proto2) the
//! export needs, with the upstream field numbers.

use anyhow::{Result, bail};
use prost::Message;

use crate::model::{Classifier, TrainedModel};
use crate::model::tree::DecisionTree;

pub const INPUT_NAME: &str = "float_input";
const IR_VERSION: i64 = 8;
const ML_OPSET: i64 = 3;
const DEFAULT_OPSET: i64 = 15;
const ELEM_FLOAT: i32 = 1;
const ELEM_INT64: i32 = 7;

const ATTR_STRING: i32 = 3;
const ATTR_FLOATS: i32 = 6;
const ATTR_INTS: i32 = 7;
const ATTR_STRINGS: i32 = 8;

#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, optional, tag = "1")]
    pub ir_version: Option<i64>,
    #[prost(string, optional, tag = "2")]
    pub producer_name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub producer_version: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub domain: Option<String>,
    #[prost(int64, optional, tag = "5")]
    pub model_version: Option<i64>,
    #[prost(string, optional, tag = "6")]
    pub doc_string: Option<String>,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
    #[prost(message, repeated, tag = "14")]
    pub metadata_props: Vec<StringStringEntryProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OperatorSetIdProto {
    #[prost(string, optional, tag = "1")]
    pub domain: Option<String>,
    #[prost(int64, optional, tag = "2")]
    pub version: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StringStringEntryProto {
    #[prost(string, optional, tag = "1")]
    pub key: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "10")]
    pub doc_string: Option<String>,
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub op_type: Option<String>,
    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
    #[prost(string, optional, tag = "7")]
    pub domain: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(float, optional, tag = "2")]
    pub f: Option<f32>,
    #[prost(int64, optional, tag = "3")]
    pub i: Option<i64>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub s: Option<Vec<u8>>,
    #[prost(float, repeated, packed = "false", tag = "7")]
    pub floats: Vec<f32>,
    #[prost(int64, repeated, packed = "false", tag = "8")]
    pub ints: Vec<i64>,
    #[prost(bytes = "vec", repeated, tag = "9")]
    pub strings: Vec<Vec<u8>>,
    #[prost(int32, optional, tag = "20")]
    pub r#type: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(oneof = "TypeValue", tags = "1")]
    pub value: Option<TypeValue>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum TypeValue {
    #[prost(message, tag = "1")]
    TensorType(TensorTypeProto),
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorTypeProto {
    #[prost(int32, optional, tag = "1")]
    pub elem_type: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub shape: Option<TensorShapeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<Dimension>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Dimension {
    #[prost(oneof = "DimensionValue", tags = "1, 2")]
    pub value: Option<DimensionValue>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum DimensionValue {
    #[prost(int64, tag = "1")]
    DimValue(i64),
    #[prost(string, tag = "2")]
    DimParam(String),
}

impl AttributeProto {
    fn named(name: &str, kind: i32) -> Self {
        Self {
            name: Some(name.to_string()),
            r#type: Some(kind),
            ..Self::default()
        }
    }

    fn ints(name: &str, values: Vec<i64>) -> Self {
        Self {
            ints: values,
            ..Self::named(name, ATTR_INTS)
        }
    }

    fn floats(name: &str, values: Vec<f32>) -> Self {
        Self {
            floats: values,
            ..Self::named(name, ATTR_FLOATS)
        }
    }

    fn strings(name: &str, values: Vec<String>) -> Self {
        Self {
            strings: values.into_iter().map(String::into_bytes).collect(),
            ..Self::named(name, ATTR_STRINGS)
        }
    }

    fn string(name: &str, value: &str) -> Self {
        Self {
            s: Some(value.as_bytes().to_vec()),
            ..Self::named(name, ATTR_STRING)
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.s.as_deref().and_then(|s| std::str::from_utf8(s).ok())
    }
}

fn tensor_info(name: &str, elem_type: i32, dims: Vec<DimensionValue>) -> ValueInfoProto {
    ValueInfoProto {
        name: Some(name.to_string()),
        r#type: Some(TypeProto {
            value: Some(TypeValue::TensorType(TensorTypeProto {
                elem_type: Some(elem_type),
                shape: Some(TensorShapeProto {
                    dim: dims
                        .into_iter()
                        .map(|d| Dimension { value: Some(d) })
                        .collect(),
                }),
            })),
        }),
    }
}

/// Flattened `TreeEnsembleClassifier` attribute arrays.
#[derive(Default)]
struct EnsembleArrays {
    nodes_treeids: Vec<i64>,
    nodes_nodeids: Vec<i64>,
    nodes_featureids: Vec<i64>,
    nodes_values: Vec<f32>,
    nodes_modes: Vec<String>,
    nodes_truenodeids: Vec<i64>,
    nodes_falsenodeids: Vec<i64>,
    class_treeids: Vec<i64>,
    class_nodeids: Vec<i64>,
    class_ids: Vec<i64>,
    class_weights: Vec<f32>,
}

impl EnsembleArrays {
    /// Append one tree. `leaf_weights` yields `(class_id, weight)` for a leaf's value vector.
    fn push_tree<F>(&mut self, tree_id: i64, tree: &DecisionTree, leaf_weights: F)
    where
        F: Fn(&[f64]) -> Vec<(i64, f32)>,
    {
        for (node_id, node) in tree.nodes.iter().enumerate() {
            let node_id = node_id as i64;
            self.nodes_treeids.push(tree_id);
            self.nodes_nodeids.push(node_id);
            match node.split {
                Some(split) => {
                    self.nodes_featureids.push(split.feature as i64);
                    self.nodes_values.push(split.threshold as f32);
                    self.nodes_modes.push("BRANCH_LEQ".to_string());
                    self.nodes_truenodeids.push(split.left as i64);
                    self.nodes_falsenodeids.push(split.right as i64);
                }
                None => {
                    self.nodes_featureids.push(0);
                    self.nodes_values.push(0.0);
                    self.nodes_modes.push("LEAF".to_string());
                    self.nodes_truenodeids.push(0);
                    self.nodes_falsenodeids.push(0);
                    for (class_id, weight) in leaf_weights(&node.value) {
                        self.class_treeids.push(tree_id);
                        self.class_nodeids.push(node_id);
                        self.class_ids.push(class_id);
                        self.class_weights.push(weight);
                    }
                }
            }
        }
    }

    fn into_attributes(self) -> Vec<AttributeProto> {
        vec![
            AttributeProto::ints("nodes_treeids", self.nodes_treeids),
            AttributeProto::ints("nodes_nodeids", self.nodes_nodeids),
            AttributeProto::ints("nodes_featureids", self.nodes_featureids),
            AttributeProto::floats("nodes_values", self.nodes_values),
            AttributeProto::strings("nodes_modes", self.nodes_modes),
            AttributeProto::ints("nodes_truenodeids", self.nodes_truenodeids),
            AttributeProto::ints("nodes_falsenodeids", self.nodes_falsenodeids),
            AttributeProto::ints("class_treeids", self.class_treeids),
            AttributeProto::ints("class_nodeids", self.class_nodeids),
            AttributeProto::ints("class_ids", self.class_ids),
            AttributeProto::floats("class_weights", self.class_weights),
        ]
    }
}

fn ensemble_attributes(model: &TrainedModel) -> Result<Vec<AttributeProto>> {
    let mut arrays = EnsembleArrays::default();
    let mut extra = Vec::new();

    match model {
        TrainedModel::RandomForest(rf) => {
            if rf.trees.is_empty() {
                bail!("random forest has no trees to export");
            }
            let scale = 1.0 / rf.trees.len() as f64;
            for (t, tree) in rf.trees.iter().enumerate() {
                arrays.push_tree(t as i64, tree, |value| {
                    value
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| **p > 0.0)
                        .map(|(k, p)| (k as i64, (p * scale) as f32))
                        .collect()
                });
            }
            extra.push(AttributeProto::string("post_transform", "NONE"));
        }
        TrainedModel::GradientBoosting(gb) => {
            if gb.stages.is_empty() {
                bail!("gradient boosting model has no stages to export");
            }
            let lr = gb.params.learning_rate;
            let mut tree_id = 0i64;
            for stage in &gb.stages {
                for (k, tree) in stage.iter().enumerate() {
                    arrays.push_tree(tree_id, tree, |value| vec![(k as i64, (value[0] * lr) as f32)]);
                    tree_id += 1;
                }
            }
            extra.push(AttributeProto::floats(
                "base_values",
                gb.init.iter().map(|v| *v as f32).collect(),
            ));
            extra.push(AttributeProto::string("post_transform", "SOFTMAX"));
        }
    }

    let mut attrs = arrays.into_attributes();
    attrs.extend(extra);
    Ok(attrs)
}

/// Build the ONNX graph: `float_input [N, n_features]` → `label [N]`, `probabilities [N, n_classes]`.
pub fn build_model(model: &TrainedModel, feature_names: &[String], model_version: &str) -> Result<ModelProto> {
    let n_features = model.n_features();
    let n_classes = model.n_classes();
    if n_features == 0 || n_classes == 0 {
        bail!("model is not fitted");
    }
    if feature_names.len() != n_features {
        bail!(
            "model expects {} features but metadata lists {}",
            n_features,
            feature_names.len()
        );
    }

    let mut attribute = ensemble_attributes(model)?;
    attribute.push(AttributeProto::ints(
        "classlabels_int64s",
        (0..n_classes as i64).collect(),
    ));

    let node = NodeProto {
        input: vec![INPUT_NAME.to_string()],
        output: vec!["label".to_string(), "probabilities".to_string()],
        name: Some("TreeEnsembleClassifier".to_string()),
        op_type: Some("TreeEnsembleClassifier".to_string()),
        attribute,
        domain: Some("ai.onnx.ml".to_string()),
    };

    let graph = GraphProto {
        node: vec![node],
        name: Some("threat_detector".to_string()),
        doc_string: Some(format!("features: {}", feature_names.join(","))),
        input: vec![tensor_info(
            INPUT_NAME,
            ELEM_FLOAT,
            vec![
                DimensionValue::DimParam("N".to_string()),
                DimensionValue::DimValue(n_features as i64),
            ],
        )],
        output: vec![
            tensor_info(
                "label",
                ELEM_INT64,
                vec![DimensionValue::DimParam("N".to_string())],
            ),
            tensor_info(
                "probabilities",
                ELEM_FLOAT,
                vec![
                    DimensionValue::DimParam("N".to_string()),
                    DimensionValue::DimValue(n_classes as i64),
                ],
            ),
        ],
    };

    Ok(ModelProto {
        ir_version: Some(IR_VERSION),
        producer_name: Some(env!("CARGO_PKG_NAME").to_string()),
        producer_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        domain: Some("ai.dagshield".to_string()),
        model_version: Some(1),
        doc_string: Some(format!("{} threat detector", model.model_type())),
        graph: Some(graph),
        opset_import: vec![
            OperatorSetIdProto {
                domain: Some("ai.onnx.ml".to_string()),
                version: Some(ML_OPSET),
            },
            OperatorSetIdProto {
                domain: Some(String::new()),
                version: Some(DEFAULT_OPSET),
            },
        ],
        metadata_props: vec![StringStringEntryProto {
            key: Some("model_version".to_string()),
            value: Some(model_version.to_string()),
        }],
    })
}

pub fn encode_model(model: &TrainedModel, feature_names: &[String], model_version: &str) -> Result<Vec<u8>> {
    Ok(build_model(model, feature_names, model_version)?.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoostingParams, ForestParams, ModelSpec};
    use ndarray::Array2;

    fn fitted(spec: ModelSpec) -> TrainedModel {
        let x = Array2::from_shape_fn((30, 2), |(i, j)| ((i % 3) * 4 + j) as f64 + (i as f64 * 0.1));
        let y: Vec<usize> = (0..30).map(|i| i % 3).collect();
        let mut model = spec.build();
        model.fit(x.view(), &y, 3).unwrap();
        model
    }

    fn names() -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    fn attr<'a>(node: &'a NodeProto, name: &str) -> &'a AttributeProto {
        node.attribute
            .iter()
            .find(|a| a.name.as_deref() == Some(name))
            .unwrap_or_else(|| panic!("missing attribute {name}"))
    }

    #[test]
    fn forest_exports_averaged_tree_ensemble() {
        let model = fitted(ModelSpec::RandomForest(ForestParams {
            n_estimators: 4,
            max_depth: 3,
            bootstrap: true,
            seed: 1,
        }));
        let bytes = encode_model(&model, &names(), "1.0.0").unwrap();
        let decoded = ModelProto::decode(bytes.as_slice()).unwrap();
        let graph = decoded.graph.expect("graph");
        let node = &graph.node[0];
        assert_eq!(node.op_type.as_deref(), Some("TreeEnsembleClassifier"));
        assert_eq!(node.domain.as_deref(), Some("ai.onnx.ml"));
        assert_eq!(attr(node, "post_transform").as_str(), Some("NONE"));
        assert_eq!(attr(node, "classlabels_int64s").ints, vec![0, 1, 2]);

        let n_nodes: usize = match &model {
            TrainedModel::RandomForest(rf) => rf.trees.iter().map(|t| t.nodes.len()).sum(),
            _ => unreachable!(),
        };
        assert_eq!(attr(node, "nodes_nodeids").ints.len(), n_nodes);
        assert_eq!(attr(node, "nodes_modes").strings.len(), n_nodes);
        let weights = &attr(node, "class_weights").floats;
        assert_eq!(weights.len(), attr(node, "class_ids").ints.len());
        assert!(weights.iter().all(|w| *w > 0.0 && *w <= 0.25 + 1e-6));
    }

    #[test]
    fn boosting_exports_softmax_with_priors() {
        let model = fitted(ModelSpec::GradientBoosting(BoostingParams {
            n_estimators: 3,
            max_depth: 2,
            learning_rate: 0.1,
            seed: 1,
        }));
        let proto = build_model(&model, &names(), "1.0.0").unwrap();
        let node = &proto.graph.as_ref().unwrap().node[0];
        assert_eq!(attr(node, "post_transform").as_str(), Some("SOFTMAX"));
        assert_eq!(attr(node, "base_values").floats.len(), 3);
        // 3 stages x 3 classes
        let trees: std::collections::BTreeSet<i64> =
            attr(node, "nodes_treeids").ints.iter().copied().collect();
        assert_eq!(trees.len(), 9);

        let input = &proto.graph.as_ref().unwrap().input[0];
        assert_eq!(input.name.as_deref(), Some(INPUT_NAME));
    }

    #[test]
    fn feature_count_mismatch_fails() {
        let model = fitted(ModelSpec::RandomForest(ForestParams {
            n_estimators: 1,
            max_depth: 2,
            bootstrap: false,
            seed: 0,
        }));
        assert!(build_model(&model, &["only_one".to_string()], "1.0.0").is_err());
    }

    #[test]
    fn unfitted_model_fails() {
        let model = ModelSpec::GradientBoosting(BoostingParams {
            n_estimators: 1,
            max_depth: 1,
            learning_rate: 0.1,
            seed: 0,
        })
        .build();
        assert!(build_model(&model, &names(), "1.0.0").is_err());
    }
}
