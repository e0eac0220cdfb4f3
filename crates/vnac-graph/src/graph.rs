//! The shape-annotated compute graph consumed by the compiler.
//!
//! The upstream converter hands the compiler an ordered operation list with
//! typed attributes and shapes already inferred. [`Graph::from_json_str`]
//! deserializes that document and folds each raw operation record into the
//! closed [`Operation`] union. The graph is immutable once built.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::GraphError;

/// Declaration of a tensor: its inferred dimension sizes.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TensorDecl {
    /// Ordered dimension sizes, typically (N, C, H, W).
    pub shape: Vec<usize>,
}

impl TensorDecl {
    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of channels: the third dimension from the end, or 1 for
    /// tensors of rank 2 or less.
    pub fn channels(&self) -> usize {
        if self.shape.len() > 2 {
            self.shape[self.shape.len() - 3]
        } else {
            1
        }
    }

    /// Index of the channel dimension for tensors of rank 3 or more.
    pub fn channel_dim(&self) -> usize {
        self.shape.len().saturating_sub(3)
    }
}

/// A single operation record.
///
/// Anything outside this union deserializes into
/// [`Operation::Unsupported`] and is rejected with a descriptive error
/// when the lowering scan reaches it.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// A constant tensor materialized from the weight store.
    Variable {
        /// Stem of the weight file holding the persisted values.
        label: String,
        /// Name of the produced tensor.
        output: String,
    },
    /// 2-D convolution.
    Conv {
        input: String,
        filter: String,
        bias: String,
        output: String,
        /// Stride in (H, W).
        stride: [usize; 2],
        /// Padding as ((top, bottom), (left, right)).
        padding: [[usize; 2]; 2],
    },
    /// Rectified linear unit. Folded into the producing convolution.
    Relu { x: String, y: String },
    /// Average pooling. Only a 2×2 window with stride 2 is supported.
    AvgPool {
        input: String,
        output: String,
        size: [usize; 2],
        stride: [usize; 2],
    },
    /// Nearest-neighbour upsampling.
    NearestUpsample {
        input: String,
        output: String,
        factor: [usize; 2],
    },
    /// Multilinear upsampling, lowered as nearest-neighbour.
    MultilinearUpsample {
        input: String,
        output: String,
        factor: [usize; 2],
    },
    /// Affine batch normalization over channels.
    BatchNorm {
        input: String,
        output: String,
        mean: String,
        variance: String,
        offset: String,
        scale: String,
        epsilon: f64,
    },
    /// Concatenation along the channel axis.
    Concat {
        values: Vec<String>,
        value: String,
        axis: usize,
    },
    /// Fully-connected layer. Not expressible on the target.
    Dense {
        input: String,
        filter: String,
        bias: String,
        output: String,
    },
    /// An operation kind the compiler does not understand.
    Unsupported { kind: String },
}

impl Operation {
    /// The wire name of this operation kind.
    pub fn kind_name(&self) -> &str {
        match self {
            Self::Variable { .. } => "variable",
            Self::Conv { .. } => "conv",
            Self::Relu { .. } => "relu",
            Self::AvgPool { .. } => "avg_pool",
            Self::NearestUpsample { .. } => "nearest_upsample",
            Self::MultilinearUpsample { .. } => "multilinear_upsample",
            Self::BatchNorm { .. } => "batch_normalization",
            Self::Concat { .. } => "concat",
            Self::Dense { .. } => "dense",
            Self::Unsupported { kind } => kind,
        }
    }

    /// The tensor this operation reads as its primary input, if any.
    ///
    /// Use counting and release timing are driven by primary inputs only;
    /// auxiliary references (activation operands, concat members, weight
    /// parameters) follow their own lifetime rules.
    pub fn primary_input(&self) -> Option<&str> {
        match self {
            Self::Conv { input, .. }
            | Self::AvgPool { input, .. }
            | Self::NearestUpsample { input, .. }
            | Self::MultilinearUpsample { input, .. }
            | Self::BatchNorm { input, .. }
            | Self::Dense { input, .. } => Some(input),
            _ => None,
        }
    }

    /// Every tensor name this operation references.
    fn referenced_tensors(&self) -> Vec<&str> {
        match self {
            Self::Variable { output, .. } => vec![output],
            Self::Conv {
                input,
                filter,
                bias,
                output,
                ..
            }
            | Self::Dense {
                input,
                filter,
                bias,
                output,
            } => vec![input, filter, bias, output],
            Self::Relu { x, y } => vec![x, y],
            Self::AvgPool { input, output, .. }
            | Self::NearestUpsample { input, output, .. }
            | Self::MultilinearUpsample { input, output, .. } => {
                vec![input, output]
            }
            Self::BatchNorm {
                input,
                output,
                mean,
                variance,
                offset,
                scale,
                ..
            } => vec![input, output, mean, variance, offset, scale],
            Self::Concat { values, value, .. } => {
                let mut refs: Vec<&str> = values.iter().map(String::as_str).collect();
                refs.push(value);
                refs
            }
            Self::Unsupported { .. } => vec![],
        }
    }
}

/// A complete, immutable graph description.
#[derive(Clone, Debug)]
pub struct Graph {
    /// Network name, from which all emitted type and function names derive.
    pub name: String,
    /// Tensor declarations keyed by name.
    pub tensors: BTreeMap<String, TensorDecl>,
    /// Graph input tensor names.
    pub inputs: Vec<String>,
    /// Graph output tensor names.
    pub outputs: Vec<String>,
    /// Operations in topological order.
    pub operations: Vec<Operation>,
}

impl Graph {
    /// Deserializes and validates a graph description document.
    pub fn from_json_str(text: &str) -> Result<Self, GraphError> {
        let raw: RawGraph = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    /// `true` if `name` is a graph input.
    pub fn is_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|n| n == name)
    }

    /// `true` if `name` is a graph output.
    pub fn is_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|n| n == name)
    }

    /// Looks up a tensor declaration.
    pub fn tensor(&self, name: &str) -> Option<&TensorDecl> {
        self.tensors.get(name)
    }

    fn from_raw(raw: RawGraph) -> Result<Self, GraphError> {
        let mut operations = Vec::with_capacity(raw.operations.len());
        for op in &raw.operations {
            operations.push(convert_operation(op)?);
        }
        let graph = Graph {
            name: raw.name,
            tensors: raw.tensors,
            inputs: raw.inputs,
            outputs: raw.outputs,
            operations,
        };
        graph.check_references()?;
        Ok(graph)
    }

    fn check_references(&self) -> Result<(), GraphError> {
        for name in self.inputs.iter().chain(self.outputs.iter()) {
            if !self.tensors.contains_key(name) {
                return Err(GraphError::UnknownTensor {
                    op: "graph".into(),
                    name: name.clone(),
                });
            }
        }
        for op in &self.operations {
            for name in op.referenced_tensors() {
                if !self.tensors.contains_key(name) {
                    return Err(GraphError::UnknownTensor {
                        op: op.kind_name().to_owned(),
                        name: name.to_owned(),
                    });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawGraph {
    name: String,
    #[serde(default)]
    tensors: BTreeMap<String, TensorDecl>,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    operations: Vec<RawOperation>,
}

/// One operation record as it appears on the wire.
#[derive(Debug, Deserialize)]
struct RawOperation {
    kind: String,
    #[serde(default)]
    inputs: BTreeMap<String, Value>,
    #[serde(default)]
    outputs: BTreeMap<String, String>,
    #[serde(default)]
    attribs: BTreeMap<String, Value>,
}

impl RawOperation {
    fn missing(&self, field: &str) -> GraphError {
        GraphError::MissingField {
            op: self.kind.clone(),
            field: field.to_owned(),
        }
    }

    fn malformed(&self, field: &str) -> GraphError {
        GraphError::BadField {
            op: self.kind.clone(),
            field: field.to_owned(),
        }
    }

    fn input(&self, name: &str) -> Result<String, GraphError> {
        match self.inputs.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(self.malformed(name)),
            None => Err(self.missing(name)),
        }
    }

    fn input_list(&self, name: &str) -> Result<Vec<String>, GraphError> {
        let list = self
            .inputs
            .get(name)
            .ok_or_else(|| self.missing(name))?
            .as_array()
            .ok_or_else(|| self.malformed(name))?;
        list.iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| self.malformed(name))
            })
            .collect()
    }

    fn output(&self, name: &str) -> Result<String, GraphError> {
        self.outputs
            .get(name)
            .cloned()
            .ok_or_else(|| self.missing(name))
    }

    fn attr_string(&self, name: &str) -> Result<String, GraphError> {
        match self.attribs.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(self.malformed(name)),
            None => Err(self.missing(name)),
        }
    }

    fn attr_f64(&self, name: &str) -> Result<f64, GraphError> {
        self.attribs
            .get(name)
            .ok_or_else(|| self.missing(name))?
            .as_f64()
            .ok_or_else(|| self.malformed(name))
    }

    fn attr_usize(&self, name: &str) -> Result<usize, GraphError> {
        let n = self
            .attribs
            .get(name)
            .ok_or_else(|| self.missing(name))?
            .as_u64()
            .ok_or_else(|| self.malformed(name))?;
        Ok(n as usize)
    }

    /// A two-element unsigned attribute such as `stride` or `factor`.
    fn attr_pair(&self, name: &str) -> Result<[usize; 2], GraphError> {
        match self.attribs.get(name) {
            Some(value) => self.parse_pair(name, value),
            None => Err(self.missing(name)),
        }
    }

    /// Like [`attr_pair`](Self::attr_pair) but absent means `default`.
    fn attr_pair_or(
        &self,
        name: &str,
        default: [usize; 2],
    ) -> Result<[usize; 2], GraphError> {
        match self.attribs.get(name) {
            Some(value) => self.parse_pair(name, value),
            None => Ok(default),
        }
    }

    fn parse_pair(&self, name: &str, value: &Value) -> Result<[usize; 2], GraphError> {
        let list = value.as_array().ok_or_else(|| self.malformed(name))?;
        if list.len() != 2 {
            return Err(self.malformed(name));
        }
        let mut out = [0usize; 2];
        for (slot, v) in out.iter_mut().zip(list) {
            *slot = v.as_u64().ok_or_else(|| self.malformed(name))? as usize;
        }
        Ok(out)
    }

    /// Per-dimension padding pairs: `[[top, bottom], [left, right]]`.
    /// Absent means no padding.
    fn attr_padding(&self) -> Result<[[usize; 2]; 2], GraphError> {
        let value = match self.attribs.get("padding") {
            Some(v) => v,
            None => return Ok([[0, 0], [0, 0]]),
        };
        let list = value.as_array().ok_or_else(|| self.malformed("padding"))?;
        if list.len() != 2 {
            return Err(self.malformed("padding"));
        }
        let mut out = [[0usize; 2]; 2];
        for (slot, v) in out.iter_mut().zip(list) {
            *slot = self.parse_pair("padding", v)?;
        }
        Ok(out)
    }
}

fn convert_operation(raw: &RawOperation) -> Result<Operation, GraphError> {
    Ok(match raw.kind.as_str() {
        "variable" => Operation::Variable {
            label: raw.attr_string("label")?,
            output: raw.output("output")?,
        },
        "conv" => Operation::Conv {
            input: raw.input("input")?,
            filter: raw.input("filter")?,
            bias: raw.input("bias")?,
            output: raw.output("output")?,
            stride: raw.attr_pair_or("stride", [1, 1])?,
            padding: raw.attr_padding()?,
        },
        "relu" => Operation::Relu {
            x: raw.input("x")?,
            y: raw.output("y")?,
        },
        "avg_pool" => Operation::AvgPool {
            input: raw.input("input")?,
            output: raw.output("output")?,
            size: raw.attr_pair_or("size", [2, 2])?,
            stride: raw.attr_pair_or("stride", [2, 2])?,
        },
        "nearest_upsample" => Operation::NearestUpsample {
            input: raw.input("input")?,
            output: raw.output("output")?,
            factor: raw.attr_pair("factor")?,
        },
        "multilinear_upsample" => Operation::MultilinearUpsample {
            input: raw.input("input")?,
            output: raw.output("output")?,
            factor: raw.attr_pair("factor")?,
        },
        "batch_normalization" => Operation::BatchNorm {
            input: raw.input("input")?,
            output: raw.output("output")?,
            mean: raw.input("mean")?,
            variance: raw.input("variance")?,
            offset: raw.input("offset")?,
            scale: raw.input("scale")?,
            epsilon: raw.attr_f64("epsilon")?,
        },
        "concat" => Operation::Concat {
            values: raw.input_list("values")?,
            value: raw.output("value")?,
            axis: raw.attr_usize("axis")?,
        },
        "linear" | "dense" => Operation::Dense {
            input: raw.input("input")?,
            filter: raw.input("filter")?,
            bias: raw.input("bias")?,
            output: raw.output("output")?,
        },
        other => Operation::Unsupported {
            kind: other.to_owned(),
        },
    })
}
