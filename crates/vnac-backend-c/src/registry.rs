//! Tensor registry: storage regions, element types, and precision.
//!
//! Region and type are assigned once per tensor name and cached, so that
//! recomputation is a no-op once a tensor has been declared. The registry
//! also tracks two explicit, disjoint populations: materialized tensors
//! (which own an allocation) and views (which alias a parent and must
//! never be allocated or released on their own).

use std::collections::{BTreeMap, BTreeSet};

use vnac_graph::{ElementType, Graph};
use vnac_weights::{WeightStore, WeightTensor};

use crate::{CodegenOptions, CompileError};

/// Storage region of a tensor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Region {
    /// Graph input, lives in the `<network>_io` struct.
    Input,
    /// Graph output, lives in the `<network>_io` struct.
    Output,
    /// Convolution weight or bias parameter.
    Kernel,
    /// Intermediate work tensor.
    Intermediate,
}

impl Region {
    /// The struct pointer the generated code reaches the tensor through.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Input | Self::Output => "io",
            Self::Kernel | Self::Intermediate => "tensors",
        }
    }

    pub fn is_io(self) -> bool {
        matches!(self, Self::Input | Self::Output)
    }
}

/// Derived facts about one tensor, cached per name.
#[derive(Clone, Debug)]
pub(crate) struct TensorInfo {
    pub region: Region,
    pub element: ElementType,
    pub is_kernel: bool,
    pub rank: usize,
}

impl TensorInfo {
    pub fn prefix(&self) -> &'static str {
        self.region.prefix()
    }
}

pub(crate) struct TensorRegistry<'a> {
    graph: &'a Graph,
    options: &'a CodegenOptions,
    kernels: BTreeSet<String>,
    biases: BTreeSet<String>,
    declared: BTreeSet<String>,
    views: BTreeSet<String>,
    /// Weight-file stem for each tensor produced by a variable operation.
    labels: BTreeMap<String, String>,
    /// Region/type assignments, fixed at first computation.
    assigned: BTreeMap<String, (Region, ElementType)>,
}

impl<'a> TensorRegistry<'a> {
    pub fn new(graph: &'a Graph, options: &'a CodegenOptions) -> Self {
        Self {
            graph,
            options,
            kernels: BTreeSet::new(),
            biases: BTreeSet::new(),
            declared: BTreeSet::new(),
            views: BTreeSet::new(),
            labels: BTreeMap::new(),
            assigned: BTreeMap::new(),
        }
    }

    pub fn mark_kernel(&mut self, name: &str) {
        self.kernels.insert(name.to_owned());
    }

    pub fn mark_bias(&mut self, name: &str) {
        self.biases.insert(name.to_owned());
    }

    /// `true` for convolution filters (biases excluded): only filters get
    /// their spatial footprint normalized to 3×3.
    pub fn is_filter(&self, name: &str) -> bool {
        self.kernels.contains(name)
    }

    pub fn record_label(&mut self, tensor: &str, label: &str) {
        self.labels.insert(tensor.to_owned(), label.to_owned());
    }

    /// The weight-file stem for `tensor`; the tensor name itself when no
    /// variable operation introduced it.
    pub fn label_for<'s>(&'s self, tensor: &'s str) -> &'s str {
        self.labels.get(tensor).map(String::as_str).unwrap_or(tensor)
    }

    /// Region/type precedence: graph input, then graph output, then
    /// kernel/bias membership, then intermediate. The first computation
    /// for a name is cached and reused verbatim afterwards.
    pub fn info(&mut self, name: &str, rank: usize) -> TensorInfo {
        let (region, element) = match self.assigned.get(name) {
            Some(&cached) => cached,
            None => {
                let assigned = if self.graph.is_input(name) {
                    (Region::Input, self.options.input_type)
                } else if self.graph.is_output(name) {
                    (Region::Output, self.options.output_type)
                } else if self.kernels.contains(name) || self.biases.contains(name) {
                    (Region::Kernel, self.options.kernel_type)
                } else {
                    (Region::Intermediate, self.options.intermediate_type)
                };
                self.assigned.insert(name.to_owned(), assigned);
                assigned
            }
        };
        TensorInfo {
            region,
            element,
            is_kernel: region == Region::Kernel,
            rank,
        }
    }

    /// Fixed-point shift for a tensor. Non-kernel tensors use the
    /// configured per-region constant; kernel and bias tensors derive the
    /// shift from the persisted values themselves.
    pub fn fp_shift(
        &mut self,
        name: &str,
        rank: usize,
        weights: &WeightStore,
    ) -> Result<u8, CompileError> {
        let info = self.info(name, rank);
        if !info.element.is_fixed_point() {
            return Ok(0);
        }
        if !info.is_kernel {
            return Ok(match info.region {
                Region::Input => self.options.input_shift,
                Region::Output => self.options.output_shift,
                Region::Kernel | Region::Intermediate => self.options.intermediate_shift,
            });
        }
        let label = self.label_for(name).to_owned();
        let data = weights.load(&label)?;
        Ok(derive_kernel_shift(info.element.bits(), &data))
    }

    /// Marks a name as declared; returns `false` if it already was.
    pub fn declare(&mut self, name: &str) -> bool {
        self.declared.insert(name.to_owned())
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains(name)
    }

    /// Registers a view. Views alias a parent tensor and are never
    /// allocated or released as independent tensors.
    pub fn mark_view(&mut self, name: &str) {
        self.views.insert(name.to_owned());
    }

    pub fn is_view(&self, name: &str) -> bool {
        self.views.contains(name)
    }
}

/// `shift = bits − ceil(log2(max |v|))`, one more bit reserved when any
/// value is negative. All-zero data saturates to the full width.
fn derive_kernel_shift(bits: u32, data: &WeightTensor) -> u8 {
    let max = data.max_abs();
    if max == 0.0 {
        return bits.min(u8::MAX as u32) as u8;
    }
    let mut range = (max.log2()).ceil() as i64;
    if data.has_negative() {
        range += 1;
    }
    (i64::from(bits) - range).clamp(0, i64::from(u8::MAX)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use vnac_graph::Graph;
    use vnac_weights::WeightScalar;

    fn graph() -> Graph {
        Graph::from_json_str(
            r#"{
                "name": "n",
                "inputs": ["in"],
                "outputs": ["out"],
                "tensors": {
                    "in": { "shape": [1, 3, 8, 8] },
                    "out": { "shape": [1, 4, 8, 8] },
                    "w": { "shape": [4, 3, 3, 3] },
                    "t": { "shape": [1, 4, 8, 8] }
                },
                "operations": []
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn region_precedence() {
        let graph = graph();
        let options = CodegenOptions::default();
        let mut registry = TensorRegistry::new(&graph, &options);
        registry.mark_kernel("w");

        assert_eq!(registry.info("in", 4).region, Region::Input);
        assert_eq!(registry.info("out", 4).region, Region::Output);
        assert_eq!(registry.info("w", 4).region, Region::Kernel);
        assert_eq!(registry.info("t", 4).region, Region::Intermediate);

        assert_eq!(registry.info("in", 4).element, options.input_type);
        assert_eq!(registry.info("out", 4).element, options.output_type);
        assert_eq!(registry.info("w", 4).element, options.kernel_type);
        assert_eq!(registry.info("t", 4).element, options.intermediate_type);
    }

    #[test]
    fn io_prefix_differs_from_work_prefix() {
        let graph = graph();
        let options = CodegenOptions::default();
        let mut registry = TensorRegistry::new(&graph, &options);
        assert_eq!(registry.info("in", 4).prefix(), "io");
        assert_eq!(registry.info("t", 4).prefix(), "tensors");
    }

    #[test]
    fn assignment_is_sticky() {
        let graph = graph();
        let options = CodegenOptions::default();
        let mut registry = TensorRegistry::new(&graph, &options);

        // First computation sees no kernel membership.
        assert_eq!(registry.info("t", 4).region, Region::Intermediate);
        // Later membership changes must not reassign the cached entry.
        registry.mark_kernel("t");
        assert_eq!(registry.info("t", 4).region, Region::Intermediate);
    }

    #[test]
    fn declared_and_view_sets_are_explicit() {
        let graph = graph();
        let options = CodegenOptions::default();
        let mut registry = TensorRegistry::new(&graph, &options);

        assert!(registry.declare("t"));
        assert!(!registry.declare("t"));
        assert!(registry.is_declared("t"));

        assert!(!registry.is_view("t"));
        registry.mark_view("t_0");
        assert!(registry.is_view("t_0"));
    }

    fn shift_of(bits: u32, values: Vec<f32>) -> u8 {
        derive_kernel_shift(
            bits,
            &WeightTensor {
                dims: vec![values.len()],
                scalar: WeightScalar::F32,
                values,
            },
        )
    }

    #[test]
    fn kernel_shift_follows_value_range() {
        // max 0.9 → ceil(log2) = 0 → 16 bits of fraction.
        assert_eq!(shift_of(16, vec![0.5, 0.9]), 16);
        // max 3.0 → ceil(log2) = 2 → 14 bits.
        assert_eq!(shift_of(16, vec![1.5, 3.0]), 14);
        // Negative values reserve one more bit.
        assert_eq!(shift_of(16, vec![-1.5, 3.0]), 13);
        // Sub-unit ranges gain fraction bits: max 0.25 → ceil(log2) = -2.
        assert_eq!(shift_of(8, vec![0.25, 0.125]), 10);
    }

    #[test]
    fn kernel_shift_of_all_zero_data() {
        assert_eq!(shift_of(16, vec![0.0, 0.0]), 16);
    }
}
