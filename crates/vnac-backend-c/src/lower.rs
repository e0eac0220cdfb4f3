//! Single-pass operator lowering.
//!
//! One linear scan over the operation sequence drives everything: tensors
//! are declared lazily at first reference (weights and concat outputs get
//! dedicated pre-passes), the allocator places and reclaims storage as
//! use counts run out, and each operation appends its text to the output
//! sections. The fusion rules rewrite high-level constructs into the
//! target's only compute primitives: the 3×3 convolution, the factor-2
//! upsample, and zero-copy views.

use std::collections::BTreeMap;

use vnac_alloc::{Allocator, MemoryReport};
use vnac_graph::{ElementType, Graph, Operation, TensorDecl};
use vnac_weights::{WeightScalar, WeightStore, WeightTensor};

use crate::registry::TensorRegistry;
use crate::sections::CodeSections;
use crate::{
    CodegenOptions, CodegenOutput, CompileError, Diagnostic, OutputFile,
};

/// Name of the shared constant kernel backing average pooling.
const POOL_KERNEL: &str = "avg_pool_kernel";

pub(crate) struct Lowering<'a> {
    graph: &'a Graph,
    weights: &'a WeightStore,
    registry: TensorRegistry<'a>,
    allocator: Box<dyn Allocator>,
    sections: CodeSections,
    use_counts: BTreeMap<String, usize>,
    diagnostics: Vec<Diagnostic>,
    pool_kernel_declared: bool,
}

impl<'a> Lowering<'a> {
    pub fn new(
        graph: &'a Graph,
        weights: &'a WeightStore,
        options: &'a CodegenOptions,
    ) -> Self {
        Self {
            graph,
            weights,
            registry: TensorRegistry::new(graph, options),
            allocator: options.allocator.create(options.zone_size),
            sections: CodeSections::new(
                &graph.name,
                graph.operations.len(),
                options.verbose_trace,
            ),
            use_counts: BTreeMap::new(),
            diagnostics: Vec::new(),
            pool_kernel_declared: false,
        }
    }

    pub fn run(mut self) -> Result<CodegenOutput, CompileError> {
        let graph = self.graph;
        self.count_uses();

        // Concat outputs first: member views must bind into a parent that
        // already owns its allocation.
        for op in &graph.operations {
            if let Operation::Concat {
                values,
                value,
                axis,
            } = op
            {
                self.lower_concat(values, value, *axis)?;
            }
        }

        // Weight tensors are declared and filled before any compute op.
        for op in &graph.operations {
            if let Operation::Variable { label, output } = op {
                self.declare_and_fill(output, label)?;
            }
        }

        for (index, op) in graph.operations.iter().enumerate() {
            self.lower_operation(index, op)?;
            self.release_spent_input(op)?;
        }

        let report = MemoryReport::from_allocator(self.allocator.as_ref());
        let name = graph.name.clone();
        let (source, header) = self.sections.finish();
        Ok(CodegenOutput {
            source: OutputFile {
                name: format!("{name}.c"),
                content: source,
            },
            header: OutputFile {
                name: format!("{name}.h"),
                content: header,
            },
            diagnostics: self.diagnostics,
            report,
        })
    }

    // -----------------------------------------------------------------
    // Pre-scan
    // -----------------------------------------------------------------

    /// Counts remaining consumers per tensor and records kernel, bias, and
    /// weight-label membership before any declaration happens.
    fn count_uses(&mut self) {
        let graph = self.graph;
        for op in &graph.operations {
            if let Some(input) = op.primary_input() {
                *self.use_counts.entry(input.to_owned()).or_insert(0) += 1;
            }
            match op {
                Operation::Conv { filter, bias, .. }
                | Operation::Dense { filter, bias, .. } => {
                    self.registry.mark_kernel(filter);
                    self.registry.mark_bias(bias);
                }
                Operation::Variable { label, output } => {
                    self.registry.record_label(output, label);
                }
                _ => {}
            }
        }
        // Graph outputs carry one permanent extra use: their storage must
        // survive the whole run.
        for output in &graph.outputs {
            *self.use_counts.entry(output.clone()).or_insert(0) += 1;
        }
    }

    /// Decrements the primary input's use count after its consumer ran and
    /// reclaims the storage when the count hits zero. Views are aliases
    /// and are never handed to the allocator.
    fn release_spent_input(&mut self, op: &Operation) -> Result<(), CompileError> {
        let Some(input) = op.primary_input() else {
            return Ok(());
        };
        if let Some(count) = self.use_counts.get_mut(input) {
            *count -= 1;
            if *count == 0 && !self.registry.is_view(input) {
                log::debug!("last consumer of '{input}' ran, releasing");
                self.allocator.release(input)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Tensor declaration
    // -----------------------------------------------------------------

    fn tensor_decl(&self, name: &str) -> Result<&'a TensorDecl, CompileError> {
        self.graph.tensor(name).ok_or_else(|| {
            CompileError::Validation(format!(
                "tensor '{name}' has no shape declaration"
            ))
        })
    }

    /// Struct reference to a graph tensor (`io->x` or `tensors->x`).
    fn tensor_ref(&mut self, name: &str) -> Result<String, CompileError> {
        let rank = self.tensor_decl(name)?.rank();
        Ok(format!("{}->{name}", self.registry.info(name, rank).prefix()))
    }

    /// Declares a graph tensor and places it in the memory zone. Filters
    /// declare and allocate the normalized (Co, Ci, 3, 3) footprint, since
    /// that is what the fill writes.
    fn declare_tensor(&mut self, name: &str) -> Result<(), CompileError> {
        if self.registry.is_declared(name) {
            return Ok(());
        }
        let decl = self.tensor_decl(name)?;
        let shape = if self.registry.is_filter(name) && decl.rank() == 4 {
            vec![decl.shape[0], decl.shape[1], 3, 3]
        } else {
            decl.shape.clone()
        };
        self.declare_shaped(name, &shape, false)
    }

    /// Declares a graph tensor as a view: a struct member and parameter
    /// block, but no allocation of its own.
    fn declare_concat_member(&mut self, name: &str) -> Result<(), CompileError> {
        if self.registry.is_declared(name) {
            return Ok(());
        }
        let shape = self.tensor_decl(name)?.shape.clone();
        self.declare_shaped(name, &shape, true)
    }

    fn declare_shaped(
        &mut self,
        name: &str,
        shape: &[usize],
        is_view: bool,
    ) -> Result<(), CompileError> {
        if self.registry.is_declared(name) {
            return Ok(());
        }
        let info = self.registry.info(name, shape.len());
        let prefix = info.prefix();
        let element = info.element;
        let shift = self.registry.fp_shift(name, shape.len(), self.weights)?;

        let member = format!("    VNA_tensor_t {name};\n");
        if info.region.is_io() {
            self.sections.io_member(&member);
        } else {
            self.sections.tensors_member(&member);
        }
        self.sections.allocate_push(&format!(
            "\n    {prefix}->{name} = {}",
            tensor_params_text(element, shift, shape)
        ));

        if is_view {
            self.registry.mark_view(name);
        } else {
            let placement = self.allocator.allocate(name, shape, element)?;
            self.sections.allocate_push(&format!(
                "\n    VNA_allocate_t {name}_allocate = {{\n\
                 \x20       .memory_zone_id = {},\n\
                 \x20       .offset = {},\n\
                 \x20       }};\n\
                 \x20   if ((error = vna_allocate_tensor(&{prefix}->{name}, \
                 &{name}_allocate)) != VNA_Success)\n\
                 \x20       return error;\n\n",
                placement.zone, placement.offset,
            ));
        }
        self.registry.declare(name);
        Ok(())
    }

    /// Declares a channel slice `<parent>_<n>` aliasing one channel of its
    /// parent. Idempotent; slices join the view set and are never released.
    fn declare_slice(
        &mut self,
        parent: &str,
        dim: usize,
        slice: usize,
    ) -> Result<(), CompileError> {
        let slice_name = format!("{parent}_{slice}");
        if self.registry.is_declared(&slice_name) {
            return Ok(());
        }
        let decl = self.tensor_decl(parent)?;
        let parent_info = self.registry.info(parent, decl.rank());
        let parent_prefix = parent_info.prefix();
        let element = parent_info.element;
        let shift = self.registry.fp_shift(parent, decl.rank(), self.weights)?;
        let shape: Vec<usize> = decl
            .shape
            .iter()
            .enumerate()
            .map(|(i, &d)| if i == dim { 1 } else { d })
            .collect();

        self.sections
            .tensors_member(&format!("    VNA_tensor_t {slice_name};\n"));
        self.sections.allocate_push(&format!(
            "\n    tensors->{slice_name} = {}",
            tensor_params_text(element, shift, &shape)
        ));
        self.sections.allocate_push(&view_binding_text(
            &slice_name,
            &format!("tensors->{slice_name}"),
            &format!("{parent_prefix}->{parent}"),
            Some((dim, slice)),
        ));
        self.registry.mark_view(&slice_name);
        self.registry.declare(&slice_name);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Weights
    // -----------------------------------------------------------------

    /// Declares a weight tensor and emits its fill. Filters smaller than
    /// 3×3 are zero-embedded into the normalized window here.
    fn declare_and_fill(&mut self, name: &str, label: &str) -> Result<(), CompileError> {
        let data = self.weights.load(label)?;
        self.declare_tensor(name)?;

        let values_text = if self.registry.is_filter(name) {
            match normalize_filter(&data) {
                Some(embedded) => format_array(data.scalar, &embedded),
                None => format_array(data.scalar, &data.values),
            }
        } else {
            format_array(data.scalar, &data.values)
        };
        let prefix = self.registry.info(name, data.dims.len()).prefix();
        self.fill_constant(
            name,
            prefix,
            data.scalar.c_scalar(),
            data.scalar.target_name(),
            &values_text,
        );
        Ok(())
    }

    fn fill_constant(
        &mut self,
        name: &str,
        prefix: &str,
        c_scalar: &str,
        source_type: &str,
        values_text: &str,
    ) {
        self.sections.fill_push(&format!(
            "\n    {c_scalar} data_{name}[] = {{{values_text}}};\n\
             \x20   if ((error = vna_copy_to_tensor(data_{name}, {source_type}, \
             0, &{prefix}->{name})) != VNA_Success)\n\
             \x20       return error;\n"
        ));
    }

    /// The constant 2×2-average kernel, declared and filled exactly once.
    fn ensure_pool_kernel(&mut self) -> Result<(), CompileError> {
        if self.pool_kernel_declared {
            return Ok(());
        }
        self.declare_shaped(POOL_KERNEL, &[1, 1, 3, 3], false)?;
        self.fill_constant(
            POOL_KERNEL,
            "tensors",
            "float",
            "VNA_Float32",
            "0.0, 0.0, 0.0, 0.0, 0.25, 0.25, 0.0, 0.25, 0.25",
        );
        self.pool_kernel_declared = true;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Operation dispatch
    // -----------------------------------------------------------------

    fn lower_operation(
        &mut self,
        index: usize,
        op: &'a Operation,
    ) -> Result<(), CompileError> {
        match op {
            // Handled by the dedicated pre-passes.
            Operation::Variable { .. } | Operation::Concat { .. } => Ok(()),
            // Folded into the producing convolution; emits nothing here.
            Operation::Relu { .. } => Ok(()),
            Operation::Conv {
                input,
                filter,
                bias,
                output,
                stride,
                padding,
            } => self.lower_conv(index, input, filter, bias, output, *stride, *padding),
            Operation::AvgPool {
                input,
                output,
                size,
                stride,
            } => self.lower_avg_pool(index, input, output, *size, *stride),
            Operation::NearestUpsample {
                input,
                output,
                factor,
            } => self.lower_upsample(index, input, output, *factor, true),
            Operation::MultilinearUpsample {
                input,
                output,
                factor,
            } => self.lower_upsample(index, input, output, *factor, false),
            Operation::BatchNorm {
                input,
                output,
                mean,
                variance,
                offset,
                scale,
                epsilon,
            } => self.lower_batch_norm(
                index, input, output, mean, variance, offset, scale, *epsilon,
            ),
            Operation::Dense { output, .. } => Err(CompileError::Validation(
                format!(
                    "dense layer producing '{output}' cannot be lowered to \
                     the target primitive set"
                ),
            )),
            Operation::Unsupported { kind } => Err(CompileError::Validation(
                format!("operation kind '{kind}' is not supported"),
            )),
        }
    }

    // -----------------------------------------------------------------
    // Convolution (and the ReLU folding rule)
    // -----------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn lower_conv(
        &mut self,
        index: usize,
        input: &str,
        filter: &str,
        bias: &str,
        output: &'a str,
        stride: [usize; 2],
        mut padding: [[usize; 2]; 2],
    ) -> Result<(), CompileError> {
        let graph = self.graph;
        let op_name = format!("op_{index}");

        // Fold a trailing activation into the primitive when exactly one
        // ReLU consumes this convolution's output. The intermediate tensor
        // disappears: the primitive writes the activation's output.
        let mut relu_outputs = graph.operations.iter().filter_map(|op| match op {
            Operation::Relu { x, y } if x == output => Some(y.as_str()),
            _ => None,
        });
        let (with_relu, real_output) = match (relu_outputs.next(), relu_outputs.next())
        {
            (Some(y), None) => (true, y),
            _ => (false, output),
        };

        let filter_decl = self.tensor_decl(filter)?;
        if filter_decl.rank() != 4 {
            return Err(CompileError::Validation(format!(
                "convolution filter '{filter}' must have 4 dimensions"
            )));
        }
        let (kh, kw) = (filter_decl.shape[2], filter_decl.shape[3]);

        // The primitive window is always 3×3. Smaller filters are
        // zero-embedded at fill time; the declared padding compensates on
        // the edges the embedding shifted away from.
        if kh == 1 || kh == 2 {
            padding[0][1] += 1;
        }
        if kw == 1 || kw == 2 {
            padding[1][1] += 1;
        }
        if kh == 1 {
            padding[0][0] += 1;
        }
        if kw == 1 {
            padding[1][0] += 1;
        }
        if padding.iter().flatten().any(|&p| p > 2) {
            let message = format!(
                "{op_name}: compensated padding {padding:?} exceeds the \
                 supported maximum of 2"
            );
            log::warn!("{message}");
            self.diagnostics.push(Diagnostic::warning(message));
        }

        self.declare_tensor(input)?;
        self.declare_tensor(real_output)?;

        self.sections
            .ops_member(&format!("    VNA_conv2d_t {op_name}_params;\n"));
        self.sections.set_ops_push(&conv_params_text(
            &format!("{op_name}_params"),
            padding,
            stride,
            with_relu,
            filter,
            Some(bias),
        ));

        let in_ref = self.tensor_ref(input)?;
        let out_ref = self.tensor_ref(real_output)?;
        let verbose = self.sections.verbose();
        let fragment = self.sections.process_fragment(index);
        fragment.push_str("    /* Convolution */\n");
        if verbose {
            fragment.push_str(&format!("    printf(\"{op_name}\\n\");\n"));
        }
        fragment.push_str(&conv_call(&format!("{op_name}_params"), &in_ref, &out_ref));
        Ok(())
    }

    // -----------------------------------------------------------------
    // Average pooling
    // -----------------------------------------------------------------

    /// The target has no pooling primitive. A 2×2/stride-2 average pool is
    /// a convolution with the shared quarter-weight kernel; because the
    /// convolution mixes channels, each channel runs through its own
    /// slice-view pair.
    fn lower_avg_pool(
        &mut self,
        index: usize,
        input: &str,
        output: &str,
        size: [usize; 2],
        stride: [usize; 2],
    ) -> Result<(), CompileError> {
        if size != [2, 2] || stride != [2, 2] {
            return Err(CompileError::Validation(format!(
                "average pooling with window {size:?} and stride {stride:?} \
                 is not supported (2x2 with stride 2 only)"
            )));
        }
        let op_name = format!("op_{index}");
        self.declare_tensor(input)?;
        self.declare_tensor(output)?;

        let in_decl = self.tensor_decl(input)?;
        let rank = in_decl.rank();
        let channels = in_decl.channels();
        let chan_dim = in_decl.channel_dim();

        if rank > 2 {
            for chan in 0..channels {
                self.declare_slice(input, chan_dim, chan)?;
                self.declare_slice(output, chan_dim, chan)?;
            }
        }
        self.ensure_pool_kernel()?;

        self.sections
            .ops_member(&format!("    VNA_conv2d_t {op_name}_params;\n"));
        self.sections.set_ops_push(&conv_params_text(
            &format!("{op_name}_params"),
            [[1, 1], [1, 1]],
            [2, 2],
            false,
            POOL_KERNEL,
            None,
        ));

        let in_ref = self.tensor_ref(input)?;
        let out_ref = self.tensor_ref(output)?;
        let verbose = self.sections.verbose();
        let fragment = self.sections.process_fragment(index);
        fragment.push_str("    /* Avg pooling */\n");
        if verbose {
            fragment.push_str(&format!("    printf(\"{op_name}\\n\");\n"));
        }
        if rank > 2 {
            for chan in 0..channels {
                fragment.push('\n');
                fragment.push_str(&conv_call(
                    &format!("{op_name}_params"),
                    &format!("tensors->{input}_{chan}"),
                    &format!("tensors->{output}_{chan}"),
                ));
            }
        } else {
            fragment.push_str(&conv_call(
                &format!("{op_name}_params"),
                &in_ref,
                &out_ref,
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Upsampling
    // -----------------------------------------------------------------

    fn lower_upsample(
        &mut self,
        index: usize,
        input: &str,
        output: &str,
        factor: [usize; 2],
        nearest: bool,
    ) -> Result<(), CompileError> {
        if factor != [2, 2] {
            return Err(CompileError::Validation(format!(
                "upsampling factor {factor:?} is not supported (only (2, 2))"
            )));
        }
        if !nearest {
            let message = format!(
                "op_{index}: multilinear upsampling lowered as nearest-neighbour"
            );
            log::info!("{message}");
            self.diagnostics.push(Diagnostic::info(message));
        }
        let op_name = format!("op_{index}");
        self.declare_tensor(input)?;
        self.declare_tensor(output)?;

        self.sections
            .ops_member(&format!("    VNA_upsample_t {op_name}_params;\n"));
        self.sections
            .set_ops_push(&format!("\n    ops_params->{op_name}_params.factor = 2;\n"));

        let in_ref = self.tensor_ref(input)?;
        let out_ref = self.tensor_ref(output)?;
        let verbose = self.sections.verbose();
        let fragment = self.sections.process_fragment(index);
        fragment.push_str("    /* Nearest upsampling */\n");
        if verbose {
            fragment.push_str(&format!("    printf(\"{op_name}\\n\");\n"));
        }
        fragment.push_str(&format!(
            "    if((error = vna_upsample(&ops_params->{op_name}_params, \
             &{in_ref}, &{out_ref})) != VNA_Success)\n        return error;\n"
        ));
        Ok(())
    }

    // -----------------------------------------------------------------
    // Batch normalization
    // -----------------------------------------------------------------

    /// The target has no normalization primitive. The affine transform is
    /// reproduced exactly by one depthwise 3×3 convolution per channel:
    /// kernel all zero except center = a, bias = b, with
    /// a = γ/sqrt(σ²+ε) and b = β − a·μ computed from the persisted
    /// parameter values.
    #[allow(clippy::too_many_arguments)]
    fn lower_batch_norm(
        &mut self,
        index: usize,
        input: &str,
        output: &str,
        mean: &str,
        variance: &str,
        offset: &str,
        scale: &str,
        epsilon: f64,
    ) -> Result<(), CompileError> {
        let op_name = format!("op_{index}");
        self.declare_tensor(input)?;
        self.declare_tensor(output)?;

        let mean_data = self.weights.load(self.registry.label_for(mean))?;
        let variance_data = self.weights.load(self.registry.label_for(variance))?;
        let offset_data = self.weights.load(self.registry.label_for(offset))?;
        let scale_data = self.weights.load(self.registry.label_for(scale))?;

        let channels = scale_data.values.len();
        if mean_data.values.len() != channels
            || variance_data.values.len() != channels
            || offset_data.values.len() != channels
        {
            return Err(CompileError::Validation(format!(
                "batch normalization parameters of '{input}' disagree in length"
            )));
        }

        let mut folded = Vec::with_capacity(channels);
        for i in 0..channels {
            let a = f64::from(scale_data.values[i])
                / (f64::from(variance_data.values[i]) + epsilon).sqrt();
            let b = f64::from(offset_data.values[i]) - a * f64::from(mean_data.values[i]);
            folded.push((a, b));
        }

        for (i, (a, b)) in folded.iter().enumerate() {
            let kernel_name = format!("{op_name}_kernel_{i}");
            self.declare_shaped(&kernel_name, &[1, 1, 3, 3], false)?;
            self.fill_constant(
                &kernel_name,
                "tensors",
                "float",
                "VNA_Float32",
                &format!("0, 0, 0, 0, {a:.10}, 0, 0, 0, 0"),
            );

            let bias_name = format!("{op_name}_bias_{i}");
            self.declare_shaped(&bias_name, &[1], false)?;
            self.fill_constant(
                &bias_name,
                "tensors",
                "float",
                "VNA_Float32",
                &format!("{b:.10}"),
            );
        }

        let in_decl = self.tensor_decl(input)?;
        let sliced = in_decl.rank() > 2;
        let chan_dim = in_decl.channel_dim();
        if sliced {
            for chan in 0..in_decl.channels() {
                self.declare_slice(input, chan_dim, chan)?;
                self.declare_slice(output, chan_dim, chan)?;
            }
        }

        let in_ref = self.tensor_ref(input)?;
        let out_ref = self.tensor_ref(output)?;
        self.sections
            .process_fragment(index)
            .push_str("    /* Batch normalization */\n");
        for i in 0..channels {
            let param = format!("{op_name}_{i}_params");
            self.sections
                .ops_member(&format!("    VNA_conv2d_t {param};\n"));
            self.sections.set_ops_push(&conv_params_text(
                &param,
                [[1, 1], [1, 1]],
                [1, 1],
                false,
                &format!("{op_name}_kernel_{i}"),
                Some(&format!("{op_name}_bias_{i}")),
            ));

            let (chan_in, chan_out) = if sliced {
                (
                    format!("tensors->{input}_{i}"),
                    format!("tensors->{output}_{i}"),
                )
            } else {
                (in_ref.clone(), out_ref.clone())
            };
            let verbose = self.sections.verbose();
            let fragment = self.sections.process_fragment(index);
            if verbose {
                fragment.push_str(&format!("    printf(\"{op_name}_{i}\\n\");\n"));
            }
            fragment.push('\n');
            fragment.push_str(&conv_call(&param, &chan_in, &chan_out));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Concatenation
    // -----------------------------------------------------------------

    /// Two-way channel concatenation is zero-copy: both members become
    /// views into disjoint channel ranges of the already-allocated output.
    fn lower_concat(
        &mut self,
        values: &[String],
        value: &str,
        axis: usize,
    ) -> Result<(), CompileError> {
        if values.len() != 2 {
            return Err(CompileError::Validation(format!(
                "concatenation of {} inputs is not supported (exactly 2)",
                values.len()
            )));
        }
        let out_decl = self.tensor_decl(value)?;
        let chan_dim = out_decl.channel_dim();
        if axis != chan_dim {
            return Err(CompileError::Validation(format!(
                "concatenation along axis {axis} is not supported \
                 (channel axis only)"
            )));
        }
        let out_rank = out_decl.rank();

        self.declare_tensor(value)?;
        self.declare_concat_member(&values[0])?;
        self.declare_concat_member(&values[1])?;

        let first_channels = self.tensor_decl(&values[0])?.channels();
        let out_ref = format!(
            "{}->{value}",
            self.registry.info(value, out_rank).prefix()
        );
        let first_ref = self.tensor_ref(&values[0])?;
        let second_ref = self.tensor_ref(&values[1])?;

        // The first member aliases the output's leading channels; the
        // second starts where the first one's channel count ends.
        self.sections.allocate_push(&view_binding_text(
            &values[0],
            &first_ref,
            &out_ref,
            None,
        ));
        self.sections.allocate_push(&view_binding_text(
            &values[1],
            &second_ref,
            &out_ref,
            Some((chan_dim, first_channels)),
        ));
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Emission helpers
// ---------------------------------------------------------------------

fn tensor_params_text(element: ElementType, shift: u8, shape: &[usize]) -> String {
    let mut dims = String::new();
    for d in shape {
        dims.push_str(&format!("{d}, "));
    }
    for _ in shape.len()..4 {
        dims.push_str("0, ");
    }
    format!(
        "(VNA_tensor_t){{\n\
         \x20       .device_id = device_id,\n\
         \x20       .nb_dims = {},\n\
         \x20       .type = {},\n\
         \x20       .dims = {{{dims}}},\n\
         \x20       .fp_shift = {shift},\n\
         \x20       .data = NULL,\n\
         \x20       }};\n",
        shape.len(),
        element.target_name(),
    )
}

fn conv_params_text(
    param: &str,
    padding: [[usize; 2]; 2],
    stride: [usize; 2],
    with_relu: bool,
    kernel: &str,
    bias: Option<&str>,
) -> String {
    let bias_ref = match bias {
        Some(b) => format!("&tensors->{b}"),
        None => "NULL".to_owned(),
    };
    format!(
        "\n    ops_params->{param} = (VNA_conv2d_t){{\n\
         \x20       .padding = {{ {{ {}, {} }}, {{ {}, {} }} }},\n\
         \x20       .stride = {{ {}, {} }},\n\
         \x20       .dilation = {{ 1, 1 }},\n\
         \x20       .b_ReLU = {with_relu},\n\
         \x20       .kernel = &tensors->{kernel},\n\
         \x20       .bias = {bias_ref},\n\
         \x20       }};\n",
        padding[0][0], padding[0][1], padding[1][0], padding[1][1],
        stride[0], stride[1],
    )
}

fn conv_call(param: &str, input_ref: &str, output_ref: &str) -> String {
    format!(
        "    if((error = vna_conv2d(&ops_params->{param}, &{input_ref}, \
         &{output_ref})) != VNA_Success)\n        return error;\n"
    )
}

fn view_binding_text(
    view: &str,
    view_ref: &str,
    parent_ref: &str,
    offset: Option<(usize, usize)>,
) -> String {
    let mut text = format!(
        "\n    VNA_view_t view_params_{view};\n\
         \x20   memset(&view_params_{view}, 0, sizeof(VNA_view_t));\n"
    );
    if let Some((dim, value)) = offset {
        text.push_str(&format!(
            "    view_params_{view}.offset[{dim}] = {value};\n"
        ));
    }
    text.push_str(&format!(
        "    if((error = vna_view(&view_params_{view}, &{parent_ref}, \
         &{view_ref})) != VNA_Success)\n        return error;\n\n"
    ));
    text
}

/// Formats a constant array body, sixteen values per line.
fn format_array(scalar: WeightScalar, values: &[f32]) -> String {
    let mut out = String::new();
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
            if i % 16 == 0 {
                out.push('\n');
            }
        }
        if scalar.is_float() {
            out.push_str(&format!("{v:.7}f"));
        } else {
            out.push_str(&format!("{}", *v as i64));
        }
    }
    out
}

/// Zero-embeds a small filter into the 3×3 window the primitive expects.
///
/// 1×1 lands in the center; 2×2 in the upper left; 2×1 and 1×2 keep the
/// center row/column with the extra tap toward the upper/left edge.
/// Returns `None` when the filter is already 3×3 (or has an unexpected
/// spatial size, which is left untouched).
fn normalize_filter(data: &WeightTensor) -> Option<Vec<f32>> {
    let d = &data.dims;
    if d.len() != 4 {
        return None;
    }
    let (co, ci, kh, kw) = (d[0], d[1], d[2], d[3]);
    let (row0, col0) = match (kh, kw) {
        (1, 1) => (1, 1),
        (2, 1) => (0, 1),
        (1, 2) => (1, 0),
        (2, 2) => (0, 0),
        _ => return None,
    };
    let mut out = vec![0.0f32; co * ci * 9];
    for o in 0..co {
        for i in 0..ci {
            for r in 0..kh {
                for c in 0..kw {
                    let src = ((o * ci + i) * kh + r) * kw + c;
                    let dst = ((o * ci + i) * 3 + (row0 + r)) * 3 + (col0 + c);
                    out[dst] = data.values[src];
                }
            }
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_arrays_wrap_at_sixteen() {
        let values: Vec<f32> = (0..18).map(|i| i as f32).collect();
        let text = format_array(WeightScalar::F32, &values);
        assert!(text.starts_with("0.0000000f,1.0000000f"));
        assert_eq!(text.matches('\n').count(), 1);
    }

    #[test]
    fn integer_arrays_use_plain_literals() {
        let text = format_array(WeightScalar::I16, &[-3.0, 0.0, 17.0]);
        assert_eq!(text, "-3,0,17");
    }

    #[test]
    fn one_by_one_filter_lands_in_center() {
        let data = WeightTensor {
            dims: vec![1, 1, 1, 1],
            scalar: WeightScalar::F32,
            values: vec![5.0],
        };
        let out = normalize_filter(&data).unwrap();
        assert_eq!(out.len(), 9);
        assert_eq!(out[4], 5.0);
        assert_eq!(out.iter().filter(|v| **v != 0.0).count(), 1);
    }

    #[test]
    fn two_by_two_filter_lands_upper_left() {
        let data = WeightTensor {
            dims: vec![1, 1, 2, 2],
            scalar: WeightScalar::F32,
            values: vec![1.0, 2.0, 3.0, 4.0],
        };
        let out = normalize_filter(&data).unwrap();
        // rows 0..2, cols 0..2 of the 3×3 window
        assert_eq!(out[0], 1.0);
        assert_eq!(out[1], 2.0);
        assert_eq!(out[3], 3.0);
        assert_eq!(out[4], 4.0);
        assert_eq!(out[2] + out[5] + out[6] + out[7] + out[8], 0.0);
    }

    #[test]
    fn one_by_two_filter_keeps_center_row() {
        let data = WeightTensor {
            dims: vec![1, 1, 1, 2],
            scalar: WeightScalar::F32,
            values: vec![7.0, 8.0],
        };
        let out = normalize_filter(&data).unwrap();
        // row 1, cols 0..2
        assert_eq!(out[3], 7.0);
        assert_eq!(out[4], 8.0);
        assert_eq!(out.iter().filter(|v| **v != 0.0).count(), 2);
    }

    #[test]
    fn two_by_one_filter_keeps_center_column() {
        let data = WeightTensor {
            dims: vec![1, 1, 2, 1],
            scalar: WeightScalar::F32,
            values: vec![7.0, 8.0],
        };
        let out = normalize_filter(&data).unwrap();
        assert_eq!(out[1], 7.0);
        assert_eq!(out[4], 8.0);
    }

    #[test]
    fn full_filters_pass_through() {
        let data = WeightTensor {
            dims: vec![1, 1, 3, 3],
            scalar: WeightScalar::F32,
            values: (0..9).map(|i| i as f32).collect(),
        };
        assert!(normalize_filter(&data).is_none());
    }

    #[test]
    fn multi_channel_embedding_offsets() {
        // 2 output × 2 input channels of 1×1 filters.
        let data = WeightTensor {
            dims: vec![2, 2, 1, 1],
            scalar: WeightScalar::F32,
            values: vec![1.0, 2.0, 3.0, 4.0],
        };
        let out = normalize_filter(&data).unwrap();
        assert_eq!(out.len(), 36);
        for (plane, expected) in [(0, 1.0), (1, 2.0), (2, 3.0), (3, 4.0)] {
            assert_eq!(out[plane * 9 + 4], expected);
        }
    }
}
