//! C code emitter targeting the VNA accelerator API.
//!
//! [`compile`] lowers a shape-annotated graph into one C source and one
//! header implementing the five-stage calling convention of the target
//! (`initialize`, `allocate`, `fill`, `set_ops`, `process`), together with
//! a static memory plan. Compilation is a single deterministic pass:
//! identical graph, weights, and options produce byte-identical text and
//! an identical plan. There is no partial output; any error aborts the
//! run.

mod lower;
mod registry;
mod sections;

use std::fmt;

use vnac_alloc::{AllocError, AllocatorKind, MemoryReport};
use vnac_graph::{ElementType, Graph};
use vnac_weights::{WeightError, WeightStore};

/// The full configuration surface of one compilation run.
#[derive(Clone, Debug)]
pub struct CodegenOptions {
    /// Element type of graph inputs.
    pub input_type: ElementType,
    /// Fixed-point shift for graph inputs.
    pub input_shift: u8,
    /// Element type of graph outputs.
    pub output_type: ElementType,
    /// Fixed-point shift for graph outputs.
    pub output_shift: u8,
    /// Element type of intermediate tensors.
    pub intermediate_type: ElementType,
    /// Fixed-point shift for intermediate tensors.
    pub intermediate_shift: u8,
    /// Element type of kernel and bias tensors. Their fixed-point shift is
    /// derived from the persisted values, never configured.
    pub kernel_type: ElementType,
    /// Total size of the target memory zone in bytes.
    pub zone_size: u64,
    /// Allocation strategy.
    pub allocator: AllocatorKind,
    /// Emit a trace statement before each primitive invocation.
    pub verbose_trace: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            input_type: ElementType::UFixed8,
            input_shift: 4,
            output_type: ElementType::SFixed16,
            output_shift: 4,
            intermediate_type: ElementType::SFixed16,
            intermediate_shift: 4,
            kernel_type: ElementType::SFixed16,
            zone_size: 0,
            allocator: AllocatorKind::Sequential,
            verbose_trace: false,
        }
    }
}

/// A produced text artifact.
#[derive(Clone, Debug)]
pub struct OutputFile {
    /// Suggested filename (`<network>.c`, `<network>.h`).
    pub name: String,
    /// The file content.
    pub content: String,
}

impl fmt::Display for OutputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Severity of a non-fatal diagnostic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiagnosticLevel {
    /// Correctness-relevant; the output may not behave as intended.
    Warning,
    /// A documented limitation or noteworthy lowering decision.
    Info,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warning => "Warning",
            Self::Info => "Info",
        })
    }
}

/// A non-fatal diagnostic surfaced alongside the output.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
}

impl Diagnostic {
    pub(crate) fn warning(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            message: message.into(),
        }
    }

    pub(crate) fn info(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Info,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.level, self.message)
    }
}

/// Everything one successful compilation produces.
#[derive(Clone, Debug)]
pub struct CodegenOutput {
    /// The generated C source.
    pub source: OutputFile,
    /// The generated header.
    pub header: OutputFile,
    /// Non-fatal diagnostics, in emission order.
    pub diagnostics: Vec<Diagnostic>,
    /// Memory usage of the computed plan.
    pub report: MemoryReport,
}

/// Errors that abort a compilation run.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The graph uses a construct the target cannot express.
    #[error("unsupported construct: {0}")]
    Validation(String),

    /// The memory plan could not be completed.
    #[error(transparent)]
    Allocation(#[from] AllocError),

    /// A weight file was missing, malformed, or unrecognized.
    #[error(transparent)]
    WeightData(#[from] WeightError),
}

/// Compiles `graph` into C source and header text plus a memory plan.
///
/// Weight and constant tensors are read from `weights` on demand, both for
/// fill emission and for kernel fixed-point precision analysis.
pub fn compile(
    graph: &Graph,
    weights: &WeightStore,
    options: &CodegenOptions,
) -> Result<CodegenOutput, CompileError> {
    lower::Lowering::new(graph, weights, options).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_target_conventions() {
        let options = CodegenOptions::default();
        assert_eq!(options.input_type, ElementType::UFixed8);
        assert_eq!(options.output_type, ElementType::SFixed16);
        assert_eq!(options.kernel_type, ElementType::SFixed16);
        assert_eq!(options.input_shift, 4);
        assert_eq!(options.allocator, AllocatorKind::Sequential);
        assert!(!options.verbose_trace);
    }

    #[test]
    fn diagnostic_display() {
        let warning = Diagnostic::warning("padding exceeds 2");
        assert_eq!(format!("{warning}"), "[Warning] padding exceeds 2");
        let info = Diagnostic::info("lowered as nearest");
        assert_eq!(format!("{info}"), "[Info] lowered as nearest");
    }
}
