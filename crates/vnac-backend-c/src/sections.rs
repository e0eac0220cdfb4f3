//! Append-only output sections and final text assembly.
//!
//! The emitted source is built from eight ordered buffers: three struct
//! layouts and five function bodies. Sections only ever grow; the final
//! order is fixed at assembly time and fragments are never interleaved or
//! reordered after insertion. The `process` body is keyed by operation
//! index so that primitive invocations come out in original topological
//! order no matter when their text was produced.

/// The section buffers for one compiled graph.
#[derive(Debug)]
pub(crate) struct CodeSections {
    network: String,
    tensors_struct: String,
    ops_struct: String,
    io_struct: String,
    initialize: String,
    allocate: String,
    fill: String,
    set_ops: String,
    process_fragments: Vec<Option<String>>,
    sig_initialize: String,
    sig_allocate: String,
    sig_fill: String,
    sig_set_ops: String,
    sig_process: String,
    verbose: bool,
}

impl CodeSections {
    pub fn new(network: &str, op_count: usize, verbose: bool) -> Self {
        let sig_initialize = format!("int initialize_{network}(uint32_t *device_id)");
        let sig_allocate = format!(
            "int allocate_{network}_tensors({network}_tensors *tensors, \
             {network}_io *io, uint32_t device_id)"
        );
        let sig_fill = format!("int fill_{network}_tensors({network}_tensors *tensors)");
        let sig_set_ops = format!(
            "int set_{network}_ops({network}_ops *ops_params, \
             {network}_tensors *tensors)"
        );
        let sig_process = format!(
            "int process_{network}_tensors({network}_tensors *tensors, \
             const {network}_ops *ops_params, {network}_io *io)"
        );

        let initialize = format!(
            "{sig_initialize}{{\n\
             \x20   VNA_error error;\n\
             \x20   *device_id = vna_get_default_device_id(&error);\n\
             \n\
             \x20   if(error != VNA_Success)\n\
             \x20       return error;\n\
             \n\
             \x20   error = vna_initialize_device(*device_id);\n\
             \x20   if(error != VNA_Success)\n\
             \x20       return error;\n"
        );

        let opener = |sig: &str, trace: &str| {
            let mut body = format!("{sig}{{\n    VNA_error error;\n");
            if verbose {
                body.push_str(&format!("    printf(\"{trace}\\n\");\n"));
            }
            body
        };

        Self {
            tensors_struct: format!("typedef struct {network}_tensors{{\n"),
            ops_struct: format!("typedef struct {network}_ops{{\n"),
            io_struct: format!("typedef struct {network}_io{{\n"),
            initialize,
            allocate: opener(&sig_allocate, "Allocating"),
            fill: opener(&sig_fill, "Filling"),
            set_ops: opener(&sig_set_ops, "Defining operations"),
            process_fragments: vec![None; op_count],
            network: network.to_owned(),
            sig_initialize,
            sig_allocate,
            sig_fill,
            sig_set_ops,
            sig_process,
            verbose,
        }
    }

    /// Appends a member line to the `<network>_tensors` struct.
    pub fn tensors_member(&mut self, text: &str) {
        self.tensors_struct.push_str(text);
    }

    /// Appends a member line to the `<network>_ops` struct.
    pub fn ops_member(&mut self, text: &str) {
        self.ops_struct.push_str(text);
    }

    /// Appends a member line to the `<network>_io` struct.
    pub fn io_member(&mut self, text: &str) {
        self.io_struct.push_str(text);
    }

    pub fn allocate_push(&mut self, text: &str) {
        self.allocate.push_str(text);
    }

    pub fn fill_push(&mut self, text: &str) {
        self.fill.push_str(text);
    }

    pub fn set_ops_push(&mut self, text: &str) {
        self.set_ops.push_str(text);
    }

    /// The process-body fragment for the operation at `index`.
    pub fn process_fragment(&mut self, index: usize) -> &mut String {
        self.process_fragments[index].get_or_insert_with(String::new)
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Closes every section and assembles `(source, header)`.
    pub fn finish(self) -> (String, String) {
        let network = &self.network;

        let mut process = format!("{}{{\n    VNA_error error;\n", self.sig_process);
        if self.verbose {
            process.push_str("    printf(\"Processing\\n\");\n");
        }
        let fragments: Vec<String> = self
            .process_fragments
            .into_iter()
            .flatten()
            .collect();
        process.push_str(&fragments.join("\n"));
        process.push_str("    return 0;\n}\n");

        let close = "    return 0;\n}\n";
        let initialize = format!("{}{close}", self.initialize);
        let allocate = format!("{}{close}", self.allocate);
        let fill = format!("{}{close}", self.fill);
        let set_ops = format!("{}{close}", self.set_ops);

        let source = format!(
            "#include \"{network}.h\"\n#include <stdio.h>\n\n\
             {initialize}\n{allocate}\n{fill}\n{set_ops}\n{process}\n"
        );

        let tensors_struct = format!("{}}} {network}_tensors;\n", self.tensors_struct);
        let ops_struct = format!("{}}} {network}_ops;\n", self.ops_struct);
        let io_struct = format!("{}}} {network}_io;\n", self.io_struct);
        let prototypes = format!(
            "{};\n\n{};\n\n{};\n\n{};\n\n{};\n\n",
            self.sig_initialize,
            self.sig_allocate,
            self.sig_fill,
            self.sig_set_ops,
            self.sig_process,
        );

        let guard = format!("{}_H", network.to_uppercase());
        let header = format!(
            "#ifndef {guard}\n#define {guard}\n\
             #include <vna/vna.h>\n#include <string.h>\n#include <vna/utils.h>\n\
             {tensors_struct}\n{ops_struct}\n{io_struct}\n{prototypes}\n\
             #endif //{guard}\n"
        );

        (source, header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembly_order_is_fixed() {
        let mut sections = CodeSections::new("net", 2, false);
        sections.tensors_member("    VNA_tensor_t a;\n");
        sections.io_member("    VNA_tensor_t input;\n");
        sections.ops_member("    VNA_conv2d_t op_0_params;\n");
        sections.allocate_push("    /* alloc */\n");
        sections.fill_push("    /* fill */\n");
        sections.set_ops_push("    /* set */\n");
        sections.process_fragment(1).push_str("    /* second */\n");
        sections.process_fragment(0).push_str("    /* first */\n");

        let (source, header) = sections.finish();

        // Function order: initialize, allocate, fill, set_ops, process.
        let init_at = source.find("int initialize_net").unwrap();
        let alloc_at = source.find("int allocate_net_tensors").unwrap();
        let fill_at = source.find("int fill_net_tensors").unwrap();
        let set_at = source.find("int set_net_ops").unwrap();
        let process_at = source.find("int process_net_tensors").unwrap();
        assert!(init_at < alloc_at);
        assert!(alloc_at < fill_at);
        assert!(fill_at < set_at);
        assert!(set_at < process_at);

        // Fragment order follows operation index, not insertion order.
        let first_at = source.find("/* first */").unwrap();
        let second_at = source.find("/* second */").unwrap();
        assert!(first_at < second_at);

        // Struct order in the header: tensors, ops, io, prototypes.
        let tensors_at = header.find("typedef struct net_tensors{").unwrap();
        let ops_at = header.find("typedef struct net_ops{").unwrap();
        let io_at = header.find("typedef struct net_io{").unwrap();
        let proto_at = header.find("int initialize_net(uint32_t *device_id);").unwrap();
        assert!(tensors_at < ops_at);
        assert!(ops_at < io_at);
        assert!(io_at < proto_at);

        assert!(header.starts_with("#ifndef NET_H\n#define NET_H\n"));
        assert!(header.trim_end().ends_with("#endif //NET_H"));
    }

    #[test]
    fn verbose_mode_adds_stage_traces() {
        let sections = CodeSections::new("net", 0, true);
        let (source, _) = sections.finish();
        assert!(source.contains("printf(\"Allocating\\n\");"));
        assert!(source.contains("printf(\"Filling\\n\");"));
        assert!(source.contains("printf(\"Defining operations\\n\");"));
        assert!(source.contains("printf(\"Processing\\n\");"));

        let quiet = CodeSections::new("net", 0, false);
        let (source, _) = quiet.finish();
        assert!(!source.contains("printf"));
    }

    #[test]
    fn skipped_fragments_leave_no_gap() {
        let mut sections = CodeSections::new("net", 3, false);
        sections.process_fragment(2).push_str("    only();\n");
        let (source, _) = sections.finish();
        assert!(source.contains("    only();\n    return 0;\n"));
    }
}
