//! WGSL lowering for the wgpu bridge.
//!
//! WGSL has no launch-time local size and no `__local` kernel arguments,
//! so the work-group size and the shared array length are baked into
//! each scan module. Scalar kernel arguments are read from a uniform
//! `params` block, in the order they are passed to `launch`.
//!
//! Integer division by zero is defined in WGSL and yields the dividend,
//! so a fused map such as `100 / x` stores 100 where `x == 0` instead of
//! faulting as it does on the host bridge.

use super::KernelLowering;
use crate::kir::{shared_elements, ElementType, FusedKernel, FUSED_WORKGROUP_SIZE};
use crate::tasks::{ScanConfig, ScanStyle, Statement};

const SCAN_TEMPLATE: &str = include_str!("templates/scan.wgsl");
const COMBINE_TEMPLATE: &str = include_str!("templates/combine.wgsl");

const INDENT: &str = "\n  ";

pub struct WgslLowering;

impl WgslLowering {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WgslLowering {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelLowering for WgslLowering {
    fn target_name(&self) -> &str {
        "wgsl"
    }

    fn declarations(&self, ty: ElementType, variables: &[String]) -> String {
        variables
            .iter()
            .map(|v| format!("var {}: {};", v, ty.wgsl_name()))
            .collect::<Vec<_>>()
            .join(INDENT)
    }

    fn prologue(&self, _ty: ElementType, input_variable: &str) -> String {
        [
            "let global_id = gid.x;".to_string(),
            "if (global_id >= arrayLength(&data_array)) {".to_string(),
            "  return;".to_string(),
            "}".to_string(),
            format!("{} = data_array[global_id];", input_variable),
        ]
        .join(INDENT)
    }

    fn presence(&self, variable: &str, value: i32) -> Statement {
        Statement::new(
            variable,
            format!("select(0, 1, ({}) == ({}))", variable, value),
        )
    }

    fn lower_fused(&self, kernel: &FusedKernel) -> String {
        let ty = kernel.element_type;
        let mut out = String::new();
        out.push_str(&format!(
            "@group(0) @binding(0) var<storage, read_write> data_array: array<{}>;\n\n",
            ty.wgsl_name()
        ));
        out.push_str(&format!(
            "@compute @workgroup_size({})\n",
            FUSED_WORKGROUP_SIZE
        ));
        out.push_str(&format!(
            "fn {}(@builtin(global_invocation_id) gid: vec3<u32>) {{\n",
            kernel.entry_point
        ));
        out.push_str(&format!(
            "  {}\n",
            self.declarations(ty, &kernel.variables)
        ));
        out.push_str(&format!(
            "  {}\n",
            self.prologue(ty, &kernel.input_variable)
        ));
        for stmt in &kernel.statements {
            out.push_str(&format!("  {};\n", stmt));
        }
        out.push_str(&format!(
            "  data_array[global_id] = {};\n}}\n",
            kernel.input_variable
        ));
        out
    }

    fn lower_scan(&self, config: &ScanConfig, group_size: u32) -> String {
        let mut source = SCAN_TEMPLATE.to_string();
        if config.style == ScanStyle::Inclusive {
            source.push_str(COMBINE_TEMPLATE);
        }
        let log2 = config.log2_bank_count();
        source
            .replace("{{GROUP_SIZE}}", &group_size.to_string())
            .replace(
                "{{SHARED_SIZE}}",
                &shared_elements(group_size, log2).to_string(),
            )
            .replace("{{BANKS}}", &config.bank_count.to_string())
            .replace("{{LOG2_BANKS}}", &log2.to_string())
            .replace(
                "{{ELIMINATE}}",
                if config.eliminate_bank_conflicts {
                    "true"
                } else {
                    "false"
                },
            )
            .replace("{{IDENTITY}}", &config.operator.identity().to_string())
            .replace("{{TYPE}}", config.element_type.wgsl_name())
            .replace("{{OP}}", config.operator.symbol())
    }
}
