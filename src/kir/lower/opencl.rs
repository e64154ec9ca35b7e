//! OpenCL C lowering: the dialect the host reference bridge executes.
//!
//! Fused kernels take one `__global` buffer, `data_array`, updated in
//! place. The scan family is the template in `templates/scan.cl`; the
//! work-group size comes from the launch, so one source serves every
//! group size.

use super::KernelLowering;
use crate::kir::{ElementType, FusedKernel};
use crate::tasks::{ScanConfig, ScanStyle, Statement};

const SCAN_TEMPLATE: &str = include_str!("templates/scan.cl");
const COMBINE_TEMPLATE: &str = include_str!("templates/combine.cl");

const INDENT: &str = "\n  ";

pub struct OpenClLowering;

impl OpenClLowering {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OpenClLowering {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelLowering for OpenClLowering {
    fn target_name(&self) -> &str {
        "opencl"
    }

    fn declarations(&self, ty: ElementType, variables: &[String]) -> String {
        variables
            .iter()
            .map(|v| format!("{} {};", ty.c_name(), v))
            .collect::<Vec<_>>()
            .join(INDENT)
    }

    fn prologue(&self, _ty: ElementType, input_variable: &str) -> String {
        format!(
            "int global_id = get_global_id(0);{}{} = data_array[global_id];",
            INDENT, input_variable
        )
    }

    fn presence(&self, variable: &str, value: i32) -> Statement {
        Statement::new(variable, format!("({}) == ({})", variable, value))
    }

    fn lower_fused(&self, kernel: &FusedKernel) -> String {
        let ty = kernel.element_type;
        let mut out = String::new();
        out.push_str(&format!(
            "__kernel void {}(__global {}* data_array) {{\n",
            kernel.entry_point,
            ty.c_name()
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

    fn lower_scan(&self, config: &ScanConfig, _group_size: u32) -> String {
        let mut source = SCAN_TEMPLATE.to_string();
        if config.style == ScanStyle::Inclusive {
            source.push_str(COMBINE_TEMPLATE);
        }
        source
            .replace("{{BANKS}}", &config.bank_count.to_string())
            .replace("{{LOG2_BANKS}}", &config.log2_bank_count().to_string())
            .replace(
                "{{ELIMINATE}}",
                if config.eliminate_bank_conflicts { "1" } else { "0" },
            )
            .replace("{{IDENTITY}}", &config.operator.identity().to_string())
            .replace("{{TYPE}}", config.element_type.c_name())
            .replace("{{OP}}", config.operator.symbol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Features;
    use crate::parsing::BinaryOp;
    use crate::tasks::Task;

    fn fused(statements: &[&str]) -> FusedKernel {
        let mut task = Task::map();
        for s in statements {
            task.add_statement(Statement::new("x", *s));
        }
        FusedKernel::from_tasks(&[task], ElementType::Int).unwrap()
    }

    #[test]
    fn test_lower_fused_layout() {
        let kernel = fused(&["(x) + (1)", "(x) * (2)"]);
        let source = OpenClLowering::new().lower_fused(&kernel);
        let expected = format!(
            "__kernel void {}(__global int* data_array) {{\n  int x;\n  int global_id = get_global_id(0);\n  x = data_array[global_id];\n  x = (x) + (1);\n  x = (x) * (2);\n  data_array[global_id] = x;\n}}\n",
            kernel.entry_point
        );
        assert_eq!(source, expected);
    }

    #[test]
    fn test_presence_statement() {
        let stmt = OpenClLowering::new().presence("x", 2);
        assert_eq!(stmt.to_string(), "x = (x) == (2)");
    }

    #[test]
    fn test_scan_defines_and_operator() {
        let config = ScanConfig::new(ScanStyle::Exclusive, BinaryOp::Mul)
            .with_bank_count(16)
            .unwrap();
        let source = OpenClLowering::new().lower_scan(&config, 128);
        assert!(source.contains("#define MEMORY_BANK_COUNT      (16)"));
        assert!(source.contains("#define LOG2_MEMORY_BANK_COUNT (4)"));
        assert!(source.contains("#define ELIMINATE_CONFLICTS    (0)"));
        assert!(source.contains("#define SCAN_IDENTITY          (1)"));
        assert!(source.contains("shared_data[local_index_b] *= shared_data[local_index_a];"));
        assert!(source.contains("__local int *shared_data"));
        assert!(!source.contains("{{"));
        assert!(!source.contains("CombineInputKernel"));
    }

    #[test]
    fn test_scan_bank_offset_macro_is_verbatim() {
        let on = Features {
            avoid_bank_conflicts: true,
        };
        let config =
            ScanConfig::new(ScanStyle::Exclusive, BinaryOp::Add).eliminate_bank_conflicts(true, &on);
        let source = OpenClLowering::new().lower_scan(&config, 128);
        assert!(source.contains("#define ELIMINATE_CONFLICTS    (1)"));
        assert!(source.contains(
            "#define MEMORY_BANK_OFFSET(index) ((index) >> LOG2_MEMORY_BANK_COUNT + (index) >> (2*LOG2_MEMORY_BANK_COUNT))"
        ));
    }

    #[test]
    fn test_scan_barriers_between_sweep_levels() {
        let config = ScanConfig::new(ScanStyle::Exclusive, BinaryOp::Add);
        let source = OpenClLowering::new().lower_scan(&config, 128);

        let body = |name: &str| {
            let start = source.find(name).unwrap();
            let end = source[start..].find("\n}\n").unwrap();
            source[start..start + end].to_string()
        };
        for phase in ["uint BuildPartialSum", "void ScanRootToLeaves"] {
            let text = body(phase);
            let loop_at = text.find("for (").unwrap();
            let barrier_at = text.find("barrier(CLK_LOCAL_MEM_FENCE);").unwrap();
            assert!(barrier_at > loop_at, "{phase}: barrier must be inside the level loop");
        }
        assert!(body("void LoadLocalFromGlobalNonPowerOfTwo").contains("barrier("));
        assert!(body("void StoreLocalToGlobal(").contains("barrier("));
        assert!(body("__kernel void UniformAddKernel").contains("barrier("));
    }

    #[test]
    fn test_inclusive_adds_combine_pass() {
        let config = ScanConfig::new(ScanStyle::Inclusive, BinaryOp::Add);
        let source = OpenClLowering::new().lower_scan(&config, 128);
        assert!(source.contains("__kernel void CombineInputKernel("));
        assert!(source.contains("output_data[global_id] += input_data[global_id];"));
    }
}
