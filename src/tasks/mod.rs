//! Tasks: named units of device work.
//!
//! A map task holds an ordered list of kernel-body statements and the
//! variables they reference; statements accumulate across chained map
//! requests. A scan task carries a fixed [`ScanConfig`] instead.
//!
//! Every mutation appends an [`AuditEntry`] to the task's log and emits
//! it as a `tracing` event.

pub mod queue;
pub mod scan;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::kir::lower::KernelLowering;
use crate::kir::ElementType;
use crate::parsing::{Expression, PARAMETER};

pub use queue::TaskQueue;
pub use scan::{ScanConfig, ScanStyle};

static TASK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of tasks constructed so far in this process.
pub fn task_count() -> u64 {
    TASK_COUNT.load(Ordering::SeqCst)
}

// ─── Statements ────────────────────────────────────────────────────

/// One kernel-body line: `target = value`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub target: String,
    pub value: String,
}

impl Statement {
    pub fn new(target: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            value: value.into(),
        }
    }

    /// Assign a translated expression back to the parameter variable.
    pub fn assign(expr: &Expression) -> Self {
        Self::new(PARAMETER, expr.to_string())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.target, self.value)
    }
}

// ─── Task kinds ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// The bare kind; never constructible.
    Abstract,
    Map,
    Scan(ScanConfig),
}

impl TaskKind {
    pub fn tag(&self) -> &'static str {
        match self {
            TaskKind::Abstract => "task",
            TaskKind::Map => "map",
            TaskKind::Scan(_) => "scan",
        }
    }
}

/// Borrowed view of what a task contributes to a kernel.
#[derive(Debug)]
pub enum KernelFragment<'a> {
    Statements {
        variables: &'a [String],
        statements: &'a [Statement],
    },
    Scan(&'a ScanConfig),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuditEntry {
    Created(String),
    VariablesIntroduced(Vec<String>),
    StatementAdded(String),
    StatementsAdded(Vec<String>),
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEntry::Created(name) => write!(f, "Created Task: {:?}.", name),
            AuditEntry::VariablesIntroduced(vars) => {
                write!(f, "Introduced variable(s): {:?}.", vars)
            }
            AuditEntry::StatementAdded(stmt) => write!(f, "Added statement: {:?}.", stmt),
            AuditEntry::StatementsAdded(stmts) => write!(f, "Added statement(s): {:?}.", stmts),
        }
    }
}

// ─── Task ──────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Task {
    id: u64,
    kind: TaskKind,
    input_variable: String,
    statements: Vec<Statement>,
    required_variables: Vec<String>,
    audit: Vec<AuditEntry>,
}

impl Task {
    /// Construct a task of a concrete kind. The abstract kind is rejected.
    pub fn new(kind: TaskKind) -> Result<Task> {
        if kind == TaskKind::Abstract {
            return Err(Error::InvalidConstruction(
                "the abstract task kind cannot be instantiated; use map or scan".to_string(),
            ));
        }
        Ok(Task::construct(kind))
    }

    pub fn map() -> Task {
        Task::construct(TaskKind::Map)
    }

    pub fn scan(config: ScanConfig) -> Task {
        Task::construct(TaskKind::Scan(config))
    }

    fn construct(kind: TaskKind) -> Task {
        let id = TASK_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
        let mut task = Task {
            id,
            kind,
            input_variable: PARAMETER.to_string(),
            statements: Vec::new(),
            required_variables: Vec::new(),
            audit: Vec::new(),
        };
        let name = task.name();
        task.record(AuditEntry::Created(name));
        if task.kind == TaskKind::Map {
            task.add_variables([PARAMETER]);
        }
        task
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn is_map(&self) -> bool {
        self.kind == TaskKind::Map
    }

    /// Kind tag plus creation counter, e.g. `map7`. Used as the kernel
    /// entry point name.
    pub fn name(&self) -> String {
        format!("{}{}", self.kind.tag(), self.id)
    }

    pub fn input_variable(&self) -> &str {
        &self.input_variable
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn required_variables(&self) -> &[String] {
        &self.required_variables
    }

    pub fn audit(&self) -> &[AuditEntry] {
        &self.audit
    }

    /// Add variables, suppressing duplicates. Only names not seen before
    /// are reported to the audit log.
    pub fn add_variables<I, S>(&mut self, variables: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let before = self.required_variables.clone();
        for var in variables {
            let var = var.into();
            if !self.required_variables.contains(&var) {
                self.required_variables.push(var);
            }
        }
        let introduced: Vec<String> = self
            .required_variables
            .iter()
            .filter(|v| !before.contains(v))
            .cloned()
            .collect();
        if !introduced.is_empty() {
            self.record(AuditEntry::VariablesIntroduced(introduced));
        }
        self
    }

    pub fn add_statement(&mut self, statement: Statement) -> &mut Self {
        let text = statement.to_string();
        self.statements.push(statement);
        self.record(AuditEntry::StatementAdded(text));
        self
    }

    pub fn add_statements<I>(&mut self, statements: I) -> &mut Self
    where
        I: IntoIterator<Item = Statement>,
    {
        let mut added = Vec::new();
        for statement in statements {
            added.push(statement.to_string());
            self.statements.push(statement);
        }
        self.record(AuditEntry::StatementsAdded(added));
        self
    }

    /// `type name;` per required variable, in order of first introduction.
    pub fn variable_declarations(&self, lowering: &dyn KernelLowering, ty: ElementType) -> String {
        lowering.declarations(ty, &self.required_variables)
    }

    /// Index binding and element load that open every fused kernel body.
    pub fn setup_statements(&self, lowering: &dyn KernelLowering, ty: ElementType) -> String {
        lowering.prologue(ty, &self.input_variable)
    }

    pub fn enqueue_into(self, queue: &mut TaskQueue) {
        queue.push(self);
    }

    pub fn kernel_fragment(&self) -> KernelFragment<'_> {
        match &self.kind {
            TaskKind::Scan(config) => KernelFragment::Scan(config),
            TaskKind::Map | TaskKind::Abstract => KernelFragment::Statements {
                variables: &self.required_variables,
                statements: &self.statements,
            },
        }
    }

    fn record(&mut self, entry: AuditEntry) {
        tracing::debug!(task = %self.name(), "{}", entry);
        self.audit.push(entry);
    }
}
