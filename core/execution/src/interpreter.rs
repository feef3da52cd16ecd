//! Tree-walking evaluator with gas charged per node.
//!
//! Gas costs depend only on the AST shape and operand sizes, never on wall
//! time, so the same script and input always consume the same gas. The
//! wall-clock deadline and the host cancellation flag are checked
//! cooperatively at loop iterations and function calls; a deadline breach
//! surfaces as resource exhaustion with the gas counter at the cut-off
//! point, a cancellation as [`ExecutionError::Cancelled`].

use crate::ast::*;
use crate::bindings::HostBindings;
use crate::gas::{GasMeter, GasOp, GasSchedule};
use crate::types::ExecutionError;
use crate::value::{FunctionValue, Value};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const MAX_CALL_DEPTH: usize = 64;

/// Externally imposed bounds on one run.
#[derive(Debug, Clone)]
pub struct RunBudget {
    pub gas_limit: u64,
    /// Cumulative allocation bound in bytes.
    pub memory_limit: u64,
    pub deadline: Instant,
    /// Set by the host to stop the run at its next checkpoint.
    pub cancel: Arc<AtomicBool>,
}

impl RunBudget {
    pub fn new(gas_limit: u64, deadline: Instant) -> Self {
        Self {
            gas_limit,
            memory_limit: u64::MAX,
            deadline,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Execute a parsed program: run the top-level statements, then invoke
/// `main(input)`. Returns the JSON form of main's return value and the gas
/// consumed.
pub fn run_program(
    program: &[Stmt],
    input: &serde_json::Value,
    secrets: &HashMap<String, String>,
    bindings: &dyn HostBindings,
    schedule: GasSchedule,
    budget: RunBudget,
    code_len: usize,
) -> Result<(serde_json::Value, u64), ExecutionError> {
    let mut interp = Interpreter {
        meter: GasMeter::new(schedule, budget.gas_limit).with_memory_limit(budget.memory_limit),
        bindings,
        secrets,
        globals: HashMap::new(),
        frames: Vec::new(),
        call_stack: Vec::new(),
        deadline: budget.deadline,
        cancel: budget.cancel,
    };
    interp.meter.charge(GasOp::ExecutionBase(code_len))?;

    for stmt in program {
        match interp.exec(stmt)? {
            Flow::Normal => {}
            Flow::Return(_) => break,
            Flow::Break | Flow::Continue => {
                return Err(interp.runtime_error("break/continue outside of a loop"))
            }
        }
    }

    let main = match interp.globals.get("main") {
        Some(Value::Function(f)) => Rc::clone(f),
        _ => return Err(interp.runtime_error("main is not defined")),
    };
    let result = interp.call_function(&main, vec![Value::from_json(input)])?;
    Ok((result.to_json(), interp.meter.used()))
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Interpreter<'a> {
    meter: GasMeter,
    bindings: &'a dyn HostBindings,
    secrets: &'a HashMap<String, String>,
    globals: HashMap<String, Value>,
    /// One entry per active call; each holds the call's block scopes.
    frames: Vec<Vec<HashMap<String, Value>>>,
    call_stack: Vec<String>,
    deadline: Instant,
    cancel: Arc<AtomicBool>,
}

impl Interpreter<'_> {
    fn runtime_error(&self, message: impl Into<String>) -> ExecutionError {
        let mut stack: Vec<String> = self.call_stack.clone();
        stack.reverse();
        ExecutionError::Runtime {
            message: message.into(),
            stack,
        }
    }

    fn check_interrupt(&self) -> Result<(), ExecutionError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(ExecutionError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            Err(ExecutionError::ResourceExhausted {
                gas_used: self.meter.used(),
            })
        } else {
            Ok(())
        }
    }

    // Variable resolution: innermost block of the current frame outwards,
    // then globals.

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(blocks) = self.frames.last() {
            for block in blocks.iter().rev() {
                if let Some(v) = block.get(name) {
                    return Some(v.clone());
                }
            }
        }
        self.globals.get(name).cloned()
    }

    fn declare(&mut self, name: &str, value: Value) {
        match self.frames.last_mut() {
            Some(blocks) => {
                blocks
                    .last_mut()
                    .expect("frame always has at least one block")
                    .insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    fn assign_var(&mut self, name: &str, value: Value) {
        if let Some(blocks) = self.frames.last_mut() {
            for block in blocks.iter_mut().rev() {
                if let Some(slot) = block.get_mut(name) {
                    *slot = value;
                    return;
                }
            }
        }
        if let Some(slot) = self.globals.get_mut(name) {
            *slot = value;
            return;
        }
        // Assignment to an undeclared name declares it in the current scope.
        self.declare(name, value);
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ExecutionError> {
        match stmt {
            Stmt::Declare { name, init } => {
                let value = match init {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                self.declare(name, value);
                Ok(Flow::Normal)
            }
            Stmt::Function { name, params, body } => {
                let func = Value::Function(Rc::new(FunctionValue {
                    name: name.clone(),
                    params: params.clone(),
                    body: body.clone(),
                }));
                // Function declarations always land in globals so scripts
                // can call helpers declared after their call site.
                self.globals.insert(name.clone(), func);
                Ok(Flow::Normal)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.meter.charge(GasOp::Comparison)?;
                if self.eval(cond)?.is_truthy() {
                    self.exec_block(then_branch)
                } else if let Some(else_branch) = else_branch {
                    self.exec_block(else_branch)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { cond, body } => {
                loop {
                    self.meter.charge(GasOp::LoopIteration)?;
                    self.check_interrupt()?;
                    if !self.eval(cond)?.is_truthy() {
                        break;
                    }
                    match self.exec_block(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                cond,
                update,
                body,
            } => {
                self.push_block();
                let result = (|| -> Result<Flow, ExecutionError> {
                    if let Some(init) = init {
                        self.exec(init)?;
                    }
                    loop {
                        self.meter.charge(GasOp::LoopIteration)?;
                        self.check_interrupt()?;
                        if let Some(cond) = cond {
                            if !self.eval(cond)?.is_truthy() {
                                break;
                            }
                        }
                        match self.exec_block(body)? {
                            Flow::Normal | Flow::Continue => {}
                            Flow::Break => break,
                            flow @ Flow::Return(_) => return Ok(flow),
                        }
                        if let Some(update) = update {
                            self.eval(update)?;
                        }
                    }
                    Ok(Flow::Normal)
                })();
                self.pop_block();
                result
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn push_block(&mut self) {
        if let Some(blocks) = self.frames.last_mut() {
            blocks.push(HashMap::new());
        }
    }

    fn pop_block(&mut self) {
        if let Some(blocks) = self.frames.last_mut() {
            if blocks.len() > 1 {
                blocks.pop();
            }
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt]) -> Result<Flow, ExecutionError> {
        self.push_block();
        let mut flow = Flow::Normal;
        for stmt in stmts {
            flow = self.exec(stmt)?;
            if !matches!(flow, Flow::Normal) {
                break;
            }
        }
        self.pop_block();
        Ok(flow)
    }

    fn call_function(
        &mut self,
        func: &Rc<FunctionValue>,
        args: Vec<Value>,
    ) -> Result<Value, ExecutionError> {
        self.meter.charge(GasOp::FunctionCall)?;
        self.check_interrupt()?;
        if self.call_stack.len() >= MAX_CALL_DEPTH {
            return Err(self.runtime_error("maximum call depth exceeded"));
        }

        let mut locals = HashMap::new();
        for (i, param) in func.params.iter().enumerate() {
            locals.insert(
                param.clone(),
                args.get(i).cloned().unwrap_or(Value::Null),
            );
        }
        self.frames.push(vec![locals]);
        self.call_stack.push(func.name.clone());

        let mut result = Ok(Value::Null);
        for stmt in &func.body {
            match self.exec(stmt) {
                Ok(Flow::Return(value)) => {
                    result = Ok(value);
                    break;
                }
                Ok(Flow::Break | Flow::Continue) => {
                    result = Err(self.runtime_error("break/continue outside of a loop"));
                    break;
                }
                Ok(Flow::Normal) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.call_stack.pop();
        self.frames.pop();
        result
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ExecutionError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Ident(name) => self
                .lookup(name)
                .ok_or_else(|| self.runtime_error(format!("{name} is not defined"))),
            Expr::Array(items) => {
                self.meter.charge(GasOp::ArrayCreation(items.len()))?;
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::array(values))
            }
            Expr::Object(fields) => {
                self.meter.charge(GasOp::ObjectCreation(fields.len()))?;
                let mut map = BTreeMap::new();
                for (key, value) in fields {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::object(map))
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => {
                        self.meter.charge(GasOp::MathOperation)?;
                        match value {
                            Value::Number(n) => Ok(Value::Number(-n)),
                            other => Err(self.runtime_error(format!(
                                "cannot negate a {}",
                                other.type_name()
                            ))),
                        }
                    }
                    UnaryOp::Not => {
                        self.meter.charge(GasOp::Comparison)?;
                        Ok(Value::Bool(!value.is_truthy()))
                    }
                }
            }
            Expr::Logical { op, lhs, rhs } => {
                self.meter.charge(GasOp::Comparison)?;
                let lhs = self.eval(lhs)?;
                match op {
                    LogicalOp::And => {
                        if lhs.is_truthy() {
                            self.eval(rhs)
                        } else {
                            Ok(lhs)
                        }
                    }
                    LogicalOp::Or => {
                        if lhs.is_truthy() {
                            Ok(lhs)
                        } else {
                            self.eval(rhs)
                        }
                    }
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                self.binary(*op, lhs, rhs)
            }
            Expr::Assign { op, target, value } => {
                let value = self.eval(value)?;
                let value = match op {
                    AssignOp::Assign => value,
                    AssignOp::Add => {
                        let current = self.eval(target)?;
                        self.binary(BinaryOp::Add, current, value)?
                    }
                    AssignOp::Sub => {
                        let current = self.eval(target)?;
                        self.binary(BinaryOp::Sub, current, value)?
                    }
                    AssignOp::Mul => {
                        let current = self.eval(target)?;
                        self.binary(BinaryOp::Mul, current, value)?
                    }
                    AssignOp::Div => {
                        let current = self.eval(target)?;
                        self.binary(BinaryOp::Div, current, value)?
                    }
                };
                self.assign_to(target, value.clone())?;
                Ok(value)
            }
            Expr::IncDec { target, increment } => {
                let current = self.eval(target)?;
                let Value::Number(n) = current else {
                    return Err(self.runtime_error(format!(
                        "cannot increment a {}",
                        current.type_name()
                    )));
                };
                self.meter.charge(GasOp::MathOperation)?;
                let next = if *increment { n + 1.0 } else { n - 1.0 };
                self.assign_to(target, Value::Number(next))?;
                Ok(Value::Number(n))
            }
            Expr::Member { object, property } => {
                self.meter.charge(GasOp::PropertyAccess)?;
                if let Expr::Ident(ns) = object.as_ref() {
                    if self.is_host_namespace(ns) {
                        return Err(self.runtime_error(format!(
                            "{ns}.{property} is not a value; call it as a method"
                        )));
                    }
                }
                let object = self.eval(object)?;
                self.member(&object, property)
            }
            Expr::Index { object, index } => {
                self.meter.charge(GasOp::ArrayAccess)?;
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                self.index(&object, &index)
            }
            Expr::Call { callee, args } => self.eval_call(callee, args),
        }
    }

    fn is_host_namespace(&self, name: &str) -> bool {
        matches!(name, "Math" | "JSON" | "secrets" | "storage" | "crypto")
            && self.lookup(name).is_none()
    }

    fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExecutionError> {
        use BinaryOp::*;
        match op {
            Add => match (&lhs, &rhs) {
                (Value::Number(a), Value::Number(b)) => {
                    self.meter.charge(GasOp::MathOperation)?;
                    Ok(Value::Number(a + b))
                }
                (Value::Str(_), _) | (_, Value::Str(_)) => {
                    let result =
                        format!("{}{}", lhs.to_display_string(), rhs.to_display_string());
                    self.meter.charge(GasOp::StringOperation(result.len()))?;
                    Ok(Value::Str(result))
                }
                _ => Err(self.runtime_error(format!(
                    "cannot add {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                ))),
            },
            Sub | Mul | Div | Rem => {
                self.meter.charge(GasOp::MathOperation)?;
                let (Value::Number(a), Value::Number(b)) = (&lhs, &rhs) else {
                    return Err(self.runtime_error(format!(
                        "arithmetic requires numbers, got {} and {}",
                        lhs.type_name(),
                        rhs.type_name()
                    )));
                };
                let result = match op {
                    Sub => a - b,
                    Mul => a * b,
                    Div => a / b,
                    Rem => a % b,
                    _ => unreachable!(),
                };
                Ok(Value::Number(result))
            }
            Eq => {
                self.meter.charge(GasOp::Comparison)?;
                Ok(Value::Bool(lhs.loose_equals(&rhs)))
            }
            NotEq => {
                self.meter.charge(GasOp::Comparison)?;
                Ok(Value::Bool(!lhs.loose_equals(&rhs)))
            }
            StrictEq => {
                self.meter.charge(GasOp::Comparison)?;
                Ok(Value::Bool(lhs.strict_equals(&rhs)))
            }
            StrictNotEq => {
                self.meter.charge(GasOp::Comparison)?;
                Ok(Value::Bool(!lhs.strict_equals(&rhs)))
            }
            Lt | LtEq | Gt | GtEq => {
                self.meter.charge(GasOp::Comparison)?;
                let ordering = match (&lhs, &rhs) {
                    (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                    (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                    _ => None,
                };
                let Some(ordering) = ordering else {
                    return Err(self.runtime_error(format!(
                        "cannot compare {} and {}",
                        lhs.type_name(),
                        rhs.type_name()
                    )));
                };
                let result = match op {
                    Lt => ordering.is_lt(),
                    LtEq => ordering.is_le(),
                    Gt => ordering.is_gt(),
                    GtEq => ordering.is_ge(),
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
        }
    }

    fn assign_to(&mut self, target: &Expr, value: Value) -> Result<(), ExecutionError> {
        match target {
            Expr::Ident(name) => {
                self.assign_var(name, value);
                Ok(())
            }
            Expr::Member { object, property } => {
                self.meter.charge(GasOp::PropertyAccess)?;
                let object = self.eval(object)?;
                match object {
                    Value::Object(fields) => {
                        fields.borrow_mut().insert(property.clone(), value);
                        Ok(())
                    }
                    other => Err(self.runtime_error(format!(
                        "cannot set property on a {}",
                        other.type_name()
                    ))),
                }
            }
            Expr::Index { object, index } => {
                self.meter.charge(GasOp::ArrayAccess)?;
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                match (&object, &index) {
                    (Value::Array(items), Value::Number(i)) => {
                        let i = *i as usize;
                        let mut items = items.borrow_mut();
                        if i >= items.len() {
                            items.resize(i + 1, Value::Null);
                        }
                        items[i] = value;
                        Ok(())
                    }
                    (Value::Object(fields), Value::Str(key)) => {
                        fields.borrow_mut().insert(key.clone(), value);
                        Ok(())
                    }
                    _ => Err(self.runtime_error(format!(
                        "cannot index a {} with a {}",
                        object.type_name(),
                        index.type_name()
                    ))),
                }
            }
            _ => Err(self.runtime_error("invalid assignment target")),
        }
    }

    fn member(&mut self, object: &Value, property: &str) -> Result<Value, ExecutionError> {
        match object {
            Value::Str(s) if property == "length" => Ok(Value::Number(s.chars().count() as f64)),
            Value::Array(items) if property == "length" => {
                Ok(Value::Number(items.borrow().len() as f64))
            }
            Value::Object(fields) => Ok(fields
                .borrow()
                .get(property)
                .cloned()
                .unwrap_or(Value::Null)),
            other => Err(self.runtime_error(format!(
                "no property `{property}` on a {}",
                other.type_name()
            ))),
        }
    }

    fn index(&mut self, object: &Value, index: &Value) -> Result<Value, ExecutionError> {
        match (object, index) {
            (Value::Array(items), Value::Number(i)) => {
                let items = items.borrow();
                let i = *i as usize;
                Ok(items.get(i).cloned().unwrap_or(Value::Null))
            }
            (Value::Object(fields), Value::Str(key)) => Ok(fields
                .borrow()
                .get(key)
                .cloned()
                .unwrap_or(Value::Null)),
            (Value::Str(s), Value::Number(i)) => Ok(s
                .chars()
                .nth(*i as usize)
                .map(|c| Value::Str(c.to_string()))
                .unwrap_or(Value::Null)),
            _ => Err(self.runtime_error(format!(
                "cannot index a {} with a {}",
                object.type_name(),
                index.type_name()
            ))),
        }
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Value, ExecutionError> {
        if let Expr::Member { object, property } = callee {
            if let Expr::Ident(ns) = object.as_ref() {
                if self.is_host_namespace(ns) {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval(arg)?);
                    }
                    let ns = ns.clone();
                    return self.host_call(&ns, property, values);
                }
            }
            // Method call on an ordinary value.
            let receiver = self.eval(object)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(self.eval(arg)?);
            }
            return self.method_call(receiver, property, values);
        }

        let callee_value = self.eval(callee)?;
        let Value::Function(func) = callee_value else {
            return Err(self.runtime_error(format!(
                "a {} is not callable",
                callee_value.type_name()
            )));
        };
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        self.call_function(&func, values)
    }

    fn method_call(
        &mut self,
        receiver: Value,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ExecutionError> {
        match receiver {
            Value::Str(s) => self.string_method(&s, method, args),
            Value::Array(items) => self.array_method(&items, method, args),
            Value::Object(fields) => {
                // A function stored as an object field.
                let field = fields.borrow().get(method).cloned();
                match field {
                    Some(Value::Function(func)) => self.call_function(&func, args),
                    _ => Err(self.runtime_error(format!("no method `{method}` on an object"))),
                }
            }
            other => Err(self.runtime_error(format!(
                "no method `{method}` on a {}",
                other.type_name()
            ))),
        }
    }

    fn string_method(
        &mut self,
        s: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ExecutionError> {
        self.meter.charge(GasOp::StringOperation(s.len()))?;
        match method {
            "toUpperCase" => Ok(Value::Str(s.to_uppercase())),
            "toLowerCase" => Ok(Value::Str(s.to_lowercase())),
            "substring" => {
                let chars: Vec<char> = s.chars().collect();
                let start = number_arg(&args, 0).unwrap_or(0.0).max(0.0) as usize;
                let end = number_arg(&args, 1)
                    .unwrap_or(chars.len() as f64)
                    .max(0.0) as usize;
                let (lo, hi) = (start.min(end), end.max(start));
                let hi = hi.min(chars.len());
                let lo = lo.min(hi);
                Ok(Value::Str(chars[lo..hi].iter().collect()))
            }
            "indexOf" => {
                let needle = match args.first() {
                    Some(Value::Str(n)) => n.clone(),
                    _ => return Err(self.runtime_error("indexOf expects a string")),
                };
                let index = s
                    .find(&needle)
                    .map(|byte| s[..byte].chars().count() as f64)
                    .unwrap_or(-1.0);
                Ok(Value::Number(index))
            }
            "includes" => {
                let needle = match args.first() {
                    Some(Value::Str(n)) => n.clone(),
                    _ => return Err(self.runtime_error("includes expects a string")),
                };
                Ok(Value::Bool(s.contains(&needle)))
            }
            "split" => {
                let sep = match args.first() {
                    Some(Value::Str(sep)) => sep.clone(),
                    _ => return Err(self.runtime_error("split expects a string separator")),
                };
                let parts: Vec<Value> = if sep.is_empty() {
                    s.chars().map(|c| Value::Str(c.to_string())).collect()
                } else {
                    s.split(&sep).map(|p| Value::Str(p.to_string())).collect()
                };
                self.meter.charge(GasOp::ArrayCreation(parts.len()))?;
                Ok(Value::array(parts))
            }
            "charAt" => {
                let i = number_arg(&args, 0).unwrap_or(0.0) as usize;
                Ok(s.chars()
                    .nth(i)
                    .map(|c| Value::Str(c.to_string()))
                    .unwrap_or_else(|| Value::Str(String::new())))
            }
            "trim" => Ok(Value::Str(s.trim().to_string())),
            other => Err(self.runtime_error(format!("no method `{other}` on a string"))),
        }
    }

    fn array_method(
        &mut self,
        items: &Rc<std::cell::RefCell<Vec<Value>>>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ExecutionError> {
        match method {
            "push" => {
                self.meter
                    .charge(GasOp::MemoryAllocation(args.len() * 16))?;
                let mut items = items.borrow_mut();
                for arg in args {
                    items.push(arg);
                }
                Ok(Value::Number(items.len() as f64))
            }
            "pop" => {
                self.meter.charge(GasOp::ArrayAccess)?;
                Ok(items.borrow_mut().pop().unwrap_or(Value::Null))
            }
            "join" => {
                let sep = match args.first() {
                    Some(Value::Str(sep)) => sep.clone(),
                    None => ",".to_string(),
                    _ => return Err(self.runtime_error("join expects a string separator")),
                };
                let joined: Vec<String> = items
                    .borrow()
                    .iter()
                    .map(|v| v.to_display_string())
                    .collect();
                let result = joined.join(&sep);
                self.meter.charge(GasOp::StringOperation(result.len()))?;
                Ok(Value::Str(result))
            }
            "indexOf" => {
                self.meter.charge(GasOp::ArrayAccess)?;
                let needle = args
                    .first()
                    .cloned()
                    .unwrap_or(Value::Null);
                let index = items
                    .borrow()
                    .iter()
                    .position(|v| v.strict_equals(&needle))
                    .map(|i| i as f64)
                    .unwrap_or(-1.0);
                Ok(Value::Number(index))
            }
            "slice" => {
                let items_ref = items.borrow();
                let len = items_ref.len() as f64;
                let start = clamp_index(number_arg(&args, 0).unwrap_or(0.0), len);
                let end = clamp_index(number_arg(&args, 1).unwrap_or(len), len);
                let sliced: Vec<Value> = if start < end {
                    items_ref[start..end].to_vec()
                } else {
                    Vec::new()
                };
                self.meter.charge(GasOp::ArrayCreation(sliced.len()))?;
                Ok(Value::array(sliced))
            }
            other => Err(self.runtime_error(format!("no method `{other}` on an array"))),
        }
    }

    fn host_call(
        &mut self,
        namespace: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ExecutionError> {
        match namespace {
            "Math" => self.math_call(method, args),
            "JSON" => self.json_call(method, args),
            "secrets" => self.secrets_call(method, args),
            "storage" => self.storage_call(method, args),
            "crypto" => self.crypto_call(method, args),
            _ => unreachable!("checked by is_host_namespace"),
        }
    }

    fn math_call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, ExecutionError> {
        self.meter.charge(GasOp::MathOperation)?;
        let arg = |i: usize| -> Result<f64, ExecutionError> {
            number_arg(&args, i)
                .ok_or_else(|| self.runtime_error(format!("Math.{method} expects a number")))
        };
        let result = match method {
            "abs" => arg(0)?.abs(),
            "floor" => arg(0)?.floor(),
            "ceil" => arg(0)?.ceil(),
            "round" => arg(0)?.round(),
            "sqrt" => arg(0)?.sqrt(),
            "pow" => arg(0)?.powf(arg(1)?),
            "max" | "min" => {
                let mut best = arg(0)?;
                for i in 1..args.len() {
                    let n = arg(i)?;
                    best = if method == "max" {
                        best.max(n)
                    } else {
                        best.min(n)
                    };
                }
                best
            }
            other => return Err(self.runtime_error(format!("unknown function Math.{other}"))),
        };
        Ok(Value::Number(result))
    }

    fn json_call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, ExecutionError> {
        match method {
            "stringify" => {
                let value = args.first().cloned().unwrap_or(Value::Null);
                let text = serde_json::to_string(&value.to_json())
                    .map_err(|e| self.runtime_error(format!("JSON.stringify failed: {e}")))?;
                self.meter.charge(GasOp::StringOperation(text.len()))?;
                Ok(Value::Str(text))
            }
            "parse" => {
                let text = match args.first() {
                    Some(Value::Str(s)) => s.clone(),
                    _ => return Err(self.runtime_error("JSON.parse expects a string")),
                };
                self.meter.charge(GasOp::MemoryAllocation(text.len()))?;
                let json: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| self.runtime_error(format!("JSON.parse failed: {e}")))?;
                Ok(Value::from_json(&json))
            }
            other => Err(self.runtime_error(format!("unknown function JSON.{other}"))),
        }
    }

    fn secrets_call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, ExecutionError> {
        if method != "get" {
            return Err(self.runtime_error(format!("unknown function secrets.{method}")));
        }
        let name = match args.first() {
            Some(Value::Str(name)) => name.clone(),
            _ => return Err(self.runtime_error("secrets.get expects a string name")),
        };
        match self.secrets.get(&name) {
            Some(value) => {
                self.meter.charge(GasOp::SecretRead(value.len()))?;
                Ok(Value::Str(value.clone()))
            }
            None => Ok(Value::Null),
        }
    }

    fn storage_call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, ExecutionError> {
        let key = match args.first() {
            Some(Value::Str(key)) => key.clone(),
            _ => return Err(self.runtime_error(format!("storage.{method} expects a string key"))),
        };
        match method {
            "get" => {
                match self
                    .bindings
                    .storage_read(&key)
                    .map_err(|e| self.runtime_error(e))?
                {
                    Some(bytes) => {
                        self.meter.charge(GasOp::StorageRead(bytes.len()))?;
                        self.meter.charge(GasOp::MemoryAllocation(bytes.len()))?;
                        let text = String::from_utf8(bytes).map_err(|_| {
                            self.runtime_error("stored value is not valid utf-8")
                        })?;
                        Ok(Value::Str(text))
                    }
                    None => {
                        self.meter.charge(GasOp::StorageRead(0))?;
                        Ok(Value::Null)
                    }
                }
            }
            "set" => {
                let value = args
                    .get(1)
                    .cloned()
                    .unwrap_or(Value::Null)
                    .to_display_string();
                self.meter.charge(GasOp::StorageWrite(value.len()))?;
                self.bindings
                    .storage_write(&key, value.as_bytes())
                    .map_err(|e| self.runtime_error(e))?;
                Ok(Value::Null)
            }
            "remove" => {
                self.meter.charge(GasOp::StorageWrite(0))?;
                let removed = self
                    .bindings
                    .storage_delete(&key)
                    .map_err(|e| self.runtime_error(e))?;
                Ok(Value::Bool(removed))
            }
            other => Err(self.runtime_error(format!("unknown function storage.{other}"))),
        }
    }

    fn crypto_call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, ExecutionError> {
        match method {
            "sign" => {
                let (key_id, data) = self.crypto_args(method, &args)?;
                self.meter.charge(GasOp::CryptoOperation(data.len()))?;
                let signature = self
                    .bindings
                    .crypto_sign(&key_id, data.as_bytes())
                    .map_err(|e| self.runtime_error(e))?;
                Ok(Value::Str(hex::encode(signature)))
            }
            "verify" => {
                let (key_id, data) = self.crypto_args(method, &args)?;
                let signature_hex = match args.get(2) {
                    Some(Value::Str(s)) => s.clone(),
                    _ => {
                        return Err(
                            self.runtime_error("crypto.verify expects a hex signature")
                        )
                    }
                };
                self.meter.charge(GasOp::CryptoOperation(data.len()))?;
                let signature = hex::decode(&signature_hex)
                    .map_err(|_| self.runtime_error("signature is not valid hex"))?;
                let valid = self
                    .bindings
                    .crypto_verify(&key_id, data.as_bytes(), &signature)
                    .map_err(|e| self.runtime_error(e))?;
                Ok(Value::Bool(valid))
            }
            "sha3" => {
                let data = match args.first() {
                    Some(Value::Str(s)) => s.clone(),
                    _ => return Err(self.runtime_error("crypto.sha3 expects a string")),
                };
                self.meter.charge(GasOp::CryptoOperation(data.len()))?;
                Ok(Value::Str(hex::encode(
                    self.bindings.crypto_hash(data.as_bytes()),
                )))
            }
            other => Err(self.runtime_error(format!("unknown function crypto.{other}"))),
        }
    }

    fn crypto_args(
        &self,
        method: &str,
        args: &[Value],
    ) -> Result<(String, String), ExecutionError> {
        let key_id = match args.first() {
            Some(Value::Str(id)) => id.clone(),
            _ => {
                return Err(self.runtime_error(format!("crypto.{method} expects a key id")))
            }
        };
        let data = match args.get(1) {
            Some(Value::Str(data)) => data.clone(),
            _ => {
                return Err(self.runtime_error(format!("crypto.{method} expects string data")))
            }
        };
        Ok((key_id, data))
    }
}

fn number_arg(args: &[Value], i: usize) -> Option<f64> {
    match args.get(i) {
        Some(Value::Number(n)) => Some(*n),
        _ => None,
    }
}

fn clamp_index(i: f64, len: f64) -> usize {
    let i = if i < 0.0 { len + i } else { i };
    i.clamp(0.0, len) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::testing::MemoryBindings;
    use crate::bindings::NullBindings;
    use crate::parser::parse;
    use std::time::Duration;

    fn run(code: &str, input: serde_json::Value) -> Result<(serde_json::Value, u64), ExecutionError> {
        run_with(code, input, &NullBindings, 10_000_000)
    }

    fn run_with(
        code: &str,
        input: serde_json::Value,
        bindings: &dyn HostBindings,
        gas_limit: u64,
    ) -> Result<(serde_json::Value, u64), ExecutionError> {
        let program = parse(code)?;
        run_program(
            &program,
            &input,
            &HashMap::new(),
            bindings,
            GasSchedule::default(),
            RunBudget::new(gas_limit, Instant::now() + Duration::from_secs(5)),
            code.len(),
        )
    }

    #[test]
    fn test_doubling_scenario() {
        let (output, gas) = run(
            "function main(input) { return input.value * 2; }",
            serde_json::json!({"value": 21}),
        )
        .unwrap();
        assert_eq!(output, serde_json::json!(42));
        assert!(gas > 0);
    }

    #[test]
    fn test_gas_limit_one_exhausts() {
        let err = run_with(
            "function main(input) { return input.value * 2; }",
            serde_json::json!({"value": 21}),
            &NullBindings,
            1,
        )
        .unwrap_err();
        assert!(matches!(err, ExecutionError::ResourceExhausted { gas_used } if gas_used > 1));
    }

    #[test]
    fn test_gas_is_deterministic() {
        let code = r#"
            function main(input) {
                let total = 0;
                for (let i = 0; i < 50; i++) {
                    total += i * input.factor;
                }
                return total;
            }
        "#;
        let (out1, gas1) = run(code, serde_json::json!({"factor": 2})).unwrap();
        let (out2, gas2) = run(code, serde_json::json!({"factor": 2})).unwrap();
        assert_eq!(out1, out2);
        assert_eq!(gas1, gas2);
    }

    #[test]
    fn test_exact_cost_boundary() {
        let code = "function main(input) { return 1; }";
        // Find the true cost, then check success at exactly that limit and
        // failure one below.
        let (_, cost) = run(code, serde_json::json!(null)).unwrap();
        assert!(run_with(code, serde_json::json!(null), &NullBindings, cost).is_ok());
        assert!(matches!(
            run_with(code, serde_json::json!(null), &NullBindings, cost - 1),
            Err(ExecutionError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn test_runtime_error_carries_stack() {
        let code = r#"
            function inner() { return missing + 1; }
            function outer() { return inner(); }
            function main(input) { return outer(); }
        "#;
        let err = run(code, serde_json::json!(null)).unwrap_err();
        match err {
            ExecutionError::Runtime { message, stack } => {
                assert!(message.contains("missing is not defined"));
                assert_eq!(stack, vec!["inner", "outer", "main"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_missing_main() {
        let err = run("let x = 1;", serde_json::json!(null)).unwrap_err();
        assert!(matches!(err, ExecutionError::Runtime { .. }));
    }

    #[test]
    fn test_control_flow_and_recursion() {
        let code = r#"
            function fib(n) {
                if (n < 2) { return n; }
                return fib(n - 1) + fib(n - 2);
            }
            function main(input) { return fib(input.n); }
        "#;
        let (output, _) = run(code, serde_json::json!({"n": 10})).unwrap();
        assert_eq!(output, serde_json::json!(55));
    }

    #[test]
    fn test_call_depth_limit() {
        let code = r#"
            function loop(n) { return loop(n + 1); }
            function main(input) { return loop(0); }
        "#;
        let err = run(code, serde_json::json!(null)).unwrap_err();
        match err {
            ExecutionError::Runtime { message, .. } => {
                assert!(message.contains("call depth"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_objects_arrays_strings() {
        let code = r#"
            function main(input) {
                let parts = input.name.split(" ");
                let record = { first: parts[0], last: parts[1], tags: [] };
                record.tags.push("member");
                record.tags.push("active");
                return {
                    label: record.first.toUpperCase() + "/" + record.last,
                    count: record.tags.length
                };
            }
        "#;
        let (output, _) = run(code, serde_json::json!({"name": "ada lovelace"})).unwrap();
        assert_eq!(
            output,
            serde_json::json!({"label": "ADA/lovelace", "count": 2})
        );
    }

    #[test]
    fn test_json_builtin() {
        let code = r#"
            function main(input) {
                let text = JSON.stringify({ a: 1 });
                let back = JSON.parse(text);
                return back.a;
            }
        "#;
        let (output, _) = run(code, serde_json::json!(null)).unwrap();
        assert_eq!(output, serde_json::json!(1));
    }

    #[test]
    fn test_math_builtin() {
        let code = "function main(input) { return Math.max(Math.floor(2.9), Math.pow(1, 5)); }";
        let (output, _) = run(code, serde_json::json!(null)).unwrap();
        assert_eq!(output, serde_json::json!(2));
    }

    #[test]
    fn test_storage_host_object() {
        let bindings = MemoryBindings::default();
        let code = r#"
            function main(input) {
                storage.set("greeting", "hello " + input.who);
                let loaded = storage.get("greeting");
                let removed = storage.remove("greeting");
                return { loaded: loaded, removed: removed, gone: storage.get("greeting") };
            }
        "#;
        let (output, _) = run_with(
            code,
            serde_json::json!({"who": "world"}),
            &bindings,
            10_000_000,
        )
        .unwrap();
        assert_eq!(
            output,
            serde_json::json!({"loaded": "hello world", "removed": true, "gone": null})
        );
    }

    #[test]
    fn test_secrets_host_object() {
        let code = r#"function main(input) { return secrets.get("api_key"); }"#;
        let program = parse(code).unwrap();
        let mut secrets = HashMap::new();
        secrets.insert("api_key".to_string(), "s3cr3t".to_string());
        let (output, _) = run_program(
            &program,
            &serde_json::json!(null),
            &secrets,
            &NullBindings,
            GasSchedule::default(),
            RunBudget::new(1_000_000, Instant::now() + Duration::from_secs(5)),
            code.len(),
        )
        .unwrap();
        assert_eq!(output, serde_json::json!("s3cr3t"));
    }

    #[test]
    fn test_crypto_host_object() {
        let bindings = MemoryBindings::default();
        let code = r#"
            function main(input) {
                let sig = crypto.sign("k", "payload");
                return crypto.verify("k", "payload", sig);
            }
        "#;
        let (output, _) =
            run_with(code, serde_json::json!(null), &bindings, 10_000_000).unwrap();
        assert_eq!(output, serde_json::json!(true));
    }

    #[test]
    fn test_deadline_cuts_infinite_loop() {
        let code = "function main(input) { while (true) { } }";
        let program = parse(code).unwrap();
        let err = run_program(
            &program,
            &serde_json::json!(null),
            &HashMap::new(),
            &NullBindings,
            GasSchedule::default(),
            RunBudget::new(u64::MAX, Instant::now() + Duration::from_millis(50)),
            code.len(),
        )
        .unwrap_err();
        assert!(matches!(err, ExecutionError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_cancellation_stops_infinite_loop() {
        let code = "function main(input) { while (true) { } }";
        let program = parse(code).unwrap();
        let budget = RunBudget::new(u64::MAX, Instant::now() + Duration::from_secs(30));

        let cancel = Arc::clone(&budget.cancel);
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.store(true, Ordering::SeqCst);
        });

        let err = run_program(
            &program,
            &serde_json::json!(null),
            &HashMap::new(),
            &NullBindings,
            GasSchedule::default(),
            budget,
            code.len(),
        )
        .unwrap_err();
        setter.join().unwrap();
        assert!(matches!(err, ExecutionError::Cancelled));
    }

    #[test]
    fn test_user_variable_shadows_host_namespace() {
        let code = r#"
            function main(input) {
                let storage = { get: 1 };
                return storage.get;
            }
        "#;
        let (output, _) = run(code, serde_json::json!(null)).unwrap();
        assert_eq!(output, serde_json::json!(1));
    }
}
