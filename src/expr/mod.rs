//! Expression engine: postfix evaluation over data-source variables.
//!
//! An [`Expression`] owns its postfix token stream and a variable table.
//! Variables are bound from incoming records (or wholesale from an alarm's
//! source value), evaluation walks the stream through an operand stack, and
//! stateful tokens keep their windows across evaluations until
//! [`Expression::reset_state`].

mod functions;
mod state;
pub mod factory;
pub mod token;

pub use factory::TokenFactory;
pub use token::{AggKind, FnSpec, OpCode, Stateful, StatefulKind, Token, WindowKind};

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::EvalError;
use crate::source::{column_name_of, Record};
use crate::value::Operand;

/// Ambient inputs for one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct EvalCtx {
    pub now: DateTime<Utc>,
    /// Newest stamp among bound variables, if any are bound.
    pub source_time: Option<DateTime<Utc>>,
}

/// Named slot bound to a data-source column.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    /// Index into the request list returned by `make_expression`.
    pub request_idx: usize,
    pub value: Option<Operand>,
}

/// A compiled expression: source text, postfix stream, variable table.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    postfix: Vec<Token>,
    vars: Vec<Variable>,
}

impl Expression {
    pub(crate) fn new(source: String, postfix: Vec<Token>, vars: Vec<Variable>) -> Self {
        Self {
            source,
            postfix,
            vars,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }

    pub fn has_variables(&self) -> bool {
        !self.vars.is_empty()
    }

    /// Bind every variable wired to `request_idx` from the record's fields.
    /// Fields are matched by the variable's column name, falling back to the
    /// full URI for aliased columns.
    pub fn assign_request_variables(&mut self, record: &Record, request_idx: usize) {
        for var in self.vars.iter_mut().filter(|v| v.request_idx == request_idx) {
            let column = column_name_of(&var.name);
            if let Some(value) = record.field(column).or_else(|| record.field(&var.name)) {
                var.value = Some(Operand::new(value.clone(), record.stamp));
            }
        }
    }

    /// Assign one operand to every variable. Condition on/off expressions
    /// are fed this way from the alarm's source value.
    pub fn set_all_variables(&mut self, operand: &Operand) {
        for var in &mut self.vars {
            var.value = Some(operand.clone());
        }
    }

    /// Evaluate the postfix stream. Exactly one operand must remain.
    pub fn eval(&mut self, clock: &dyn Clock) -> Result<Operand, EvalError> {
        let source_time = self
            .vars
            .iter()
            .filter_map(|v| v.value.as_ref().map(|o| o.stamp))
            .max();
        let ctx = EvalCtx {
            now: clock.now(),
            source_time,
        };
        let default_stamp = source_time.unwrap_or(ctx.now);
        let mut stack: Vec<Operand> = Vec::with_capacity(self.postfix.len());
        for tok in &mut self.postfix {
            match tok {
                Token::Const(v) => stack.push(Operand::new(v.clone(), default_stamp)),
                Token::Var(idx) => {
                    let var = self
                        .vars
                        .get(*idx)
                        .ok_or_else(|| EvalError::UnboundVariable("?".to_string()))?;
                    match &var.value {
                        Some(op) => stack.push(op.clone()),
                        None => return Err(EvalError::UnboundVariable(var.name.clone())),
                    }
                }
                Token::Op(op) => {
                    let arity = op.arity();
                    if stack.len() < arity {
                        return Err(EvalError::MissingOperands(op.name(), arity));
                    }
                    let args = stack.split_off(stack.len() - arity);
                    stack.push(functions::apply_op(*op, &args, &ctx)?);
                }
                Token::Stateful(st) => {
                    let arity = st.arity();
                    if stack.len() < arity {
                        return Err(EvalError::MissingOperands("stateful function", arity));
                    }
                    let args = stack.split_off(stack.len() - arity);
                    stack.push(state::apply_stateful(st, &args)?);
                }
            }
        }
        match stack.len() {
            1 => stack.pop().ok_or(EvalError::Unbalanced(0)),
            n => Err(EvalError::Unbalanced(n)),
        }
    }

    /// Render the source text with each variable annotated by its last
    /// value, for log output: `Temp > 100` becomes `Temp (= 101.2) > 100`.
    pub fn annotate_source(&self) -> String {
        let mut rendered = self.source.clone();
        let mut ordered: Vec<&Variable> = self.vars.iter().collect();
        ordered.sort_by_key(|v| std::cmp::Reverse(v.name.len()));
        for var in ordered {
            let annotated = match &var.value {
                Some(op) => format!("{} (= {})", var.name, op.value),
                None => format!("{} (= NAN)", var.name),
            };
            rendered = rendered.replace(&var.name, &annotated);
        }
        rendered
    }

    /// Clear every stateful token's window and every variable binding.
    /// Called when the owning alarm (re)starts.
    pub fn reset_state(&mut self) {
        for tok in &mut self.postfix {
            if let Token::Stateful(st) = tok {
                st.reset_state();
            }
        }
        for var in &mut self.vars {
            var.value = None;
        }
    }
}
