//! Procedures that shape the graph: `branch`, `make_csp`, `mem` and
//! `scope_include`.
//!
//! The first three work by returning exposed simulation requests, so their
//! bodies become families owned by the requesting procedure. The output of
//! each is a plain reference to the requested family's root.

use std::fmt;
use std::sync::Arc;

use rand::RngCore;

use crate::engine::env::Env;
use crate::engine::errors::ExecError;
use crate::engine::exp::Exp;
use crate::engine::node::{FamilyId, NodeId, ParentRole};
use crate::engine::procedure::{
    Args, EsrRefOutputPsp, Procedure, Psp, PspKind, SimpleSp,
};
use crate::engine::value::{Esr, MadeSp, RequestValue, Value};

/// Name the memoized procedure is bound to inside memoized families.
const MEMOIZED_SP: &str = "memoizedSP";

fn as_exp(value: &Value) -> Arc<Exp> {
    match value {
        Value::Exp(exp) => exp.clone(),
        other => Arc::new(Exp::Value(other.clone())),
    }
}

fn single_request(id: FamilyId, exp: Arc<Exp>, env: Env) -> Value {
    Value::Request(Arc::new(RequestValue {
        esrs: vec![Esr { id, exp, env }],
        lsrs: Vec::new(),
    }))
}

// ---- branch -------------------------------------------------------------

#[derive(Debug)]
struct BranchRequestPsp;

impl Psp for BranchRequestPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        args.check_arity("branch", 3, 3)?;
        let arm = if args.operands[0].is_truthy() {
            &args.operands[1]
        } else {
            &args.operands[2]
        };
        Ok(single_request(
            FamilyId::Node(args.node),
            as_exp(arm),
            args.env.clone(),
        ))
    }
}

// ---- make_csp -----------------------------------------------------------

#[derive(Debug)]
struct MakeCspOutputPsp;

impl Psp for MakeCspOutputPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        args.check_arity("make_csp", 2, 2)?;
        let params = match &args.operands[0] {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::Symbol(name) => Ok(name.clone()),
                    other => Err(ExecError::Evaluation(format!(
                        "procedure parameter must be a symbol, got {}",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            other => {
                return Err(ExecError::Evaluation(format!(
                    "procedure parameters must be a list, got {}",
                    other
                )))
            }
        };
        let request = Arc::new(CspRequestPsp {
            params: params.into(),
            body: as_exp(&args.operands[1]),
            env: args.env.clone(),
        });
        let sp = CompoundSp {
            request,
            output: Arc::new(EsrRefOutputPsp),
        };
        Ok(Value::Procedure(MadeSp::new(Arc::new(sp))))
    }
}

/// A user procedure: evaluates its body in the closure environment extended
/// with its parameters.
struct CompoundSp {
    request: Arc<CspRequestPsp>,
    output: Arc<EsrRefOutputPsp>,
}

impl Procedure for CompoundSp {
    fn name(&self) -> &str {
        "compound"
    }

    fn request_psp(&self) -> Arc<dyn Psp> {
        self.request.clone()
    }

    fn output_psp(&self) -> Arc<dyn Psp> {
        self.output.clone()
    }
}

struct CspRequestPsp {
    params: Arc<[Arc<str>]>,
    body: Arc<Exp>,
    env: Env,
}

impl fmt::Debug for CspRequestPsp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CspRequestPsp({:?} {})", self.params, self.body)
    }
}

impl Psp for CspRequestPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        if args.operand_nodes.len() != self.params.len() {
            return Err(ExecError::Evaluation(format!(
                "procedure expects {} arguments, got {}",
                self.params.len(),
                args.operand_nodes.len()
            )));
        }
        let env = self.env.extend(&self.params, &args.operand_nodes);
        Ok(single_request(FamilyId::Node(args.node), self.body.clone(), env))
    }

    // The request names operand nodes, not their values.
    fn can_absorb(&self, _role: ParentRole) -> bool {
        true
    }
}

// ---- mem ----------------------------------------------------------------

#[derive(Debug)]
struct MakeMspOutputPsp;

impl Psp for MakeMspOutputPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        args.check_arity("mem", 1, 1)?;
        let sp = SimpleSp::new(
            "memoized",
            Arc::new(MspRequestPsp {
                shared_operator: args.operand_nodes[0],
            }),
            Arc::new(EsrRefOutputPsp),
        );
        Ok(Value::Procedure(MadeSp::new(Arc::new(sp))))
    }
}

/// Requests one family per distinct argument tuple.
#[derive(Debug)]
struct MspRequestPsp {
    shared_operator: NodeId,
}

impl Psp for MspRequestPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        let key = args
            .operands
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let mut items = vec![Exp::sym(MEMOIZED_SP)];
        items.extend(args.operands.iter().cloned().map(Exp::Value));
        let env = Env::root().extend(&[Arc::from(MEMOIZED_SP)], &[self.shared_operator]);
        Ok(single_request(
            FamilyId::Key(Arc::from(key.as_str())),
            Arc::new(Exp::Apply(items)),
            env,
        ))
    }
}

// ---- scope_include ------------------------------------------------------

/// `(scope_include scope block exp)` returns `exp` and registers it in the
/// given block.
#[derive(Debug)]
struct ScopeIncludeOutputPsp;

impl Psp for ScopeIncludeOutputPsp {
    fn simulate(&self, args: &Args, _rng: &mut dyn RngCore) -> Result<Value, ExecError> {
        args.check_arity("scope_include", 3, 3)?;
        Ok(args.operands[2].clone())
    }

    fn kind(&self) -> PspKind {
        PspKind::ScopeInclude
    }
}

pub(super) fn procedures() -> Vec<(&'static str, Arc<dyn Procedure>)> {
    let branch: Arc<dyn Procedure> = Arc::new(SimpleSp::new(
        "branch",
        Arc::new(BranchRequestPsp),
        Arc::new(EsrRefOutputPsp),
    ));
    let make_csp: Arc<dyn Procedure> =
        Arc::new(SimpleSp::output_only("make_csp", Arc::new(MakeCspOutputPsp)));
    let mem: Arc<dyn Procedure> =
        Arc::new(SimpleSp::output_only("mem", Arc::new(MakeMspOutputPsp)));
    let scope_include: Arc<dyn Procedure> = Arc::new(SimpleSp::output_only(
        "scope_include",
        Arc::new(ScopeIncludeOutputPsp),
    ));
    vec![
        ("branch", branch),
        ("make_csp", make_csp),
        ("mem", mem),
        ("scope_include", scope_include),
    ]
}
