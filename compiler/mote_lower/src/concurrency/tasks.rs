//! Fixed-stack cooperative switching.

use std::collections::BTreeMap;

use mote_ir::{BlockingOp, Inst, InstKind, Module, Operand, Type};
use tracing::debug;

use super::{build_gowrapper, buffer_type, wait_call, Analysis, ArgsRecord};
use crate::config::{Scheduler, TargetConfig};
use crate::edit::{rewrite_insts, Step};
use crate::error::{LowerError, LowerResult};
use crate::runtime::RuntimeFn;

struct Launch {
    record: ArgsRecord,
    wrapper: String,
}

pub(super) fn lower(module: &mut Module, analysis: &Analysis, config: &TargetConfig) -> LowerResult<()> {
    let mut launches: BTreeMap<String, Launch> = BTreeMap::new();
    for target in analysis.spawn_targets() {
        let params = module
            .function(target)
            .map(|f| f.params.clone())
            .unwrap_or_default();
        let record = ArgsRecord::new(module, target, &params, config.pointer_size)?;
        let wrapper = module.unique_symbol(&format!("{target}$gowrapper"));
        launches.insert(target.to_owned(), Launch { record, wrapper });
    }

    let mut used: Vec<RuntimeFn> = Vec::new();
    let mut need = |f: RuntimeFn| {
        if !used.contains(&f) {
            used.push(f);
        }
    };
    let stack_size = i64::from(config.task_stack_size);

    for index in 0..module.functions.len() {
        let touches = module.functions[index].body.as_ref().is_some_and(|body| {
            body.blocks
                .iter()
                .flat_map(|b| b.insts.iter())
                .any(|inst| inst.kind.is_concurrency_construct())
        });
        if !touches {
            continue;
        }
        let name = module.functions[index].name.clone();
        let Some(mut body) = module.functions[index].body.take() else {
            continue;
        };
        let result = rewrite_insts(&mut body, |emit, inst| {
            match &inst.kind {
                InstKind::Spawn { target, args } => {
                    let Some(launch) = launches.get(target) else {
                        return Err(LowerError::internal(format!(
                            "spawn of @{target} was not analysed"
                        )));
                    };
                    if launch.record.ty.is_some() {
                        need(RuntimeFn::Alloc);
                    }
                    let packed = launch.record.pack(emit, target, args);
                    emit.call(
                        RuntimeFn::StartTask.name(),
                        vec![
                            (Type::Ptr, Operand::global(launch.wrapper.as_str())),
                            (Type::Ptr, packed),
                            (Type::I32, Operand::Int(stack_size)),
                        ],
                    );
                    need(RuntimeFn::StartTask);
                }
                InstKind::Blocking(op) => {
                    let buffer = buffer_type(op).map(|ty| {
                        let hint = emit.hint(inst.result, "buf", &format!("{}.buf", op.mnemonic()));
                        let slot = emit.body.add_value(&hint, Type::Ptr);
                        emit.hoist(Inst::new(
                            Some(slot),
                            InstKind::Alloca {
                                ty: ty.clone(),
                                align: None,
                            },
                        ));
                        Operand::Local(slot)
                    });
                    if let (BlockingOp::ChanSend { ty, value, .. }, Some(slot)) = (op, &buffer) {
                        emit.store(ty, value.clone(), slot.clone());
                    }
                    let (wait, args) = wait_call(op, buffer.clone());
                    emit.call(wait.name(), args);
                    emit.call(RuntimeFn::TaskPause.name(), Vec::new());
                    need(wait);
                    need(RuntimeFn::TaskPause);
                    if let (BlockingOp::ChanRecv { ty, .. }, Some(slot)) = (op, buffer) {
                        emit.define(
                            inst.result,
                            InstKind::Load {
                                ty: ty.clone(),
                                ptr: slot,
                                align: None,
                            },
                        );
                    }
                }
                _ => emit.push(inst),
            }
            Ok(Step::Continue)
        });
        module.functions[index].body = Some(body);
        result.map_err(|e| e.in_function(&name))?;
    }

    for (target, launch) in &launches {
        let Some(function) = module.function(target) else {
            continue;
        };
        let wrapper = build_gowrapper(&launch.wrapper, function, &launch.record, Scheduler::Tasks);
        module.functions.push(wrapper);
        need(RuntimeFn::TaskExit);
    }
    for f in used {
        f.declare(module);
    }
    debug!(launch_targets = launches.len(), "lowered to fixed-stack tasks");
    Ok(())
}
