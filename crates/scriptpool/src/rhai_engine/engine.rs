use std::{
    thread,
    time::{Duration, Instant},
};

use rhai::{
    Dynamic, Engine, EvalAltResult, INT, NativeCallContext, Position,
    default_limits::MAX_STRINGS_INTERNED,
    packages::{CorePackage, Package, StandardPackage},
};

use super::{
    context::{CallSlot, format_location},
    limits::EngineLimits,
};
use crate::{
    config::{CreationMode, ExecutionPolicy},
    diagnostics::{ErrorRecord, InformationRecord, ProgressRecord},
};

/// How often the progress hook looks at the cancellation token.
const CANCEL_CHECK_INTERVAL: u64 = 128;

/// Longest uninterrupted stretch of `sleep`.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

type FnResult<T> = Result<T, Box<EvalAltResult>>;

pub(crate) fn build_engine(
    limits: &EngineLimits,
    mode: CreationMode,
    policy: ExecutionPolicy,
) -> Engine {
    let package = match mode {
        CreationMode::Default => StandardPackage::new().as_shared_module(),
        CreationMode::Restricted => CorePackage::new().as_shared_module(),
    };
    let mut engine = Engine::new_raw();
    engine.register_global_module(package);

    engine.set_max_strings_interned(MAX_STRINGS_INTERNED);
    engine.set_strict_variables(true);
    engine.set_fail_on_invalid_map_property(true);

    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);
    engine.set_max_variables(limits.max_variables);
    engine.set_max_functions(limits.max_functions);
    engine.set_max_modules(limits.max_modules);

    if policy == ExecutionPolicy::Restricted {
        engine.disable_symbol("import");
        engine.disable_symbol("eval");
    }

    engine
}

/// Wire the diagnostic, pipeline and cancellation surface into `engine`.
///
/// Every function reaches the running invocation through `slot`; outside an
/// invocation they do nothing.
pub(crate) fn register_host_api(engine: &mut Engine, slot: &CallSlot) {
    let s = slot.clone();
    engine.on_print(move |text| {
        s.with(|call| {
            call.sink
                .information(InformationRecord::new(text).with_source("print"))
        });
    });

    let s = slot.clone();
    engine.on_debug(move |text, _source, _pos| {
        s.with(|call| call.sink.debug(text));
    });

    let s = slot.clone();
    engine.on_progress(move |ops| {
        if ops % CANCEL_CHECK_INTERVAL == 0 && s.is_cancelled() {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    let s = slot.clone();
    engine.register_fn("write_verbose", move |message: &str| {
        s.with(|call| call.sink.verbose(message));
    });
    let s = slot.clone();
    engine.register_fn("write_debug", move |message: &str| {
        s.with(|call| call.sink.debug(message));
    });
    let s = slot.clone();
    engine.register_fn("write_information", move |message: &str| {
        s.with(|call| {
            call.sink
                .information(InformationRecord::new(message).with_source("write_information"))
        });
    });
    let s = slot.clone();
    engine.register_fn("write_warning", move |message: &str| {
        s.with(|call| call.sink.warning(message));
    });
    let s = slot.clone();
    engine.register_fn(
        "write_error",
        move |context: NativeCallContext, message: &str| {
            let record = ErrorRecord {
                message: message.to_string(),
                location: format_location(context.call_position()),
            };
            s.with(|call| call.sink.error(record));
        },
    );

    let s = slot.clone();
    engine.register_fn(
        "write_progress",
        move |activity: &str, percent: INT| -> FnResult<()> {
            s.progress(ProgressRecord::new(activity, checked_percent(percent)?));
            Ok(())
        },
    );
    let s = slot.clone();
    engine.register_fn(
        "write_progress",
        move |activity: &str, percent: INT, status: &str| -> FnResult<()> {
            let record =
                ProgressRecord::new(activity, checked_percent(percent)?).with_status(status);
            s.progress(record);
            Ok(())
        },
    );
    let s = slot.clone();
    engine.register_fn(
        "write_progress",
        move |activity: &str, percent: INT, status: &str, operation: &str| -> FnResult<()> {
            let record = ProgressRecord::new(activity, checked_percent(percent)?)
                .with_status(status)
                .with_operation(operation);
            s.progress(record);
            Ok(())
        },
    );
    let s = slot.clone();
    engine.register_fn("complete_progress", move |activity: &str| {
        s.progress(ProgressRecord::completed(activity));
    });

    let s = slot.clone();
    engine.register_fn("emit", move |value: Dynamic| {
        s.with(|call| call.pipeline.push(value));
    });

    let s = slot.clone();
    engine.register_fn("sleep", move |ms: INT| -> FnResult<()> {
        let Some(cancel) = s.cancel_token() else {
            return Ok(());
        };
        let deadline = Instant::now() + Duration::from_millis(u64::try_from(ms).unwrap_or(0));
        loop {
            if cancel.is_cancelled() {
                return Err(EvalAltResult::ErrorTerminated(Dynamic::UNIT, Position::NONE).into());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    });
}

fn checked_percent(percent: INT) -> FnResult<u8> {
    u8::try_from(percent)
        .ok()
        .filter(|p| *p <= 100)
        .ok_or_else(|| format!("percent must be between 0 and 100, got {percent}").into())
}
