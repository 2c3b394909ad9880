//! Reference executor over the shared namespace
//!
//! Interprets a small statement language (JSON-literal assignments,
//! qualified calls, `print`/`eprint`) covering everything the protocol
//! itself synthesizes. Native functions, classes, and
//! communicators are registered into the [`ExecContext`] up front;
//! deployments embedding a real interpreter implement [`Executor`]
//! themselves.

use serde_json::{Map, Value};

use super::{AttrError, AttrKind, ExecContext, ExecFault, Executor, OutputSink, Slot};

/// The built-in executor: stateless, all state lives in the context.
#[derive(Default)]
pub struct NativeExecutor;

impl NativeExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for NativeExecutor {
    fn execute(
        &mut self,
        ctx: &mut ExecContext,
        source: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<(), ExecFault> {
        for line in source.lines() {
            for statement in split_top_level(line, ';') {
                let statement = statement.trim();
                if statement.is_empty() || statement.starts_with('#') {
                    continue;
                }
                run_statement(ctx, statement, sink)
                    .map_err(|fault| fault.at_statement(statement).with_source(source))?;
            }
        }
        Ok(())
    }

    fn invoke(
        &mut self,
        ctx: &mut ExecContext,
        target: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        sink: &mut dyn OutputSink,
    ) -> Result<Option<Slot>, ExecFault> {
        let mut temps = Vec::new();
        let mut parts = Vec::new();

        for (i, arg) in args.iter().enumerate() {
            let slot_name = format!("__arg_{}__", i);
            ctx.bind(&slot_name, arg.clone());
            parts.push(slot_name.clone());
            temps.push(slot_name);
        }
        for (i, (key, value)) in kwargs.iter().enumerate() {
            let slot_name = format!("__kwarg_{}__", i);
            ctx.bind(&slot_name, value.clone());
            parts.push(format!("{}={}", key, slot_name));
            temps.push(slot_name);
        }

        let statement = format!("__ret__ = {}({})", target, parts.join(","));
        ctx.bind("__ret__", Value::Null);

        let outcome = self.execute(ctx, &statement, sink);

        // Transactional cleanup: the temporaries never outlive the call,
        // whether it succeeded or faulted.
        let result = ctx.remove("__ret__");
        for name in &temps {
            ctx.remove(name);
        }

        outcome?;
        Ok(result)
    }

    fn get_attribute(
        &mut self,
        ctx: &mut ExecContext,
        target: &str,
        name: &str,
    ) -> Result<(Value, AttrKind), AttrError> {
        match ctx.get(target) {
            None => Err(AttrError::UnknownHandle(target.to_string())),
            Some(Slot::Instance(inst)) => {
                if let Some(value) = inst.fields.get(name) {
                    return Ok((value.clone(), AttrKind::Value));
                }
                if inst.has_method(name) {
                    let desc = format!("<bound method {}.{}>", inst.class_name, name);
                    return Ok((Value::String(desc), AttrKind::Callable));
                }
                // Instance lookup falls back to class-level state.
                if let Some(Slot::Class(class)) = ctx.get(&inst.class_name) {
                    if let Some(value) = class.statics.get(name) {
                        return Ok((value.clone(), AttrKind::Value));
                    }
                    if class.has_class_method(name) {
                        let desc = format!("<function {}.{}>", class.name, name);
                        return Ok((Value::String(desc), AttrKind::Callable));
                    }
                }
                Err(AttrError::NoSuchAttribute(target.to_string(), name.to_string()))
            }
            Some(Slot::Class(class)) => {
                if let Some(value) = class.statics.get(name) {
                    return Ok((value.clone(), AttrKind::Value));
                }
                if class.has_class_method(name) {
                    let desc = format!("<function {}.{}>", class.name, name);
                    return Ok((Value::String(desc), AttrKind::Callable));
                }
                Err(AttrError::NoSuchAttribute(target.to_string(), name.to_string()))
            }
            Some(_) => Err(AttrError::NoSuchAttribute(target.to_string(), name.to_string())),
        }
    }

    fn set_attribute(
        &mut self,
        ctx: &mut ExecContext,
        target: &str,
        name: &str,
        value: Value,
    ) -> Result<(), AttrError> {
        match ctx.get_mut(target) {
            None => Err(AttrError::UnknownHandle(target.to_string())),
            Some(Slot::Instance(inst)) => {
                inst.fields.insert(name.to_string(), value);
                Ok(())
            }
            Some(Slot::Class(class)) => {
                class.statics.insert(name.to_string(), value);
                Ok(())
            }
            Some(_) => Err(AttrError::NotAssignable(target.to_string(), name.to_string())),
        }
    }
}

fn run_statement(
    ctx: &mut ExecContext,
    statement: &str,
    sink: &mut dyn OutputSink,
) -> Result<(), ExecFault> {
    if let Some((lhs, rhs)) = split_assignment(statement) {
        let slot = eval_expr(ctx, rhs.trim(), sink)?;
        ctx.insert(lhs.trim(), slot);
        Ok(())
    } else {
        eval_expr(ctx, statement, sink).map(|_| ())
    }
}

fn eval_expr(
    ctx: &mut ExecContext,
    expr: &str,
    sink: &mut dyn OutputSink,
) -> Result<Slot, ExecFault> {
    if let Some((target, inner)) = split_call(expr) {
        let (args, kwargs) = parse_call_args(ctx, inner, sink)?;
        return dispatch_call(ctx, target, &args, &kwargs, sink);
    }

    if is_ident(expr) {
        return match ctx.get(expr) {
            Some(slot) => Ok(slot.clone()),
            None => Err(ExecFault::new(format!("name '{}' is not defined", expr))),
        };
    }

    if let Some((owner, attr)) = expr.rsplit_once('.') {
        if is_ident(owner) && is_ident(attr) {
            return read_attribute(ctx, owner, attr);
        }
    }

    serde_json::from_str(expr)
        .map(Slot::Value)
        .map_err(|_| ExecFault::new(format!("malformed literal '{}'", expr)))
}

fn read_attribute(ctx: &ExecContext, owner: &str, attr: &str) -> Result<Slot, ExecFault> {
    let not_defined = || ExecFault::new(format!("name '{}' is not defined", owner));
    match ctx.get(owner).ok_or_else(not_defined)? {
        Slot::Instance(inst) => inst
            .fields
            .get(attr)
            .cloned()
            .map(Slot::Value)
            .ok_or_else(|| {
                ExecFault::new(format!(
                    "'{}' object has no attribute '{}'",
                    inst.class_name, attr
                ))
            }),
        Slot::Class(class) => class
            .statics
            .get(attr)
            .cloned()
            .map(Slot::Value)
            .ok_or_else(|| {
                ExecFault::new(format!("class '{}' has no attribute '{}'", class.name, attr))
            }),
        _ => Err(ExecFault::new(format!(
            "'{}' has no readable attributes",
            owner
        ))),
    }
}

fn dispatch_call(
    ctx: &mut ExecContext,
    target: &str,
    args: &[Value],
    kwargs: &Map<String, Value>,
    sink: &mut dyn OutputSink,
) -> Result<Slot, ExecFault> {
    // Output builtins, unless the namespace shadows them.
    if (target == "print" || target == "eprint") && !ctx.contains(target) {
        let text = match args {
            [single] => stringify(single),
            _ => args.iter().map(stringify).collect::<Vec<_>>().join(" "),
        };
        if target == "print" {
            sink.stdout(&format!("{}\n", text));
        } else {
            sink.stderr(&format!("{}\n", text));
        }
        return Ok(Slot::Value(Value::Null));
    }

    if let Some((owner, method)) = target.rsplit_once('.') {
        return match ctx.get_mut(owner) {
            None => Err(ExecFault::new(format!("name '{}' is not defined", owner))),
            Some(Slot::Instance(inst)) => {
                let bound = inst.method(method).ok_or_else(|| {
                    ExecFault::new(format!(
                        "'{}' object has no method '{}'",
                        inst.class_name, method
                    ))
                })?;
                bound(&mut inst.fields, args, kwargs, sink).map(Slot::Value)
            }
            Some(Slot::Class(class)) => {
                let bound = class.class_method(method).ok_or_else(|| {
                    ExecFault::new(format!(
                        "class '{}' has no method '{}'",
                        class.name, method
                    ))
                })?;
                bound(&mut class.statics, args, kwargs, sink).map(Slot::Value)
            }
            Some(_) => Err(ExecFault::new(format!("'{}' is not callable", target))),
        };
    }

    match ctx.get(target) {
        None => Err(ExecFault::new(format!("name '{}' is not defined", target))),
        Some(Slot::Function(body)) => {
            let body = body.clone();
            body(args, kwargs, sink).map(Slot::Value)
        }
        Some(Slot::Class(class)) => class.instantiate(args, kwargs).map(Slot::Instance),
        Some(_) => Err(ExecFault::new(format!(
            "'{}' object is not callable",
            target
        ))),
    }
}

fn parse_call_args(
    ctx: &mut ExecContext,
    inner: &str,
    sink: &mut dyn OutputSink,
) -> Result<(Vec<Value>, Map<String, Value>), ExecFault> {
    let mut args = Vec::new();
    let mut kwargs = Map::new();

    for piece in split_top_level(inner, ',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        if let Some((key, value_expr)) = split_kwarg(piece) {
            let value = eval_value(ctx, value_expr.trim(), sink)?;
            kwargs.insert(key.trim().to_string(), value);
        } else {
            args.push(eval_value(ctx, piece, sink)?);
        }
    }

    Ok((args, kwargs))
}

fn eval_value(
    ctx: &mut ExecContext,
    expr: &str,
    sink: &mut dyn OutputSink,
) -> Result<Value, ExecFault> {
    let slot = eval_expr(ctx, expr, sink)?;
    slot.to_wire()
        .ok_or_else(|| ExecFault::new(format!("argument '{}' is not a plain value", expr)))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Split a call expression into `(target, inner_args)`. The target must be
/// a (possibly dotted) identifier and the closing paren must end the
/// expression.
fn split_call(expr: &str) -> Option<(&str, &str)> {
    let open = expr.find('(')?;
    let target = &expr[..open];
    if !is_qualified(target) || !expr.ends_with(')') {
        return None;
    }
    Some((target, &expr[open + 1..expr.len() - 1]))
}

/// Split an assignment statement at the first top-level `=` whose left
/// side is a plain identifier.
fn split_assignment(statement: &str) -> Option<(&str, &str)> {
    let index = find_top_level(statement, '=')?;
    let (lhs, rhs) = (&statement[..index], &statement[index + 1..]);
    if is_ident(lhs.trim()) {
        Some((lhs, rhs))
    } else {
        None
    }
}

fn split_kwarg(piece: &str) -> Option<(&str, &str)> {
    let index = find_top_level(piece, '=')?;
    let (key, value) = (&piece[..index], &piece[index + 1..]);
    if is_ident(key.trim()) {
        Some((key, value))
    } else {
        None
    }
}

/// Byte index of the first occurrence of `needle` at bracket depth zero,
/// outside string literals.
fn find_top_level(text: &str, needle: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ if ch == needle && depth == 0 => return Some(index),
            _ => {}
        }
    }
    None
}

/// Split on `sep` at bracket depth zero, outside string literals.
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0usize;

    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ if ch == sep && depth == 0 => {
                pieces.push(&text[start..index]);
                start = index + sep.len_utf8();
            }
            _ => {}
        }
    }
    pieces.push(&text[start..]);
    pieces
}

fn is_ident(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn is_qualified(text: &str) -> bool {
    !text.is_empty() && text.split('.').all(is_ident)
}
