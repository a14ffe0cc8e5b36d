// File: src/builtins.rs
//
// Built-in native functions for the Tmbdl standard library. These are
// implemented in Rust and installed into a fresh VM's globals; scripts see
// them as ordinary callables. Higher-order natives (map, filter, reduce)
// re-enter the VM through the native bridge.

use chrono::Utc;
use rand::Rng;

use crate::errors::{ErrorKind, SourceLocation, TmbdlError};
use crate::value::Value;
use crate::vm::{register_native, Vm};

/// JSON conversion recursion guard; values are acyclic by construction but
/// arrays can be made self-referential through mutation
const MAX_JSON_DEPTH: usize = 64;

/// Install every built-in into the VM's globals
pub fn install(vm: &mut Vm) {
    // math
    register_native(vm, "abs", 1, native_abs);
    register_native(vm, "sqrt", 1, native_sqrt);
    register_native(vm, "pow", 2, native_pow);
    register_native(vm, "floor", 1, native_floor);
    register_native(vm, "ceil", 1, native_ceil);
    register_native(vm, "round", 1, native_round);
    register_native(vm, "min", 2, native_min);
    register_native(vm, "max", 2, native_max);

    // randomness and time
    register_native(vm, "random", 0, native_random);
    register_native(vm, "random_int", 2, native_random_int);
    register_native(vm, "clock", 0, native_clock);

    // conversions and strings
    register_native(vm, "num", 1, native_num);
    register_native(vm, "str", 1, native_str);
    register_native(vm, "chars", 1, native_chars);
    register_native(vm, "upper", 1, native_upper);
    register_native(vm, "lower", 1, native_lower);
    register_native(vm, "trim", 1, native_trim);
    register_native(vm, "split", 2, native_split);
    register_native(vm, "join", 2, native_join);
    register_native(vm, "contains", 2, native_contains);
    register_native(vm, "slice", 3, native_slice);

    // arrays and maps
    register_native(vm, "push", 2, native_push);
    register_native(vm, "pop", 1, native_pop);
    register_native(vm, "keys", 1, native_keys);
    register_native(vm, "values", 1, native_values);
    register_native(vm, "has", 2, native_has);
    register_native(vm, "remove", 2, native_remove);
    register_native(vm, "range", -1, native_range);
    register_native(vm, "array", -1, native_array);

    // higher-order
    register_native(vm, "map", 2, native_map);
    register_native(vm, "filter", 2, native_filter);
    register_native(vm, "reduce", 3, native_reduce);

    // JSON
    register_native(vm, "to_json", 1, native_to_json);
    register_native(vm, "from_json", 1, native_from_json);
}

fn arg_error(name: &str, expected: &str, got: &Value) -> TmbdlError {
    TmbdlError::new(
        ErrorKind::TypeMismatch,
        format!("'{}' expects {}, got {}", name, expected, got.type_name()),
        SourceLocation::unknown(),
    )
}

fn number_arg(name: &str, args: &[Value], index: usize) -> Result<f64, TmbdlError> {
    match &args[index] {
        Value::Number(n) => Ok(*n),
        other => Err(arg_error(name, "a number", other)),
    }
}

fn string_arg<'a>(name: &str, args: &'a [Value], index: usize) -> Result<&'a str, TmbdlError> {
    match &args[index] {
        Value::Str(s) => Ok(s.as_str()),
        other => Err(arg_error(name, "a string", other)),
    }
}

/// Snapshot an array argument so no lock is held while user code runs
fn array_arg(name: &str, args: &[Value], index: usize) -> Result<Vec<Value>, TmbdlError> {
    match &args[index] {
        Value::Array(elements) => Ok(elements.lock().unwrap().clone()),
        other => Err(arg_error(name, "an array", other)),
    }
}

// === Math ===

fn native_abs(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::Number(number_arg("abs", args, 0)?.abs()))
}

fn native_sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::Number(number_arg("sqrt", args, 0)?.sqrt()))
}

fn native_pow(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::Number(number_arg("pow", args, 0)?.powf(number_arg("pow", args, 1)?)))
}

fn native_floor(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::Number(number_arg("floor", args, 0)?.floor()))
}

fn native_ceil(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::Number(number_arg("ceil", args, 0)?.ceil()))
}

fn native_round(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::Number(number_arg("round", args, 0)?.round()))
}

fn native_min(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::Number(number_arg("min", args, 0)?.min(number_arg("min", args, 1)?)))
}

fn native_max(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::Number(number_arg("max", args, 0)?.max(number_arg("max", args, 1)?)))
}

// === Randomness and time ===

fn native_random(_vm: &mut Vm, _args: &[Value]) -> Result<Value, TmbdlError> {
    let mut rng = rand::thread_rng();
    Ok(Value::Number(rng.gen::<f64>()))
}

fn native_random_int(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    let low = number_arg("random_int", args, 0)? as i64;
    let high = number_arg("random_int", args, 1)? as i64;
    if low > high {
        return Err(TmbdlError::new(
            ErrorKind::TypeMismatch,
            "'random_int' needs low <= high".to_string(),
            SourceLocation::unknown(),
        ));
    }
    let mut rng = rand::thread_rng();
    Ok(Value::Number(rng.gen_range(low..=high) as f64))
}

/// Seconds since the Unix epoch, with millisecond precision
fn native_clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::Number(Utc::now().timestamp_millis() as f64 / 1000.0))
}

// === Conversions and strings ===

fn native_num(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    match &args[0] {
        Value::Number(n) => Ok(Value::Number(*n)),
        Value::Str(s) => Ok(s.trim().parse::<f64>().map(Value::Number).unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

fn native_str(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::str(args[0].to_string()))
}

fn native_chars(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    let s = string_arg("chars", args, 0)?;
    Ok(Value::array(s.chars().map(|c| Value::str(c.to_string())).collect()))
}

fn native_upper(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::str(string_arg("upper", args, 0)?.to_uppercase()))
}

fn native_lower(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::str(string_arg("lower", args, 0)?.to_lowercase()))
}

fn native_trim(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::str(string_arg("trim", args, 0)?.trim()))
}

fn native_split(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    let s = string_arg("split", args, 0)?;
    let sep = string_arg("split", args, 1)?;
    let parts: Vec<Value> = if sep.is_empty() {
        s.chars().map(|c| Value::str(c.to_string())).collect()
    } else {
        s.split(sep).map(Value::str).collect()
    };
    Ok(Value::array(parts))
}

fn native_join(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    let elements = array_arg("join", args, 0)?;
    let sep = string_arg("join", args, 1)?;
    let joined =
        elements.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(sep);
    Ok(Value::str(joined))
}

fn native_contains(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    match (&args[0], &args[1]) {
        (Value::Str(haystack), Value::Str(needle)) => {
            Ok(Value::Bool(haystack.contains(needle.as_str())))
        }
        (Value::Array(elements), needle) => {
            let found = elements.lock().unwrap().iter().any(|v| v == needle);
            Ok(Value::Bool(found))
        }
        (Value::Map(entries), Value::Str(key)) => {
            Ok(Value::Bool(entries.lock().unwrap().contains_key(key.as_str())))
        }
        (other, _) => Err(arg_error("contains", "a string, array, or map", other)),
    }
}

fn clamp_range(start: f64, end: f64, len: usize) -> (usize, usize) {
    let start = start.max(0.0) as usize;
    let end = end.max(0.0) as usize;
    (start.min(len), end.min(len).max(start.min(len)))
}

fn native_slice(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    let start = number_arg("slice", args, 1)?;
    let end = number_arg("slice", args, 2)?;
    match &args[0] {
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = clamp_range(start, end, chars.len());
            Ok(Value::str(chars[start..end].iter().collect::<String>()))
        }
        Value::Array(elements) => {
            let elements = elements.lock().unwrap();
            let (start, end) = clamp_range(start, end, elements.len());
            Ok(Value::array(elements[start..end].to_vec()))
        }
        other => Err(arg_error("slice", "a string or array", other)),
    }
}

// === Arrays and maps ===

fn native_push(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    match &args[0] {
        Value::Array(elements) => {
            let mut elements = elements.lock().unwrap();
            elements.push(args[1].clone());
            Ok(Value::Number(elements.len() as f64))
        }
        other => Err(arg_error("push", "an array", other)),
    }
}

fn native_pop(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    match &args[0] {
        Value::Array(elements) => Ok(elements.lock().unwrap().pop().unwrap_or(Value::Null)),
        other => Err(arg_error("pop", "an array", other)),
    }
}

fn native_keys(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    match &args[0] {
        Value::Map(entries) => {
            let keys = entries.lock().unwrap().keys().map(Value::str).collect();
            Ok(Value::array(keys))
        }
        other => Err(arg_error("keys", "a map", other)),
    }
}

fn native_values(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    match &args[0] {
        Value::Map(entries) => {
            let values = entries.lock().unwrap().values().cloned().collect();
            Ok(Value::array(values))
        }
        other => Err(arg_error("values", "a map", other)),
    }
}

fn native_has(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    match (&args[0], &args[1]) {
        (Value::Map(entries), Value::Str(key)) => {
            Ok(Value::Bool(entries.lock().unwrap().contains_key(key.as_str())))
        }
        (Value::Map(_), other) => Err(arg_error("has", "a string key", other)),
        (other, _) => Err(arg_error("has", "a map", other)),
    }
}

fn native_remove(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    match (&args[0], &args[1]) {
        (Value::Map(entries), Value::Str(key)) => {
            Ok(Value::Bool(entries.lock().unwrap().shift_remove(key.as_str()).is_some()))
        }
        (Value::Map(_), other) => Err(arg_error("remove", "a string key", other)),
        (other, _) => Err(arg_error("remove", "a map", other)),
    }
}

/// range(stop), range(start, stop), or range(start, stop, step)
fn native_range(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    let (start, stop, step) = match args.len() {
        1 => (0.0, number_arg("range", args, 0)?, 1.0),
        2 => (number_arg("range", args, 0)?, number_arg("range", args, 1)?, 1.0),
        3 => (
            number_arg("range", args, 0)?,
            number_arg("range", args, 1)?,
            number_arg("range", args, 2)?,
        ),
        n => {
            return Err(TmbdlError::new(
                ErrorKind::ArityMismatch,
                format!("'range' expects 1 to 3 arguments but got {}", n),
                SourceLocation::unknown(),
            ))
        }
    };
    if step == 0.0 {
        return Err(TmbdlError::new(
            ErrorKind::TypeMismatch,
            "'range' step must not be zero".to_string(),
            SourceLocation::unknown(),
        ));
    }
    let mut out = Vec::new();
    let mut current = start;
    while (step > 0.0 && current < stop) || (step < 0.0 && current > stop) {
        out.push(Value::Number(current));
        current += step;
    }
    Ok(Value::array(out))
}

fn native_array(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    Ok(Value::array(args.to_vec()))
}

// === Higher-order ===

fn native_map(vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    let elements = array_arg("map", args, 0)?;
    let callable = args[1].clone();
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        out.push(vm.invoke(callable.clone(), &[element])?);
    }
    Ok(Value::array(out))
}

fn native_filter(vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    let elements = array_arg("filter", args, 0)?;
    let callable = args[1].clone();
    let mut out = Vec::new();
    for element in elements {
        if vm.invoke(callable.clone(), &[element.clone()])?.is_truthy() {
            out.push(element);
        }
    }
    Ok(Value::array(out))
}

fn native_reduce(vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    let elements = array_arg("reduce", args, 0)?;
    let callable = args[1].clone();
    let mut accumulator = args[2].clone();
    for element in elements {
        accumulator = vm.invoke(callable.clone(), &[accumulator, element])?;
    }
    Ok(accumulator)
}

// === JSON ===

fn json_error(message: String) -> TmbdlError {
    TmbdlError::new(ErrorKind::TypeMismatch, message, SourceLocation::unknown())
}

fn value_to_json(value: &Value, depth: usize) -> Result<serde_json::Value, TmbdlError> {
    if depth > MAX_JSON_DEPTH {
        return Err(json_error("'to_json' input is nested too deeply".to_string()));
    }
    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| json_error(format!("Cannot represent {} in JSON", n))),
        Value::Str(s) => Ok(serde_json::Value::String(s.to_string())),
        Value::Array(elements) => {
            let elements = elements.lock().unwrap().clone();
            let mut out = Vec::with_capacity(elements.len());
            for element in &elements {
                out.push(value_to_json(element, depth + 1)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Value::Map(entries) => {
            let entries = entries.lock().unwrap().clone();
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (key, entry) in &entries {
                out.insert(key.clone(), value_to_json(entry, depth + 1)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Err(json_error(format!("Cannot serialize {} to JSON", other.type_name()))),
    }
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::str(s.clone()),
        serde_json::Value::Array(elements) => {
            Value::array(elements.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(entries) => {
            let mut out = indexmap::IndexMap::with_capacity(entries.len());
            for (key, entry) in entries {
                out.insert(key.clone(), json_to_value(entry));
            }
            Value::map(out)
        }
    }
}

fn native_to_json(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    let json = value_to_json(&args[0], 0)?;
    Ok(Value::str(json.to_string()))
}

fn native_from_json(_vm: &mut Vm, args: &[Value]) -> Result<Value, TmbdlError> {
    let source = string_arg("from_json", args, 0)?;
    let json: serde_json::Value = serde_json::from_str(source)
        .map_err(|e| json_error(format!("Invalid JSON: {}", e)))?;
    Ok(json_to_value(&json))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_with_builtins() -> Vm {
        let mut vm = Vm::new();
        install(&mut vm);
        vm
    }

    #[test]
    fn range_forms() {
        let mut vm = vm_with_builtins();
        let one = native_range(&mut vm, &[Value::Number(3.0)]).unwrap();
        assert_eq!(one.to_string(), "[0, 1, 2]");
        let two =
            native_range(&mut vm, &[Value::Number(2.0), Value::Number(5.0)]).unwrap();
        assert_eq!(two.to_string(), "[2, 3, 4]");
        let three = native_range(
            &mut vm,
            &[Value::Number(5.0), Value::Number(0.0), Value::Number(-2.0)],
        )
        .unwrap();
        assert_eq!(three.to_string(), "[5, 3, 1]");
    }

    #[test]
    fn push_mutates_the_shared_array() {
        let mut vm = vm_with_builtins();
        let arr = Value::array(vec![Value::Number(1.0)]);
        let alias = arr.clone();
        native_push(&mut vm, &[arr, Value::Number(2.0)]).unwrap();
        assert_eq!(alias.to_string(), "[1, 2]");
    }

    #[test]
    fn json_round_trip_preserves_shape() {
        let mut vm = vm_with_builtins();
        let mut entries = indexmap::IndexMap::new();
        entries.insert("name".to_string(), Value::str("frodo"));
        entries.insert("age".to_string(), Value::Number(50.0));
        entries.insert("items".to_string(), Value::array(vec![Value::str("ring")]));
        let map = Value::map(entries);

        let json = native_to_json(&mut vm, &[map]).unwrap();
        let back = native_from_json(&mut vm, &[json]).unwrap();
        assert_eq!(back.to_string(), "{name: frodo, age: 50, items: [ring]}");
    }

    #[test]
    fn json_rejects_callables() {
        let mut vm = vm_with_builtins();
        let callable = vm.get_global("abs").unwrap();
        assert!(native_to_json(&mut vm, &[callable]).is_err());
    }
}
