// File: src/vm.rs
//
// Virtual machine for executing Tmbdl bytecode. Stack-based: one shared
// value stack, a call-frame stack, by-name globals, and a list of open
// upvalues that keeps closure captures shared until their slots die.

use ahash::AHashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};

use crate::bytecode::{Chunk, CompiledFunction, Constant, OpCode};
use crate::disasm;
use crate::errors::{find_closest_match, ErrorKind, SourceLocation, TmbdlError};
use crate::module::{new_module_cache, ModuleLoader, SharedModuleCache};
use crate::value::{Closure, NativeFn, NativeFunction, SharedMap, SharedUpvalue, Upvalue, Value};

const FRAMES_MAX: usize = 256;

fn trace_enabled() -> bool {
    static TRACE: OnceLock<bool> = OnceLock::new();
    *TRACE.get_or_init(|| std::env::var("TMBDL_TRACE").is_ok())
}

/// An in-progress function call. `stack_offset` is the absolute index of
/// the frame's slot 0; `return_slot` is where the return value must land
/// (the slot the callee itself occupied before the call).
struct CallFrame {
    closure: Arc<Closure>,
    ip: usize,
    stack_offset: usize,
    return_slot: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: AHashMap<String, Value>,
    /// Open upvalues sorted by descending stack location; at most one
    /// entry per slot
    open_upvalues: Vec<(usize, SharedUpvalue)>,
    module_cache: SharedModuleCache,
    exports: SharedMap,
    loader: Option<Arc<dyn ModuleLoader>>,
    current_module: Option<String>,
    out: Box<dyn Write>,
    debug_out: Box<dyn Write>,
    /// Source line of the opcode currently executing, for error reports
    line: u16,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: AHashMap::new(),
            open_upvalues: Vec::new(),
            module_cache: new_module_cache(),
            exports: crate::value::new_shared_map(),
            loader: None,
            current_module: None,
            out: Box::new(std::io::stdout()),
            debug_out: Box::new(std::io::stderr()),
            line: 0,
        }
    }

    // === Configuration ===

    pub fn set_module_loader(&mut self, loader: Arc<dyn ModuleLoader>) {
        self.loader = Some(loader);
    }

    pub fn set_current_module(&mut self, key: String) {
        self.current_module = Some(key);
    }

    pub fn set_module_cache(&mut self, cache: SharedModuleCache) {
        self.module_cache = cache;
    }

    pub fn set_exports(&mut self, exports: SharedMap) {
        self.exports = exports;
    }

    pub fn exports(&self) -> SharedMap {
        self.exports.clone()
    }

    pub fn set_stdout(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    pub fn set_debug_out(&mut self, out: Box<dyn Write>) {
        self.debug_out = out;
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    // === Execution entry points ===

    /// Execute a main chunk to completion and return its result
    pub fn run(&mut self, chunk: Chunk) -> Result<Value, TmbdlError> {
        let function = Arc::new(CompiledFunction {
            name: "<main>".to_string(),
            arity: 0,
            upvalue_count: 0,
            chunk,
        });
        let closure = Arc::new(Closure { function, upvalues: Vec::new() });

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.frames.push(CallFrame { closure, ip: 0, stack_offset: 0, return_slot: 0 });

        let result = self.execute(0);
        if result.is_err() {
            self.unwind();
        }
        self.frames.clear();
        result
    }

    /// Call a Tmbdl callable from native code and run it to completion.
    /// This is the re-entry point higher-order natives use.
    pub fn invoke(&mut self, callable: Value, args: &[Value]) -> Result<Value, TmbdlError> {
        let base = self.frames.len();
        self.stack.push(callable);
        for arg in args {
            self.stack.push(arg.clone());
        }
        self.call_value(args.len())?;
        if self.frames.len() > base {
            self.execute(base)
        } else {
            // native callee already returned synchronously
            self.pop()
        }
    }

    /// Unwinding closes the open upvalues of every abandoned frame so
    /// escaped closures keep consistent captures
    fn unwind(&mut self) {
        while let Some(frame) = self.frames.pop() {
            self.close_upvalues(frame.stack_offset);
        }
        self.stack.clear();
    }

    // === Stack and frame helpers ===

    fn pop(&mut self) -> Result<Value, TmbdlError> {
        self.stack
            .pop()
            .ok_or_else(|| TmbdlError::internal("value stack underflow".to_string()))
    }

    fn peek(&self, distance: usize) -> Result<&Value, TmbdlError> {
        let len = self.stack.len();
        len.checked_sub(distance + 1)
            .and_then(|index| self.stack.get(index))
            .ok_or_else(|| TmbdlError::internal("value stack underflow".to_string()))
    }

    fn frame(&self) -> Result<&CallFrame, TmbdlError> {
        self.frames
            .last()
            .ok_or_else(|| TmbdlError::internal("no active call frame".to_string()))
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, TmbdlError> {
        self.frames
            .last_mut()
            .ok_or_else(|| TmbdlError::internal("no active call frame".to_string()))
    }

    fn read_byte(&mut self) -> Result<u8, TmbdlError> {
        let frame = self.frame_mut()?;
        let byte = frame
            .closure
            .function
            .chunk
            .code
            .get(frame.ip)
            .copied()
            .ok_or_else(|| TmbdlError::internal("instruction pointer out of range".to_string()))?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_constant(&mut self) -> Result<Constant, TmbdlError> {
        let index = self.read_byte()? as usize;
        let frame = self.frame()?;
        frame
            .closure
            .function
            .chunk
            .constants
            .get(index)
            .cloned()
            .ok_or_else(|| TmbdlError::internal("constant index out of range".to_string()))
    }

    fn read_name_constant(&mut self) -> Result<Arc<String>, TmbdlError> {
        match self.read_constant()? {
            Constant::Str(name) => Ok(name),
            other => Err(TmbdlError::internal(format!(
                "expected a name constant, found {:?}",
                other
            ))),
        }
    }

    fn runtime_error(&self, kind: ErrorKind, message: String) -> TmbdlError {
        TmbdlError::new(kind, message, SourceLocation::at_line(self.line as usize))
    }

    fn pop_number_pair(&mut self, op: &str) -> Result<(f64, f64), TmbdlError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok((x, y)),
            (a, b) => Err(self.runtime_error(
                ErrorKind::TypeMismatch,
                format!("'{}' needs numbers, got {} and {}", op, a.type_name(), b.type_name()),
            )),
        }
    }

    // === Upvalue protocol ===

    /// Return the open upvalue for `location`, creating and splicing in a
    /// new one when no closure has captured that slot yet. Deduplication
    /// here is what makes sibling closures share a capture.
    fn capture_upvalue(&mut self, location: usize) -> SharedUpvalue {
        let mut insert_at = self.open_upvalues.len();
        for (i, (loc, upvalue)) in self.open_upvalues.iter().enumerate() {
            if *loc == location {
                return upvalue.clone();
            }
            if *loc < location {
                insert_at = i;
                break;
            }
        }
        let upvalue = Arc::new(Mutex::new(Upvalue::Open(location)));
        self.open_upvalues.insert(insert_at, (location, upvalue.clone()));
        upvalue
    }

    /// Close every open upvalue at or above `last`: copy the stack slot
    /// into the upvalue's own cell and unlink it. All sharers observe the
    /// transition at once.
    fn close_upvalues(&mut self, last: usize) {
        while let Some((location, _)) = self.open_upvalues.first() {
            if *location < last {
                break;
            }
            let (location, upvalue) = self.open_upvalues.remove(0);
            let value = self.stack.get(location).cloned().unwrap_or(Value::Null);
            *upvalue.lock().unwrap() = Upvalue::Closed(value);
        }
    }

    // === Calls ===

    fn call_value(&mut self, arg_count: usize) -> Result<(), TmbdlError> {
        let callee_index = self
            .stack
            .len()
            .checked_sub(arg_count + 1)
            .ok_or_else(|| TmbdlError::internal("value stack underflow".to_string()))?;
        let callee = self.stack[callee_index].clone();

        match callee {
            Value::Closure(closure) => {
                let arity = closure.function.arity as usize;
                if arity != arg_count {
                    return Err(TmbdlError::arity_mismatch(
                        &closure.function.name,
                        arity,
                        arg_count,
                        self.line as usize,
                    ));
                }
                if self.frames.len() >= FRAMES_MAX {
                    return Err(self.runtime_error(
                        ErrorKind::StackOverflow,
                        "call stack overflow".to_string(),
                    ));
                }
                let stack_offset = self.stack.len() - arg_count;
                self.frames.push(CallFrame {
                    closure,
                    ip: 0,
                    stack_offset,
                    return_slot: callee_index,
                });
                Ok(())
            }
            Value::Native(native) => {
                if native.arity >= 0 && native.arity as usize != arg_count {
                    return Err(TmbdlError::arity_mismatch(
                        &native.name,
                        native.arity as usize,
                        arg_count,
                        self.line as usize,
                    ));
                }
                let args = self.stack.split_off(self.stack.len() - arg_count);
                self.stack.pop(); // the native itself
                let result = (native.func)(self, &args)?;
                self.stack.push(result);
                Ok(())
            }
            other => Err(self.runtime_error(
                ErrorKind::TypeMismatch,
                format!("Value of type {} is not callable", other.type_name()),
            )),
        }
    }

    // === The interpreter loop ===

    /// Fetch-decode-execute until the frame stack shrinks back to `base`.
    /// `run` enters with base 0; `invoke` re-enters with the current depth.
    fn execute(&mut self, base: usize) -> Result<Value, TmbdlError> {
        loop {
            let (line, trace_text) = {
                let frame = self.frame()?;
                let chunk = &frame.closure.function.chunk;
                let line = chunk.line_at(frame.ip);
                let text = if trace_enabled() {
                    Some(disasm::instruction_at(chunk, frame.ip))
                } else {
                    None
                };
                (line, text)
            };
            self.line = line;
            if let Some(text) = trace_text {
                let _ = writeln!(self.debug_out, "{}", text);
            }

            let byte = self.read_byte()?;
            let op = OpCode::from_byte(byte).ok_or_else(|| {
                TmbdlError::internal(format!("unknown opcode byte 0x{:02x}", byte))
            })?;

            match op {
                OpCode::PushConst => {
                    let constant = self.read_constant()?;
                    self.stack.push(constant.to_value());
                }
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::Dup => {
                    let value = self.peek(0)?.clone();
                    self.stack.push(value);
                }

                OpCode::Add => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let result = match (&a, &b) {
                        (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
                        _ if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) => {
                            Value::str(format!("{}{}", a, b))
                        }
                        _ => {
                            return Err(self.runtime_error(
                                ErrorKind::TypeMismatch,
                                format!(
                                    "Cannot add {} and {}",
                                    a.type_name(),
                                    b.type_name()
                                ),
                            ))
                        }
                    };
                    self.stack.push(result);
                }
                OpCode::Sub => {
                    let (x, y) = self.pop_number_pair("-")?;
                    self.stack.push(Value::Number(x - y));
                }
                OpCode::Mul => {
                    let (x, y) = self.pop_number_pair("*")?;
                    self.stack.push(Value::Number(x * y));
                }
                OpCode::Div => {
                    let (x, y) = self.pop_number_pair("/")?;
                    if y == 0.0 {
                        return Err(self.runtime_error(
                            ErrorKind::DivisionByZero,
                            "Division by zero".to_string(),
                        ));
                    }
                    self.stack.push(Value::Number(x / y));
                }
                OpCode::Mod => {
                    let (x, y) = self.pop_number_pair("%")?;
                    if y == 0.0 {
                        return Err(self.runtime_error(
                            ErrorKind::DivisionByZero,
                            "Modulo by zero".to_string(),
                        ));
                    }
                    self.stack.push(Value::Number(x % y));
                }
                OpCode::Negate => {
                    let value = self.pop()?;
                    match value {
                        Value::Number(n) => self.stack.push(Value::Number(-n)),
                        other => {
                            return Err(self.runtime_error(
                                ErrorKind::TypeMismatch,
                                format!("Cannot negate {}", other.type_name()),
                            ))
                        }
                    }
                }

                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Bool(a == b));
                }
                OpCode::NotEqual => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Bool(a != b));
                }
                OpCode::Less => {
                    let (x, y) = self.pop_number_pair("<")?;
                    self.stack.push(Value::Bool(x < y));
                }
                OpCode::LessEqual => {
                    let (x, y) = self.pop_number_pair("<=")?;
                    self.stack.push(Value::Bool(x <= y));
                }
                OpCode::Greater => {
                    let (x, y) = self.pop_number_pair(">")?;
                    self.stack.push(Value::Bool(x > y));
                }
                OpCode::GreaterEqual => {
                    let (x, y) = self.pop_number_pair(">=")?;
                    self.stack.push(Value::Bool(x >= y));
                }
                OpCode::Not => {
                    let value = self.pop()?;
                    self.stack.push(Value::Bool(!value.is_truthy()));
                }

                OpCode::LoadLocal => {
                    let slot = self.read_byte()? as usize;
                    let index = self.frame()?.stack_offset + slot;
                    let value = self
                        .stack
                        .get(index)
                        .cloned()
                        .ok_or_else(|| TmbdlError::internal("local slot out of range".to_string()))?;
                    self.stack.push(value);
                }
                OpCode::StoreLocal => {
                    let slot = self.read_byte()? as usize;
                    let index = self.frame()?.stack_offset + slot;
                    let value = self.peek(0)?.clone();
                    if index >= self.stack.len() {
                        return Err(TmbdlError::internal("local slot out of range".to_string()));
                    }
                    self.stack[index] = value;
                }
                OpCode::LoadGlobal => {
                    let name = self.read_name_constant()?;
                    match self.globals.get(name.as_str()) {
                        Some(value) => {
                            let value = value.clone();
                            self.stack.push(value);
                        }
                        None => {
                            let mut err =
                                TmbdlError::undefined_variable(&name, self.line as usize);
                            if let Some(closest) = find_closest_match(
                                &name,
                                self.globals.keys().map(|k| k.as_str()),
                            ) {
                                err = err.with_suggestion(closest.to_string());
                            }
                            return Err(err);
                        }
                    }
                }
                OpCode::StoreGlobal => {
                    let name = self.read_name_constant()?;
                    let value = self.peek(0)?.clone();
                    self.globals.insert(name.to_string(), value);
                }

                OpCode::Jump => {
                    let distance = self.read_byte()? as usize;
                    self.frame_mut()?.ip += distance;
                }
                OpCode::JumpIfFalse => {
                    let distance = self.read_byte()? as usize;
                    if !self.peek(0)?.is_truthy() {
                        self.frame_mut()?.ip += distance;
                    }
                }
                OpCode::JumpIfTrue => {
                    let distance = self.read_byte()? as usize;
                    if self.peek(0)?.is_truthy() {
                        self.frame_mut()?.ip += distance;
                    }
                }
                OpCode::Loop => {
                    let distance = self.read_byte()? as usize;
                    let frame = self.frame_mut()?;
                    frame.ip = frame.ip.checked_sub(distance).ok_or_else(|| {
                        TmbdlError::internal("loop target before chunk start".to_string())
                    })?;
                }

                OpCode::Call => {
                    let arg_count = self.read_byte()? as usize;
                    self.call_value(arg_count)?;
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self
                        .frames
                        .pop()
                        .ok_or_else(|| TmbdlError::internal("call frame stack underflow".to_string()))?;
                    self.close_upvalues(frame.stack_offset);
                    self.stack.truncate(frame.return_slot);
                    if self.frames.len() == base {
                        return Ok(result);
                    }
                    self.stack.push(result);
                }
                OpCode::MakeClosure => {
                    let constant = self.read_constant()?;
                    let function = match constant {
                        Constant::Function(f) => f,
                        other => {
                            return Err(TmbdlError::internal(format!(
                                "MAKE_CLOSURE needs a song constant, found {:?}",
                                other
                            )))
                        }
                    };
                    let count = function.upvalue_count as usize;
                    let mut descriptors = Vec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = self.read_byte()? != 0;
                        let index = self.read_byte()? as usize;
                        descriptors.push((is_local, index));
                    }
                    let stack_offset = self.frame()?.stack_offset;
                    let mut upvalues = Vec::with_capacity(count);
                    for (is_local, index) in descriptors {
                        if is_local {
                            upvalues.push(self.capture_upvalue(stack_offset + index));
                        } else {
                            let upvalue = self
                                .frame()?
                                .closure
                                .upvalues
                                .get(index)
                                .cloned()
                                .ok_or_else(|| {
                                    TmbdlError::internal(
                                        "upvalue descriptor out of range".to_string(),
                                    )
                                })?;
                            upvalues.push(upvalue);
                        }
                    }
                    self.stack.push(Value::Closure(Arc::new(Closure { function, upvalues })));
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let upvalue = self
                        .frame()?
                        .closure
                        .upvalues
                        .get(slot)
                        .cloned()
                        .ok_or_else(|| TmbdlError::internal("upvalue slot out of range".to_string()))?;
                    let value = match &*upvalue.lock().unwrap() {
                        Upvalue::Open(location) => self
                            .stack
                            .get(*location)
                            .cloned()
                            .ok_or_else(|| {
                                TmbdlError::internal("open upvalue past stack top".to_string())
                            })?,
                        Upvalue::Closed(value) => value.clone(),
                    };
                    self.stack.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte()? as usize;
                    let upvalue = self
                        .frame()?
                        .closure
                        .upvalues
                        .get(slot)
                        .cloned()
                        .ok_or_else(|| TmbdlError::internal("upvalue slot out of range".to_string()))?;
                    let value = self.peek(0)?.clone();
                    let mut cell = upvalue.lock().unwrap();
                    match &mut *cell {
                        Upvalue::Open(location) => {
                            let location = *location;
                            if location >= self.stack.len() {
                                return Err(TmbdlError::internal(
                                    "open upvalue past stack top".to_string(),
                                ));
                            }
                            self.stack[location] = value;
                        }
                        Upvalue::Closed(stored) => *stored = value,
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len().checked_sub(1).ok_or_else(|| {
                        TmbdlError::internal("value stack underflow".to_string())
                    })?;
                    self.close_upvalues(top);
                    self.pop()?;
                }

                OpCode::Print => {
                    let value = self.pop()?;
                    writeln!(self.out, "{}", value).map_err(|e| {
                        TmbdlError::internal(format!("failed to write output: {}", e))
                    })?;
                }
                OpCode::EyeOf => {
                    let value = self.pop()?;
                    let label = self.pop()?;
                    writeln!(self.debug_out, "{}:{}", label, value).map_err(|e| {
                        TmbdlError::internal(format!("failed to write debug output: {}", e))
                    })?;
                }

                OpCode::MakeArray => {
                    let count = self.read_byte()? as usize;
                    let start = self.stack.len().checked_sub(count).ok_or_else(|| {
                        TmbdlError::internal("value stack underflow".to_string())
                    })?;
                    let elements = self.stack.split_off(start);
                    self.stack.push(Value::array(elements));
                }
                OpCode::MakeObject => {
                    let count = self.read_byte()? as usize;
                    let start = self.stack.len().checked_sub(count * 2).ok_or_else(|| {
                        TmbdlError::internal("value stack underflow".to_string())
                    })?;
                    let items = self.stack.split_off(start);
                    let mut entries = indexmap::IndexMap::with_capacity(count);
                    for pair in items.chunks(2) {
                        match &pair[0] {
                            Value::Str(key) => {
                                entries.insert(key.to_string(), pair[1].clone());
                            }
                            other => {
                                return Err(self.runtime_error(
                                    ErrorKind::TypeMismatch,
                                    format!("Map keys must be strings, got {}", other.type_name()),
                                ))
                            }
                        }
                    }
                    self.stack.push(Value::map(entries));
                }
                OpCode::IndexGet => {
                    let index = self.pop()?;
                    let object = self.pop()?;
                    let value = self.index_get(object, index)?;
                    self.stack.push(value);
                }
                OpCode::IndexSet => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let object = self.pop()?;
                    self.index_set(object, index, value.clone())?;
                    self.stack.push(value);
                }
                OpCode::Length => {
                    let value = self.pop()?;
                    let length = match &value {
                        Value::Array(elements) => elements.lock().unwrap().len(),
                        Value::Str(s) => s.chars().count(),
                        other => {
                            return Err(self.runtime_error(
                                ErrorKind::TypeMismatch,
                                format!(
                                    "Only arrays and strings have a length, got {}",
                                    other.type_name()
                                ),
                            ))
                        }
                    };
                    self.stack.push(Value::Number(length as f64));
                }
                OpCode::GetProp => {
                    let name = self.read_name_constant()?;
                    let object = self.pop()?;
                    match object {
                        Value::Map(entries) => {
                            let value =
                                entries.lock().unwrap().get(name.as_str()).cloned().unwrap_or(Value::Null);
                            self.stack.push(value);
                        }
                        other => {
                            return Err(self.runtime_error(
                                ErrorKind::TypeMismatch,
                                format!("Only maps have properties, got {}", other.type_name()),
                            ))
                        }
                    }
                }
                OpCode::SetProp => {
                    let name = self.read_name_constant()?;
                    let value = self.pop()?;
                    let object = self.pop()?;
                    match object {
                        Value::Map(entries) => {
                            entries.lock().unwrap().insert(name.to_string(), value.clone());
                            self.stack.push(value);
                        }
                        other => {
                            return Err(self.runtime_error(
                                ErrorKind::TypeMismatch,
                                format!("Only maps have properties, got {}", other.type_name()),
                            ))
                        }
                    }
                }

                OpCode::Import => {
                    let key = self.read_name_constant()?;
                    let loader = self.loader.clone().ok_or_else(|| {
                        self.runtime_error(
                            ErrorKind::ModuleLoadFailure,
                            "No module loader installed".to_string(),
                        )
                    })?;
                    let exports = loader.load(
                        key.as_str(),
                        self.current_module.clone(),
                        self.module_cache.clone(),
                    )?;
                    self.stack.push(exports);
                }
                OpCode::Export => {
                    let name = self.read_name_constant()?;
                    let value = self.pop()?;
                    self.exports.lock().unwrap().insert(name.to_string(), value);
                }

                OpCode::Halt => {
                    return Ok(Value::Null);
                }
            }
        }
    }

    // === Indexing ===

    fn array_index(&self, n: f64, len: usize) -> Result<usize, TmbdlError> {
        if n.fract() != 0.0 || n < 0.0 {
            return Err(self.runtime_error(
                ErrorKind::IndexOutOfRange,
                format!("Array index must be a non-negative integer, got {}", n),
            ));
        }
        let index = n as usize;
        if index >= len {
            return Err(self.runtime_error(
                ErrorKind::IndexOutOfRange,
                format!("Index {} is out of range for length {}", index, len),
            ));
        }
        Ok(index)
    }

    fn index_get(&self, object: Value, index: Value) -> Result<Value, TmbdlError> {
        match (object, index) {
            (Value::Array(elements), Value::Number(n)) => {
                let elements = elements.lock().unwrap();
                let index = self.array_index(n, elements.len())?;
                Ok(elements[index].clone())
            }
            // out-of-range string indexing yields the empty string
            (Value::Str(s), Value::Number(n)) => {
                if n.fract() != 0.0 {
                    return Err(self.runtime_error(
                        ErrorKind::IndexOutOfRange,
                        format!("String index must be an integer, got {}", n),
                    ));
                }
                if n < 0.0 {
                    return Ok(Value::str(""));
                }
                let ch = s.chars().nth(n as usize);
                Ok(Value::str(ch.map(String::from).unwrap_or_default()))
            }
            (Value::Map(entries), Value::Str(key)) => {
                Ok(entries.lock().unwrap().get(key.as_str()).cloned().unwrap_or(Value::Null))
            }
            (Value::Map(_), other) => Err(self.runtime_error(
                ErrorKind::TypeMismatch,
                format!("Map keys must be strings, got {}", other.type_name()),
            )),
            (object @ (Value::Array(_) | Value::Str(_)), other) => Err(self.runtime_error(
                ErrorKind::TypeMismatch,
                format!(
                    "{} index must be a number, got {}",
                    object.type_name(),
                    other.type_name()
                ),
            )),
            (other, _) => Err(self.runtime_error(
                ErrorKind::TypeMismatch,
                format!("Cannot index into {}", other.type_name()),
            )),
        }
    }

    fn index_set(&self, object: Value, index: Value, value: Value) -> Result<(), TmbdlError> {
        match (object, index) {
            (Value::Array(elements), Value::Number(n)) => {
                let mut elements = elements.lock().unwrap();
                let len = elements.len();
                let index = self.array_index(n, len)?;
                elements[index] = value;
                Ok(())
            }
            (Value::Map(entries), Value::Str(key)) => {
                entries.lock().unwrap().insert(key.to_string(), value);
                Ok(())
            }
            (Value::Map(_), other) => Err(self.runtime_error(
                ErrorKind::TypeMismatch,
                format!("Map keys must be strings, got {}", other.type_name()),
            )),
            (Value::Array(_), other) => Err(self.runtime_error(
                ErrorKind::TypeMismatch,
                format!("Array index must be a number, got {}", other.type_name()),
            )),
            (other, _) => Err(self.runtime_error(
                ErrorKind::TypeMismatch,
                format!("Cannot index-assign into {}", other.type_name()),
            )),
        }
    }

    #[cfg(test)]
    pub(crate) fn stack_len(&self) -> usize {
        self.stack.len()
    }

    #[cfg(test)]
    pub(crate) fn open_upvalue_count(&self) -> usize {
        self.open_upvalues.len()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Install a host function into a VM's globals
pub fn register_native(vm: &mut Vm, name: &str, arity: i16, func: NativeFn) {
    vm.define_global(
        name,
        Value::Native(Arc::new(NativeFunction { name: name.to_string(), arity, func })),
    );
}
