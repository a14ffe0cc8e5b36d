// File: src/serializer.rs
//
// Binary container for compiled Tmbdl bytecode (`.tmbdlc`). Big-endian,
// byte-oriented:
//
//   header : magic "TMBDL" (5 bytes), version u8
//   body   : functionCount u32
//            function[0..functionCount]
//            mainIndex u32
//
//   function: name string, arity u16, upvalueCount u16,
//             constantCount u32, constant..., codeLength u32, code bytes,
//             lineCount u32, lineEntry u16...
//
//   constant: tag u8 (0 null, 1 bool, 2 number, 3 string, 4 function),
//             payload; function payloads are u32 indices into the
//             flattened function list
//
//   string  : length u32, UTF-8 bytes
//
// The function graph is flattened depth-first in pre-order, so every
// function reference points at a higher index than its holder. The reader
// rebuilds from the highest index down and rejects anything else.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bytecode::{Chunk, CompiledFunction, Constant};
use crate::errors::TmbdlError;

pub const BYTECODE_MAGIC: &[u8; 5] = b"TMBDL";
pub const BYTECODE_VERSION: u8 = 1;

// === Writing ===

struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_be_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.bytes.extend_from_slice(&v.to_be_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes.extend_from_slice(s.as_bytes());
    }
}

/// Assign indices with a pre-order depth-first walk from main through the
/// function constants of each chunk
fn collect_functions(
    function: &Arc<CompiledFunction>,
    order: &mut Vec<Arc<CompiledFunction>>,
    seen: &mut HashMap<usize, u32>,
) {
    let key = Arc::as_ptr(function) as usize;
    if seen.contains_key(&key) {
        return;
    }
    seen.insert(key, order.len() as u32);
    order.push(function.clone());
    for constant in &function.chunk.constants {
        if let Constant::Function(nested) = constant {
            collect_functions(nested, order, seen);
        }
    }
}

fn write_function(
    writer: &mut ByteWriter,
    function: &CompiledFunction,
    indices: &HashMap<usize, u32>,
) {
    writer.string(&function.name);
    writer.u16(function.arity);
    writer.u16(function.upvalue_count);

    let chunk = &function.chunk;
    writer.u32(chunk.constants.len() as u32);
    for constant in &chunk.constants {
        match constant {
            Constant::Null => writer.u8(0x00),
            Constant::Bool(b) => {
                writer.u8(0x01);
                writer.u8(*b as u8);
            }
            Constant::Number(n) => {
                writer.u8(0x02);
                writer.f64(*n);
            }
            Constant::Str(s) => {
                writer.u8(0x03);
                writer.string(s);
            }
            Constant::Function(nested) => {
                writer.u8(0x04);
                let index = indices[&(Arc::as_ptr(nested) as usize)];
                writer.u32(index);
            }
        }
    }

    writer.u32(chunk.code.len() as u32);
    writer.bytes.extend_from_slice(&chunk.code);

    writer.u32(chunk.lines.len() as u32);
    for line in &chunk.lines {
        writer.u16(*line);
    }
}

/// Serialize a main chunk and every function it reaches into the container
pub fn serialize(chunk: &Chunk) -> Vec<u8> {
    let main = Arc::new(CompiledFunction {
        name: "<main>".to_string(),
        arity: 0,
        upvalue_count: 0,
        chunk: chunk.clone(),
    });

    let mut order = Vec::new();
    let mut indices = HashMap::new();
    collect_functions(&main, &mut order, &mut indices);

    let mut writer = ByteWriter::new();
    writer.bytes.extend_from_slice(BYTECODE_MAGIC);
    writer.u8(BYTECODE_VERSION);
    writer.u32(order.len() as u32);
    for function in &order {
        write_function(&mut writer, function, &indices);
    }
    writer.u32(0); // main is always the DFS root

    writer.bytes
}

// === Reading ===

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], TmbdlError> {
        let end = self.pos.checked_add(count).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(TmbdlError::corrupt_bytecode("Unexpected end of bytecode".to_string())),
        }
    }

    fn u8(&mut self) -> Result<u8, TmbdlError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, TmbdlError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, TmbdlError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn f64(&mut self) -> Result<f64, TmbdlError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(f64::from_be_bytes(buf))
    }

    fn string(&mut self) -> Result<String, TmbdlError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| TmbdlError::corrupt_bytecode("Invalid UTF-8 in string".to_string()))
    }
}

enum RawConstant {
    Plain(Constant),
    FunctionRef(u32),
}

struct RawFunction {
    name: String,
    arity: u16,
    upvalue_count: u16,
    constants: Vec<RawConstant>,
    code: Vec<u8>,
    lines: Vec<u16>,
}

fn read_function(reader: &mut ByteReader) -> Result<RawFunction, TmbdlError> {
    let name = reader.string()?;
    let arity = reader.u16()?;
    let upvalue_count = reader.u16()?;

    let constant_count = reader.u32()? as usize;
    let mut constants = Vec::with_capacity(constant_count.min(1024));
    for _ in 0..constant_count {
        let tag = reader.u8()?;
        let constant = match tag {
            0x00 => RawConstant::Plain(Constant::Null),
            0x01 => RawConstant::Plain(Constant::Bool(reader.u8()? != 0)),
            0x02 => RawConstant::Plain(Constant::Number(reader.f64()?)),
            0x03 => RawConstant::Plain(Constant::str(reader.string()?)),
            0x04 => RawConstant::FunctionRef(reader.u32()?),
            other => {
                return Err(TmbdlError::corrupt_bytecode(format!(
                    "Unknown constant tag 0x{:02x}",
                    other
                )))
            }
        };
        constants.push(constant);
    }

    let code_len = reader.u32()? as usize;
    let code = reader.take(code_len)?.to_vec();

    let line_count = reader.u32()? as usize;
    if line_count != code_len {
        return Err(TmbdlError::corrupt_bytecode(
            "Line table length does not match code length".to_string(),
        ));
    }
    let mut lines = Vec::with_capacity(line_count.min(65536));
    for _ in 0..line_count {
        lines.push(reader.u16()?);
    }

    Ok(RawFunction { name, arity, upvalue_count, constants, code, lines })
}

/// Deserialize a container back into its main chunk. Function-reference
/// constants are fixed up from the highest index down, which the pre-order
/// layout guarantees is dependency order.
pub fn deserialize(data: &[u8]) -> Result<Chunk, TmbdlError> {
    let mut reader = ByteReader::new(data);

    let magic = reader.take(BYTECODE_MAGIC.len())?;
    if magic != BYTECODE_MAGIC {
        return Err(TmbdlError::corrupt_bytecode("Bad magic number".to_string()));
    }
    let version = reader.u8()?;
    if version != BYTECODE_VERSION {
        return Err(TmbdlError::corrupt_bytecode(format!(
            "Unsupported bytecode version {} (expected {})",
            version, BYTECODE_VERSION
        )));
    }

    let function_count = reader.u32()? as usize;
    if function_count == 0 {
        return Err(TmbdlError::corrupt_bytecode("Empty function table".to_string()));
    }
    let mut raw_functions = Vec::with_capacity(function_count.min(1024));
    for _ in 0..function_count {
        raw_functions.push(read_function(&mut reader)?);
    }

    let main_index = reader.u32()? as usize;
    if main_index >= function_count {
        return Err(TmbdlError::corrupt_bytecode("Main index out of range".to_string()));
    }
    if reader.pos != data.len() {
        return Err(TmbdlError::corrupt_bytecode("Trailing bytes after container".to_string()));
    }

    let mut built: Vec<Option<Arc<CompiledFunction>>> = vec![None; function_count];
    for index in (0..function_count).rev() {
        let raw = &mut raw_functions[index];
        let mut constants = Vec::with_capacity(raw.constants.len());
        for constant in raw.constants.drain(..) {
            match constant {
                RawConstant::Plain(c) => constants.push(c),
                RawConstant::FunctionRef(target) => {
                    let target = target as usize;
                    // pre-order flattening puts callees after their holder
                    if target <= index || target >= function_count {
                        return Err(TmbdlError::corrupt_bytecode(format!(
                            "Invalid function reference {} in function {}",
                            target, index
                        )));
                    }
                    let function = built[target].clone().ok_or_else(|| {
                        TmbdlError::corrupt_bytecode(
                            "Unresolved function reference".to_string(),
                        )
                    })?;
                    constants.push(Constant::Function(function));
                }
            }
        }
        built[index] = Some(Arc::new(CompiledFunction {
            name: std::mem::take(&mut raw.name),
            arity: raw.arity,
            upvalue_count: raw.upvalue_count,
            chunk: Chunk {
                code: std::mem::take(&mut raw.code),
                constants,
                lines: std::mem::take(&mut raw.lines),
            },
        }));
    }

    let main = built[main_index]
        .clone()
        .ok_or_else(|| TmbdlError::corrupt_bytecode("Missing main function".to_string()))?;
    Ok(main.chunk.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::lexer::tokenize;
    use crate::parser::Parser;

    fn compile(source: &str) -> Chunk {
        let tokens = tokenize(source).unwrap();
        let ast = Parser::new(tokens).parse().unwrap();
        Compiler::new().compile(&ast).unwrap()
    }

    /// Structural chunk equality: identical code, lines, and constants,
    /// with nested functions compared by value
    fn assert_chunks_equal(a: &Chunk, b: &Chunk) {
        assert_eq!(a.code, b.code);
        assert_eq!(a.lines, b.lines);
        assert_eq!(a.constants.len(), b.constants.len());
        for (left, right) in a.constants.iter().zip(&b.constants) {
            match (left, right) {
                (Constant::Function(x), Constant::Function(y)) => {
                    assert_eq!(x.name, y.name);
                    assert_eq!(x.arity, y.arity);
                    assert_eq!(x.upvalue_count, y.upvalue_count);
                    assert_chunks_equal(&x.chunk, &y.chunk);
                }
                (left, right) => assert_eq!(left, right),
            }
        }
    }

    #[test]
    fn round_trip_preserves_a_flat_program() {
        let chunk = compile("ring a = 1 sing a + 2.5 sing `v=${a}`");
        let bytes = serialize(&chunk);
        let back = deserialize(&bytes).unwrap();
        assert_chunks_equal(&chunk, &back);
    }

    #[test]
    fn round_trip_preserves_nested_closures() {
        let chunk = compile(
            "song makeCounter() {\n\
             ring c = 0\n\
             song inc() { c = c + 1 answer c }\n\
             answer inc\n\
             }\n\
             ring f = makeCounter()",
        );
        let bytes = serialize(&chunk);
        let back = deserialize(&bytes).unwrap();
        assert_chunks_equal(&chunk, &back);
    }

    #[test]
    fn header_starts_with_magic_and_version() {
        let bytes = serialize(&compile("sing 1"));
        assert_eq!(&bytes[0..5], BYTECODE_MAGIC);
        assert_eq!(bytes[5], BYTECODE_VERSION);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = serialize(&compile("sing 1"));
        bytes[0] = b'X';
        let err = deserialize(&bytes).unwrap_err();
        assert!(err.message.contains("magic"));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut bytes = serialize(&compile("sing 1"));
        bytes[5] = BYTECODE_VERSION + 1;
        let err = deserialize(&bytes).unwrap_err();
        assert!(err.message.contains("version"));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = serialize(&compile("sing 1 sing 2"));
        for len in [4, 6, 10, bytes.len() - 1] {
            assert!(deserialize(&bytes[..len]).is_err());
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = serialize(&compile("sing 1"));
        bytes.push(0);
        let err = deserialize(&bytes).unwrap_err();
        assert!(err.message.contains("Trailing"));
    }

    #[test]
    fn self_referential_function_indices_are_rejected() {
        // function 0 claiming a constant that references function 0 would
        // need a cycle, which the pre-order layout forbids
        let chunk = compile("sing 1");
        let bytes = serialize(&chunk);
        // hand-build a container whose single function references itself
        let mut forged = Vec::new();
        forged.extend_from_slice(BYTECODE_MAGIC);
        forged.push(BYTECODE_VERSION);
        forged.extend_from_slice(&1u32.to_be_bytes()); // one function
        forged.extend_from_slice(&4u32.to_be_bytes()); // name "main"
        forged.extend_from_slice(b"main");
        forged.extend_from_slice(&0u16.to_be_bytes()); // arity
        forged.extend_from_slice(&0u16.to_be_bytes()); // upvalues
        forged.extend_from_slice(&1u32.to_be_bytes()); // one constant
        forged.push(0x04);
        forged.extend_from_slice(&0u32.to_be_bytes()); // references itself
        forged.extend_from_slice(&0u32.to_be_bytes()); // no code
        forged.extend_from_slice(&0u32.to_be_bytes()); // no lines
        forged.extend_from_slice(&0u32.to_be_bytes()); // main index
        assert!(deserialize(&forged).is_err());
        // and the honest container still parses
        assert!(deserialize(&bytes).is_ok());
    }
}
