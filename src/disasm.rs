// File: src/disasm.rs
//
// Human-readable listings of compiled chunks, used by the CLI's disasm
// command and the TMBDL_TRACE execution trace.

use std::fmt::Write;

use crate::bytecode::{Chunk, Constant, OpCode};

fn constant_text(constant: &Constant) -> String {
    match constant {
        Constant::Null => "nothing".to_string(),
        Constant::Bool(true) => "goldberry".to_string(),
        Constant::Bool(false) => "sauron".to_string(),
        Constant::Number(n) => crate::value::format_number(*n),
        Constant::Str(s) => format!("{:?}", s),
        Constant::Function(f) => format!("<song {}>", f.name),
    }
}

/// Render the instruction at `offset`; returns the text and the offset of
/// the next instruction
fn render_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = String::new();
    let line = chunk.line_at(offset);
    if offset > 0 && line == chunk.line_at(offset - 1) {
        let _ = write!(text, "{:04}    | ", offset);
    } else {
        let _ = write!(text, "{:04} {:4} ", offset, line);
    }

    let byte = match chunk.code.get(offset) {
        Some(b) => *b,
        None => {
            let _ = write!(text, "<end of chunk>");
            return (text, offset + 1);
        }
    };
    let op = match OpCode::from_byte(byte) {
        Some(op) => op,
        None => {
            let _ = write!(text, "<unknown 0x{:02x}>", byte);
            return (text, offset + 1);
        }
    };

    let operand = |i: usize| chunk.code.get(offset + i).copied().unwrap_or(0);

    match op {
        OpCode::PushConst
        | OpCode::LoadGlobal
        | OpCode::StoreGlobal
        | OpCode::GetProp
        | OpCode::SetProp
        | OpCode::Import
        | OpCode::Export => {
            let index = operand(1) as usize;
            let shown = chunk
                .constants
                .get(index)
                .map(constant_text)
                .unwrap_or_else(|| "<bad constant>".to_string());
            let _ = write!(text, "{:<16} {:4} {}", op.mnemonic(), index, shown);
            (text, offset + 2)
        }
        OpCode::LoadLocal
        | OpCode::StoreLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::MakeArray
        | OpCode::MakeObject => {
            let _ = write!(text, "{:<16} {:4}", op.mnemonic(), operand(1));
            (text, offset + 2)
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            let distance = operand(1) as usize;
            let _ = write!(text, "{:<16} {:4} -> {:04}", op.mnemonic(), distance, offset + 2 + distance);
            (text, offset + 2)
        }
        OpCode::Loop => {
            let distance = operand(1) as usize;
            let target = (offset + 2).saturating_sub(distance);
            let _ = write!(text, "{:<16} {:4} -> {:04}", op.mnemonic(), distance, target);
            (text, offset + 2)
        }
        OpCode::MakeClosure => {
            let index = operand(1) as usize;
            let (name, upvalue_count) = match chunk.constants.get(index) {
                Some(Constant::Function(f)) => (f.name.clone(), f.upvalue_count as usize),
                _ => ("<bad constant>".to_string(), 0),
            };
            let _ = write!(text, "{:<16} {:4} <song {}>", op.mnemonic(), index, name);
            let mut cursor = offset + 2;
            for _ in 0..upvalue_count {
                let is_local = operand(cursor - offset) != 0;
                let slot = operand(cursor - offset + 1);
                let _ = write!(
                    text,
                    "\n{:04}    |   {} {}",
                    cursor,
                    if is_local { "local" } else { "upvalue" },
                    slot
                );
                cursor += 2;
            }
            (text, cursor)
        }
        _ => {
            let _ = write!(text, "{}", op.mnemonic());
            (text, offset + 1)
        }
    }
}

/// One-line rendering of the instruction at `offset` (for execution traces)
pub fn instruction_at(chunk: &Chunk, offset: usize) -> String {
    render_instruction(chunk, offset).0
}

/// Full listing of a chunk followed by every nested song it interns
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0usize;
    while offset < chunk.code.len() {
        let (text, next) = render_instruction(chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    for constant in &chunk.constants {
        if let Constant::Function(function) = constant {
            out.push('\n');
            out.push_str(&disassemble_chunk(&function.chunk, &function.name));
        }
    }
    out
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

    #[test]
    fn listing_covers_every_byte_once() {
        let chunk = compile("ring i = 0 wander (i < 3) { i = i + 1 sing i }");
        let listing = disassemble_chunk(&chunk, "<main>");
        assert!(listing.contains("JUMP_IF_FALSE"));
        assert!(listing.contains("LOOP"));
        assert!(listing.contains("HALT"));
    }

    #[test]
    fn nested_songs_are_listed_with_descriptors() {
        let chunk = compile("song make() { ring x = 1 song get() { answer x } answer get }");
        let listing = disassemble_chunk(&chunk, "<main>");
        assert!(listing.contains("== make =="));
        assert!(listing.contains("== get =="));
        assert!(listing.contains("MAKE_CLOSURE"));
        assert!(listing.contains("local"));
    }
}
