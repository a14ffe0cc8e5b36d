// File: src/errors.rs
//
// Error handling and reporting for the Tmbdl language.
// Provides structured error types with source location information
// and pretty-printed error messages.

use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub file: Option<String>,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column, file: None }
    }

    /// Location known only down to the line (recovered from a chunk's line table)
    pub fn at_line(line: usize) -> Self {
        Self { line, column: 0, file: None }
    }

    pub fn unknown() -> Self {
        Self { line: 0, column: 0, file: None }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:", file)?;
        }
        if self.column == 0 {
            write!(f, "line {}", self.line)
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// Types of errors that can occur while parsing, compiling, or running Tmbdl code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ParseError,
    CompileError,
    TypeMismatch,
    DivisionByZero,
    UndefinedVariable,
    ArityMismatch,
    IndexOutOfRange,
    StackOverflow,
    ModuleLoadFailure,
    CorruptBytecode,
    InternalInvariant,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::ParseError => write!(f, "Parse Error"),
            ErrorKind::CompileError => write!(f, "Compile Error"),
            ErrorKind::TypeMismatch => write!(f, "Type Mismatch"),
            ErrorKind::DivisionByZero => write!(f, "Division By Zero"),
            ErrorKind::UndefinedVariable => write!(f, "Undefined Variable"),
            ErrorKind::ArityMismatch => write!(f, "Arity Mismatch"),
            ErrorKind::IndexOutOfRange => write!(f, "Index Out Of Range"),
            ErrorKind::StackOverflow => write!(f, "Stack Overflow"),
            ErrorKind::ModuleLoadFailure => write!(f, "Module Load Failure"),
            ErrorKind::CorruptBytecode => write!(f, "Corrupt Bytecode"),
            ErrorKind::InternalInvariant => write!(f, "Internal Invariant Violated"),
        }
    }
}

/// A structured error with location information
#[derive(Debug, Clone)]
pub struct TmbdlError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
    pub source_line: Option<String>,
    pub suggestion: Option<String>,
    pub note: Option<String>,
}

impl TmbdlError {
    pub fn new(kind: ErrorKind, message: String, location: SourceLocation) -> Self {
        Self { kind, message, location, source_line: None, suggestion: None, note: None }
    }

    pub fn with_source(mut self, source_line: String) -> Self {
        self.source_line = Some(source_line);
        self
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.note = Some(note);
        self
    }

    pub fn parse_error(message: String, location: SourceLocation) -> Self {
        Self::new(ErrorKind::ParseError, message, location)
    }

    pub fn compile_error(message: String, line: usize) -> Self {
        Self::new(ErrorKind::CompileError, message, SourceLocation::at_line(line))
    }

    pub fn type_mismatch(message: String, line: usize) -> Self {
        Self::new(ErrorKind::TypeMismatch, message, SourceLocation::at_line(line))
    }

    pub fn undefined_variable(name: &str, line: usize) -> Self {
        Self::new(
            ErrorKind::UndefinedVariable,
            format!("Variable '{}' is not defined", name),
            SourceLocation::at_line(line),
        )
    }

    pub fn arity_mismatch(name: &str, expected: usize, got: usize, line: usize) -> Self {
        Self::new(
            ErrorKind::ArityMismatch,
            format!("'{}' expects {} argument(s) but got {}", name, expected, got),
            SourceLocation::at_line(line),
        )
    }

    pub fn corrupt_bytecode(message: String) -> Self {
        Self::new(ErrorKind::CorruptBytecode, message, SourceLocation::unknown())
    }

    pub fn internal(message: String) -> Self {
        Self::new(ErrorKind::InternalInvariant, message, SourceLocation::unknown())
    }
}

impl fmt::Display for TmbdlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind_str = format!("{}", self.kind);
        writeln!(f, "{}: {}", kind_str.red().bold(), self.message.bold())?;

        if self.location != SourceLocation::unknown() {
            let location_str = format!("  --> {}", self.location);
            writeln!(f, "{}", location_str.bright_blue())?;
        }

        if let Some(ref source) = self.source_line {
            let line_num = self.location.line;
            let col_num = self.location.column;

            writeln!(f, "   {}", "|".bright_blue())?;
            writeln!(
                f,
                "{} {} {}",
                format!("{:3}", line_num).bright_blue(),
                "|".bright_blue(),
                source
            )?;
            writeln!(
                f,
                "   {} {}{}",
                "|".bright_blue(),
                " ".repeat(col_num.saturating_sub(1)),
                "^".red().bold()
            )?;
        }

        if let Some(ref suggestion) = self.suggestion {
            writeln!(
                f,
                "   {} {}",
                "=".bright_green(),
                format!("Did you mean '{}'?", suggestion).bright_green()
            )?;
        }

        if let Some(ref note) = self.note {
            writeln!(f, "   {} {}", "=".bright_cyan(), format!("note: {}", note).bright_cyan())?;
        }

        Ok(())
    }
}

impl std::error::Error for TmbdlError {}

/// Computes the Levenshtein distance between two strings
/// Used for "Did you mean?" suggestions
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for (i, row) in matrix.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            matrix[i][j] = std::cmp::min(
                std::cmp::min(
                    matrix[i - 1][j] + 1, // deletion
                    matrix[i][j - 1] + 1, // insertion
                ),
                matrix[i - 1][j - 1] + cost, // substitution
            );
        }
    }

    matrix[len1][len2]
}

/// Find the closest match from a list of candidates using Levenshtein distance
/// Returns None if no good match is found (distance > 3)
pub fn find_closest_match<'a, I>(target: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best_match = None;
    let mut best_distance = usize::MAX;

    for candidate in candidates {
        let distance = levenshtein_distance(target, candidate);
        if distance <= 3 && distance < best_distance {
            best_distance = distance;
            best_match = Some(candidate);
        }
    }

    best_match
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("abc", "abc"), 0);
        assert_eq!(levenshtein_distance("count", "cont"), 1);
    }

    #[test]
    fn closest_match_rejects_distant_names() {
        let names = ["makeCounter", "clock", "random"];
        assert_eq!(find_closest_match("makeCouter", names.iter().copied()), Some("makeCounter"));
        assert_eq!(find_closest_match("zzzzzz", names.iter().copied()), None);
    }
}
