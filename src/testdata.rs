//! Parser for the `##?` expected-output annotations used by test
//! harnesses.
//!
//! A test program carries a header line `##? [d1,d2,...] type` (`~`
//! denotes the infinite dimension) followed by data lines of the form
//! `##? ( v, v, ... )`. Dimension 0 is the line axis: each data line
//! holds one element covering the remaining dimensions, so a rank-1
//! signal is one bare value per line. A value containing a dot is
//! parsed as a real even for integer-typed signals, which is an error.

use crate::frontend::types::{Dim, PrimType};
use thiserror::Error;

/// Error while parsing test data.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct TestDataError {
    pub message: String,
}

impl TestDataError {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// One parsed element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TestElement {
    Bool(bool),
    Int(i64),
    Real32(f32),
    Real64(f64),
}

/// A parsed test signal: declared size, element type, and the values in
/// row-major order.
#[derive(Debug, Clone)]
pub struct TestSignal {
    pub size: Vec<Dim>,
    pub ty: PrimType,
    pub data: Vec<TestElement>,
}

impl TestSignal {
    /// Parse the first `##?` signal found in the given text.
    pub fn parse(text: &str) -> Result<TestSignal, TestDataError> {
        let mut lines = text.lines();

        let header = loop {
            let Some(line) = lines.next() else {
                return Err(TestDataError::new("No '##?' header found."));
            };
            if let Some(pos) = line.find("##?") {
                break line[pos + 3..].trim().to_string();
            }
        };

        let (size, ty) = parse_header(&header)?;

        let mut signal = TestSignal { size, ty, data: Vec::new() };
        for line in lines {
            let Some(pos) = line.find("##?") else { continue };
            let mut chars = Cursor::new(&line[pos + 3..]);
            signal.parse_element(&mut chars, 0)?;
            chars.skip_space();
            if chars.peek().is_some() {
                return Err(TestDataError::new("Trailing data after element."));
            }
        }
        Ok(signal)
    }

    /// Number of data lines parsed; the extent along dimension 0 for
    /// finite signals, the number of steps provided for streams.
    pub fn line_count(&self) -> usize {
        let inner: usize = self
            .size
            .iter()
            .skip(1)
            .map(|d| d.extent().unwrap_or(0) as usize)
            .product();
        if inner == 0 {
            self.data.len()
        } else {
            self.data.len() / inner
        }
    }

    fn parse_element(&mut self, chars: &mut Cursor, depth: usize) -> Result<(), TestDataError> {
        chars.skip_space();
        match chars.peek() {
            Some('(') => self.parse_list(chars, depth),
            Some(_) => self.parse_value(chars, depth),
            None => Err(TestDataError::new("Expected an element.")),
        }
    }

    fn parse_list(&mut self, chars: &mut Cursor, depth: usize) -> Result<(), TestDataError> {
        chars.expect('(')?;
        let dim = depth + 1;
        if dim + 1 > self.size.len() {
            return Err(TestDataError::new("Too many dimensions."));
        }
        let extent = self.size[dim].extent();

        let mut count = 0i64;
        loop {
            self.parse_element(chars, dim)?;
            count += 1;
            chars.skip_space();
            match chars.peek() {
                Some(',') => {
                    chars.next();
                    if let Some(extent) = extent {
                        if count >= extent {
                            return Err(TestDataError::new(format!(
                                "Too many elements in dimension {}.",
                                dim
                            )));
                        }
                    }
                }
                _ => break,
            }
        }
        chars.expect(')')?;

        if let Some(extent) = extent {
            if count < extent {
                return Err(TestDataError::new(format!(
                    "Too few elements in dimension {}.",
                    dim
                )));
            }
        }
        Ok(())
    }

    fn parse_value(&mut self, chars: &mut Cursor, depth: usize) -> Result<(), TestDataError> {
        if depth + 1 != self.size.len() {
            return Err(TestDataError::new("Value at wrong nesting level."));
        }

        let mut text = String::new();
        let mut has_dot = false;

        if matches!(chars.peek(), Some('-') | Some('+')) {
            text.push(chars.next().unwrap());
        }
        if !chars.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            return Err(TestDataError::new("Could not parse value."));
        }
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                text.push(c);
            } else if c == '.' && !has_dot {
                has_dot = true;
                text.push(c);
            } else {
                break;
            }
            chars.next();
        }

        self.store_value(&text, has_dot)
    }

    fn store_value(&mut self, text: &str, real: bool) -> Result<(), TestDataError> {
        let element = match self.ty {
            PrimType::Real64 | PrimType::Real32 => {
                let v: f64 = text
                    .parse()
                    .map_err(|_| TestDataError::new(format!("Could not parse value: {}", text)))?;
                if self.ty == PrimType::Real64 {
                    TestElement::Real64(v)
                } else {
                    TestElement::Real32(v as f32)
                }
            }
            PrimType::Int => {
                if real {
                    return Err(TestDataError::new(format!(
                        "Real value in integer signal: {}",
                        text
                    )));
                }
                let v: i64 = text
                    .parse()
                    .map_err(|_| TestDataError::new(format!("Could not parse value: {}", text)))?;
                TestElement::Int(v)
            }
            PrimType::Bool => {
                let v: i64 = text
                    .parse()
                    .map_err(|_| TestDataError::new(format!("Could not parse value: {}", text)))?;
                TestElement::Bool(v != 0)
            }
        };
        self.data.push(element);
        Ok(())
    }
}

fn parse_header(header: &str) -> Result<(Vec<Dim>, PrimType), TestDataError> {
    let mut size = Vec::new();
    let mut rest = header;

    if let Some(open) = rest.find('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| TestDataError::new("Could not parse array size."))?;
        for part in rest[open + 1..close].split(',') {
            let part = part.trim();
            if part == "~" {
                size.push(Dim::Infinite);
            } else {
                let v: i64 = part
                    .parse()
                    .map_err(|_| TestDataError::new("Could not parse array size."))?;
                size.push(Dim::Finite(v));
            }
        }
        rest = &rest[close + 1..];
    }
    if size.is_empty() {
        size.push(Dim::Finite(1));
    }

    let type_str = rest.split_whitespace().next().unwrap_or("");
    let ty = match type_str {
        "bool" => PrimType::Bool,
        "int" => PrimType::Int,
        "real32" => PrimType::Real32,
        "real64" => PrimType::Real64,
        "" => return Err(TestDataError::new("Could not parse data type.")),
        other => {
            return Err(TestDataError::new(format!("Invalid type name: {}", other)))
        }
    };

    Ok((size, ty))
}

/// A one-character-lookahead cursor over a line.
struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(text: &str) -> Self {
        Self { chars: text.chars().collect(), pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_space(&mut self) {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), TestDataError> {
        self.skip_space();
        match self.next() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(TestDataError::new(format!(
                "Expected '{}' but got '{}'.",
                expected, c
            ))),
            None => Err(TestDataError::new(format!(
                "Expected '{}' but got end of line.",
                expected
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_stream() {
        let text = "\
##? [~] real64
##? 1.5
##? -2
##? +0.25
";
        let signal = TestSignal::parse(text).unwrap();
        assert_eq!(signal.size, vec![Dim::Infinite]);
        assert_eq!(signal.ty, PrimType::Real64);
        assert_eq!(
            signal.data,
            vec![
                TestElement::Real64(1.5),
                TestElement::Real64(-2.0),
                TestElement::Real64(0.25)
            ]
        );
        assert_eq!(signal.line_count(), 3);
    }

    #[test]
    fn test_nested_rows() {
        let text = "\
##? [~,2] int
##? ( 1, 2 )
##? ( 3, 4 )
";
        let signal = TestSignal::parse(text).unwrap();
        assert_eq!(
            signal.data,
            vec![
                TestElement::Int(1),
                TestElement::Int(2),
                TestElement::Int(3),
                TestElement::Int(4)
            ]
        );
        assert_eq!(signal.line_count(), 2);
    }

    #[test]
    fn test_row_arity_checked() {
        let long = "##? [~,2] int\n##? ( 1, 2, 3 )\n";
        assert!(TestSignal::parse(long).is_err());
        let short = "##? [~,2] int\n##? ( 1 )\n";
        assert!(TestSignal::parse(short).is_err());
    }

    #[test]
    fn test_scalar_where_list_required() {
        let text = "##? [~,2] int\n##? 7\n";
        assert!(TestSignal::parse(text).is_err());
    }

    #[test]
    fn test_dot_forces_real_parse() {
        let text = "##? [~] int\n##? 1.5\n";
        assert!(TestSignal::parse(text).is_err());
    }

    #[test]
    fn test_invalid_type_name() {
        assert!(TestSignal::parse("##? [4] quux\n").is_err());
    }
}
