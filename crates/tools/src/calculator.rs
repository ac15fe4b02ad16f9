//! Calculator tool: evaluates arithmetic expressions.
//!
//! Grammar, by increasing precedence: `+ -`, `* / %`, unary `-`, `^`
//! (right-associative), then numbers and parentheses. Parsed by precedence
//! climbing over a token list.

use async_trait::async_trait;
use hearth_core::{ParamType, Tool, ToolArguments, ToolError, ToolParameter};

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression. Supports + - * / % ^ and parentheses."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::required(
            "expression",
            ParamType::String,
            "The expression to evaluate, e.g. '(2 + 3) * 4'",
        )]
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<String, ToolError> {
        let expression = arguments.str("expression")?;
        let value = evaluate(expression).map_err(|reason| ToolError::ExecutionFailed {
            tool_name: "calculator".into(),
            reason,
        })?;
        Ok(format_number(value))
    }
}

/// Integers print without a fractional part.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

pub fn evaluate(expression: &str) -> Result<f64, String> {
    let tokens = lex(expression)?;
    if tokens.is_empty() {
        return Err("empty expression".into());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expression(0)?;
    match parser.tokens.get(parser.pos) {
        None => Ok(value),
        Some(tok) => Err(format!("unexpected {tok:?} at token {}", parser.pos + 1)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tok {
    Num(f64),
    Op(char),
    Open,
    Close,
}

fn lex(input: &str) -> Result<Vec<Tok>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '+' | '-' | '*' | '/' | '%' | '^' => tokens.push(Tok::Op(c)),
            '(' => tokens.push(Tok::Open),
            ')' => tokens.push(Tok::Close),
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = start + 1;
                while let Some(&(i, d)) = chars.peek() {
                    if !(d.is_ascii_digit() || d == '.') {
                        break;
                    }
                    end = i + 1;
                    chars.next();
                }
                let text = &input[start..end];
                let n = text.parse().map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Tok::Num(n));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

/// Binding power and right-associativity of a binary operator.
fn binding(op: char) -> Option<(u8, bool)> {
    match op {
        '+' | '-' => Some((1, false)),
        '*' | '/' | '%' => Some((2, false)),
        '^' => Some((4, true)),
        _ => None,
    }
}

const UNARY_POWER: u8 = 3;

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).copied();
        self.pos += usize::from(tok.is_some());
        tok
    }

    fn expression(&mut self, min_power: u8) -> Result<f64, String> {
        let mut lhs = self.operand()?;
        while let Some(Tok::Op(op)) = self.tokens.get(self.pos).copied() {
            let Some((power, right_assoc)) = binding(op) else {
                break;
            };
            if power < min_power {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(if right_assoc { power } else { power + 1 })?;
            lhs = apply(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn operand(&mut self) -> Result<f64, String> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(n),
            Some(Tok::Op('-')) => Ok(-self.expression(UNARY_POWER)?),
            Some(Tok::Open) => {
                let value = self.expression(0)?;
                match self.next() {
                    Some(Tok::Close) => Ok(value),
                    _ => Err("missing closing parenthesis".into()),
                }
            }
            Some(tok) => Err(format!("unexpected {tok:?}")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

fn apply(op: char, lhs: f64, rhs: f64) -> Result<f64, String> {
    match op {
        '+' => Ok(lhs + rhs),
        '-' => Ok(lhs - rhs),
        '*' => Ok(lhs * rhs),
        '/' | '%' if rhs == 0.0 => Err("division by zero".into()),
        '/' => Ok(lhs / rhs),
        '%' => Ok(lhs % rhs),
        '^' => Ok(lhs.powf(rhs)),
        _ => Err(format!("unknown operator '{op}'")),
    }
}
