//! Row filters such as `Dox == 10.0 and not (time > 5)`.
//!
//! Grammar:
//!
//! ```text
//! expr       := and ("or" and)*
//! and        := unary ("and" unary)*
//! unary      := "not" unary | "(" expr ")" | comparison
//! comparison := column op literal
//! column     := identifier | `back-quoted name`
//! literal    := number | 'text' | "text" | True | False
//! ```

use crate::{
    error::OpError,
    experiment::{Column, Experiment},
};
use std::{cmp::Ordering, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        column: String,
        op: CompareOp,
        value: Literal,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subset {
    source: String,
    expr: Expr,
}

impl fmt::Display for Subset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Text(String),
    Bool(bool),
    Op(CompareOp),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = vec![];
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (CompareOp::Eq, 2),
                    ('!', Some('=')) => (CompareOp::Ne, 2),
                    ('<', Some('=')) => (CompareOp::Le, 2),
                    ('>', Some('=')) => (CompareOp::Ge, 2),
                    ('<', _) => (CompareOp::Lt, 1),
                    ('>', _) => (CompareOp::Gt, 1),
                    _ => return Err(format!("unexpected '{c}' at position {i}")),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            '\'' | '"' | '`' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&x| x == c)
                    .ok_or_else(|| format!("unterminated {c} quote at position {i}"))?;
                let text: String = chars[i + 1..i + 1 + end].iter().collect();
                tokens.push(if c == '`' {
                    Token::Ident(text)
                } else {
                    Token::Text(text)
                });
                i += end + 2;
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() {
                    let x = chars[i];
                    let exponent_sign =
                        (x == '-' || x == '+') && matches!(chars[i - 1], 'e' | 'E');
                    if x.is_ascii_digit() || x == '.' || x == 'e' || x == 'E' || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| format!("could not parse number '{text}'"))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "True" | "true" => Token::Bool(true),
                    "False" | "false" => Token::Bool(false),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected '{other}' at position {i}")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.unary()?))),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("missing ')'".to_string()),
                }
            }
            Some(Token::Ident(column)) => {
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    other => {
                        return Err(format!(
                            "expected a comparison after '{column}', found {other:?}"
                        ));
                    }
                };
                let value = match self.next() {
                    Some(Token::Number(x)) => Literal::Number(x),
                    Some(Token::Text(s)) => Literal::Text(s),
                    Some(Token::Bool(b)) => Literal::Bool(b),
                    other => return Err(format!("expected a value, found {other:?}")),
                };
                Ok(Expr::Compare { column, op, value })
            }
            other => Err(format!("expected a condition, found {other:?}")),
        }
    }
}

impl Subset {
    pub fn parse(source: &str) -> Result<Self, OpError> {
        let invalid =
            |why: String| OpError::invalid(format!("Subset string '{source}' isn't valid: {why}"));
        let tokens = tokenize(source).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("it is empty".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr().map_err(invalid)?;
        if parser.pos < parser.tokens.len() {
            return Err(invalid(format!(
                "unexpected trailing {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn mask(&self, experiment: &Experiment) -> Result<Vec<bool>, OpError> {
        eval(&self.expr, experiment).map_err(|why| {
            OpError::invalid(format!("Subset string '{}' isn't valid: {why}", self.source))
        })
    }

    /// Rows of `experiment` matching this subset; matching nothing is an error.
    pub fn select(&self, experiment: &Experiment) -> Result<Experiment, OpError> {
        let selected = experiment.query(self)?;
        if selected.is_empty() {
            return Err(OpError::invalid(format!(
                "Subset string '{}' returned no events",
                self.source
            )));
        }
        Ok(selected)
    }
}

fn compare_column(column: &Column, op: CompareOp, value: &Literal) -> Result<Vec<bool>, String> {
    let ordered = |ord: Option<Ordering>| ord.map(|o| op.holds(o)).unwrap_or(false);
    match (column, value) {
        (Column::Float(v), Literal::Number(x)) => {
            Ok(v.iter().map(|a| ordered(a.partial_cmp(x))).collect())
        }
        (Column::Int(v), Literal::Number(x)) => {
            Ok(v.iter().map(|a| ordered((*a as f64).partial_cmp(x))).collect())
        }
        (Column::Bool(v), Literal::Bool(x)) => match op {
            CompareOp::Eq | CompareOp::Ne => Ok(v.iter().map(|a| op.holds(a.cmp(x))).collect()),
            _ => Err("booleans can only be compared with == or !=".to_string()),
        },
        (Column::Category(v), Literal::Text(x)) => {
            Ok(v.iter().map(|a| op.holds(a.as_str().cmp(x.as_str()))).collect())
        }
        (column, value) => Err(format!(
            "cannot compare a {} column with {value:?}",
            column.kind()
        )),
    }
}

fn eval(expr: &Expr, experiment: &Experiment) -> Result<Vec<bool>, String> {
    match expr {
        Expr::Compare { column, op, value } => {
            let data = experiment
                .column(column)
                .ok_or_else(|| format!("unknown column '{column}'"))?;
            compare_column(data, *op, value)
        }
        Expr::Not(inner) => Ok(eval(inner, experiment)?.into_iter().map(|m| !m).collect()),
        Expr::And(a, b) => {
            let lhs = eval(a, experiment)?;
            let rhs = eval(b, experiment)?;
            Ok(lhs.into_iter().zip(rhs).map(|(x, y)| x && y).collect())
        }
        Expr::Or(a, b) => {
            let lhs = eval(a, experiment)?;
            let rhs = eval(b, experiment)?;
            Ok(lhs.into_iter().zip(rhs).map(|(x, y)| x || y).collect())
        }
    }
}
