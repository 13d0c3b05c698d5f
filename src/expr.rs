use crate::error::AssemblerError;
use indexmap::IndexMap;
use std::fmt;
use std::ops::{Add, Sub};

/// Operand expression over labels, evaluated once all labels are bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Const(i32),
    Label(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    LowByte(Box<Expr>),
    HighByte(Box<Expr>),
}

impl Expr {
    pub fn label(name: &str) -> Self {
        Expr::Label(name.to_string())
    }

    /// Low byte of the value (`<expr`)
    pub fn lo(self) -> Self {
        Expr::LowByte(Box::new(self))
    }

    /// High byte of the value (`>expr`)
    pub fn hi(self) -> Self {
        Expr::HighByte(Box::new(self))
    }

    pub fn eval(&self, labels: &IndexMap<String, u16>) -> Result<i32, AssemblerError> {
        match self {
            Expr::Const(value) => Ok(*value),
            Expr::Label(name) => labels
                .get(name)
                .map(|&address| address as i32)
                .ok_or_else(|| AssemblerError::UnresolvedLabel(name.clone())),
            Expr::Add(a, b) => Ok(a.eval(labels)? + b.eval(labels)?),
            Expr::Sub(a, b) => Ok(a.eval(labels)? - b.eval(labels)?),
            Expr::LowByte(e) => Ok(e.eval(labels)? & 0xFF),
            Expr::HighByte(e) => Ok((e.eval(labels)? >> 8) & 0xFF),
        }
    }

    /// Labels this expression depends on, in order of appearance
    pub fn labels(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_labels(&mut names);
        names
    }

    fn collect_labels<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expr::Const(_) => {}
            Expr::Label(name) => names.push(name),
            Expr::Add(a, b) | Expr::Sub(a, b) => {
                a.collect_labels(names);
                b.collect_labels(names);
            }
            Expr::LowByte(e) | Expr::HighByte(e) => e.collect_labels(names),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Const(value) if *value >= 0 => write!(f, "${:X}", value),
            Expr::Const(value) => write!(f, "{}", value),
            Expr::Label(name) => f.write_str(name),
            Expr::Add(a, b) => write!(f, "{}+{}", a, b),
            Expr::Sub(a, b) => write!(f, "{}-{}", a, b),
            Expr::LowByte(e) => write!(f, "<({})", e),
            Expr::HighByte(e) => write!(f, ">({})", e),
        }
    }
}

impl From<u8> for Expr {
    fn from(value: u8) -> Self {
        Expr::Const(value as i32)
    }
}

impl From<u16> for Expr {
    fn from(value: u16) -> Self {
        Expr::Const(value as i32)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Const(value)
    }
}

impl From<&str> for Expr {
    fn from(name: &str) -> Self {
        Expr::label(name)
    }
}

impl Add<i32> for Expr {
    type Output = Expr;

    fn add(self, rhs: i32) -> Expr {
        Expr::Add(Box::new(self), Box::new(Expr::Const(rhs)))
    }
}

impl Sub<i32> for Expr {
    type Output = Expr;

    fn sub(self, rhs: i32) -> Expr {
        Expr::Sub(Box::new(self), Box::new(Expr::Const(rhs)))
    }
}

impl Add<Expr> for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs))
    }
}

impl Sub<Expr> for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> IndexMap<String, u16> {
        let mut labels = IndexMap::new();
        labels.insert("data".to_string(), 0xC123);
        labels.insert("start".to_string(), 0xC000);
        labels
    }

    #[test]
    fn eval_arithmetic_and_bytes() {
        let labels = table();
        assert_eq!(Expr::label("data").eval(&labels), Ok(0xC123));
        assert_eq!((Expr::label("data") + 2).eval(&labels), Ok(0xC125));
        assert_eq!(Expr::label("data").lo().eval(&labels), Ok(0x23));
        assert_eq!(Expr::label("data").hi().eval(&labels), Ok(0xC1));
        assert_eq!(
            (Expr::label("data") - Expr::label("start")).eval(&labels),
            Ok(0x123)
        );
    }

    #[test]
    fn unbound_label_fails() {
        let labels = table();
        let expr = Expr::from("nowhere") + 1;
        assert_eq!(
            expr.eval(&labels),
            Err(AssemblerError::UnresolvedLabel("nowhere".to_string()))
        );
        assert_eq!(expr.labels(), vec!["nowhere"]);
    }

    #[test]
    fn display_is_readable() {
        let expr = (Expr::label("table") + 2).hi();
        assert_eq!(expr.to_string(), ">(table+$2)");
    }
}
