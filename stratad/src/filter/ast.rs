use std::collections::BTreeSet;

use globset::Glob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
        }
    }

    pub fn accepts(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ordering == Equal,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Lt => ordering == Less,
            CompareOp::Ge => ordering != Less,
            CompareOp::Le => ordering != Greater,
        }
    }
}

/// Point in time, relative ones resolved against the evaluation clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    Absolute(i64),
    Relative(i64),
}

impl TimeSpec {
    pub fn resolve(&self, now: i64) -> i64 {
        match self {
            TimeSpec::Absolute(at) => *at,
            TimeSpec::Relative(offset) => now.saturating_add(*offset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Tag {
        key: String,
        op: CompareOp,
        value: String,
    },
    MimeType(Glob),
    Size {
        op: CompareOp,
        bytes: i64,
    },
    Modified {
        op: CompareOp,
        at: TimeSpec,
    },
    Path(Glob),
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Atom(Predicate),
}

impl Expr {
    /// Atoms in left-to-right order.
    pub fn atoms(&self) -> Vec<&Predicate> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a Predicate>) {
        match self {
            Expr::And(left, right) | Expr::Or(left, right) => {
                left.collect_atoms(out);
                right.collect_atoms(out);
            }
            Expr::Not(inner) => inner.collect_atoms(out),
            Expr::Atom(predicate) => out.push(predicate),
        }
    }

    /// Backends that can hold a match; `None` means any backend.
    pub fn candidate_backends(&self) -> Option<BTreeSet<String>> {
        match self {
            Expr::Atom(Predicate::Backend(id)) => Some(BTreeSet::from([id.clone()])),
            Expr::Atom(_) | Expr::Not(_) => None,
            Expr::And(left, right) => {
                match (left.candidate_backends(), right.candidate_backends()) {
                    (Some(a), Some(b)) => Some(a.intersection(&b).cloned().collect()),
                    (Some(set), None) | (None, Some(set)) => Some(set),
                    (None, None) => None,
                }
            }
            Expr::Or(left, right) => {
                let mut set = left.candidate_backends()?;
                set.extend(right.candidate_backends()?);
                Some(set)
            }
        }
    }

    /// Whether the result depends on the evaluation clock.
    pub fn is_time_relative(&self) -> bool {
        self.atoms().iter().any(|atom| {
            matches!(
                atom,
                Predicate::Modified {
                    at: TimeSpec::Relative(_),
                    ..
                }
            )
        })
    }
}
