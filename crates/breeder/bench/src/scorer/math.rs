//! LaTeX answer equivalence.
//!
//! Answers are normalised (boxing, `$`, spacing commands, `\text{}`, degree
//! and percent marks stripped), split on top-level commas and compared as
//! multisets. Two elements are equivalent when their normalised text is equal
//! or when both parse as arithmetic expressions that agree numerically at a
//! fixed set of points for every free variable.

use super::{Score, Scorer};
use crate::dataset::Sample;
use crate::BenchResult;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Mathematical equivalence of the last boxed (or whole) answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MathScorer;

impl MathScorer {
    pub const NAME: &'static str = "math_equivalence";
}

#[async_trait]
impl Scorer for MathScorer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn score(&self, sample: &Sample, output: &str) -> BenchResult<Score> {
        let target = last_boxed(&sample.target).unwrap_or(&sample.target);
        let answer = last_boxed(output).unwrap_or(output);
        let value = if match_latex(target, answer) { 1.0 } else { 0.0 };
        Ok(Score::new(Self::NAME, value))
    }
}

/// Contents of the last `\boxed{...}` (or `\fbox{...}`) in `text`.
pub fn last_boxed(text: &str) -> Option<&str> {
    let start = ["\\boxed{", "\\fbox{"]
        .iter()
        .filter_map(|marker| text.rfind(marker).map(|at| at + marker.len()))
        .max()?;
    let mut depth = 1usize;
    for (offset, c) in text[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Whether two LaTeX answers denote the same value (or list of values).
pub fn match_latex(target: &str, answer: &str) -> bool {
    let target = normalize(target);
    let answer = normalize(answer);
    if target.is_empty() || answer.is_empty() {
        return false;
    }
    if target == answer {
        return true;
    }
    let target_items = split_top_level(&target);
    let answer_items = split_top_level(&answer);
    if target_items.len() != answer_items.len() {
        return false;
    }
    if target_items.len() == 1 {
        return equivalent(&target_items[0], &answer_items[0]);
    }
    let mut unmatched: Vec<&String> = answer_items.iter().collect();
    for item in &target_items {
        match unmatched.iter().position(|other| equivalent(item, other)) {
            Some(index) => {
                unmatched.swap_remove(index);
            }
            None => return false,
        }
    }
    true
}

fn equivalent(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (parse_expr(a), parse_expr(b)) {
        (Some(x), Some(y)) => numerically_equal(&x, &y),
        _ => false,
    }
}

fn normalize(text: &str) -> String {
    let mut s = text.trim().to_string();
    if let Some(inner) = last_boxed(&s) {
        s = inner.to_string();
    }
    s = strip_command_wrapper(&s, "\\text{");
    s = strip_command_wrapper(&s, "\\textbf{");
    s = strip_command_wrapper(&s, "\\mathrm{");
    s = strip_command_wrapper(&s, "\\mbox{");
    for (from, to) in [
        ("\\dfrac", "\\frac"),
        ("\\tfrac", "\\frac"),
        ("\\left", ""),
        ("\\right", ""),
        ("\\!", ""),
        ("\\,", ""),
        ("\\;", ""),
        ("\\:", ""),
        ("\\ ", ""),
        ("^{\\circ}", ""),
        ("^\\circ", ""),
        ("\\circ", ""),
        ("\\%", ""),
        ("%", ""),
        ("\\$", ""),
        ("$", ""),
        ("\\displaystyle", ""),
    ] {
        s = s.replace(from, to);
    }
    s.retain(|c| !c.is_whitespace());
    while s.ends_with('.') {
        s.pop();
    }
    // `x=3` answers the question the same way `3` does.
    if let Some((lhs, rhs)) = s.split_once('=') {
        if lhs.chars().count() <= 2 && !rhs.contains('=') && !rhs.is_empty() {
            s = rhs.to_string();
        }
    }
    if s.starts_with('.') {
        s = format!("0{s}");
    }
    s
}

fn strip_command_wrapper(text: &str, command: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find(command) {
        out.push_str(&rest[..at]);
        let body = &rest[at + command.len()..];
        let mut depth = 1usize;
        let mut end = None;
        for (offset, c) in body.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(offset);
                        break;
                    }
                }
                _ => {}
            }
        }
        match end {
            Some(end) => {
                out.push_str(&body[..end]);
                rest = &body[end + 1..];
            }
            None => {
                out.push_str(body);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn split_top_level(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
        if c == ',' && depth == 0 {
            items.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    items.push(current);
    items.retain(|item| !item.is_empty());
    items
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Var(char),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, vars: &BTreeMap<char, f64>) -> Option<f64> {
        let value = match self {
            Expr::Num(n) => *n,
            Expr::Var(v) => *vars.get(v)?,
            Expr::Neg(e) => -e.eval(vars)?,
            Expr::Add(a, b) => a.eval(vars)? + b.eval(vars)?,
            Expr::Sub(a, b) => a.eval(vars)? - b.eval(vars)?,
            Expr::Mul(a, b) => a.eval(vars)? * b.eval(vars)?,
            Expr::Div(a, b) => {
                let d = b.eval(vars)?;
                if d == 0.0 {
                    return None;
                }
                a.eval(vars)? / d
            }
            Expr::Pow(a, b) => a.eval(vars)?.powf(b.eval(vars)?),
        };
        value.is_finite().then_some(value)
    }

    fn vars(&self, out: &mut Vec<char>) {
        match self {
            Expr::Num(_) => {}
            Expr::Var(v) => {
                if !out.contains(v) {
                    out.push(*v);
                }
            }
            Expr::Neg(e) => e.vars(out),
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Mul(a, b)
            | Expr::Div(a, b)
            | Expr::Pow(a, b) => {
                a.vars(out);
                b.vars(out);
            }
        }
    }
}

const PROBE_POINTS: [f64; 5] = [0.5377, 1.8339, -2.2588, 0.8622, 3.3188];

fn numerically_equal(a: &Expr, b: &Expr) -> bool {
    let mut vars = Vec::new();
    a.vars(&mut vars);
    b.vars(&mut vars);
    vars.sort_unstable();
    let rounds = if vars.is_empty() { 1 } else { PROBE_POINTS.len() };
    let mut compared = 0;
    for round in 0..rounds {
        let assignment: BTreeMap<char, f64> = vars
            .iter()
            .enumerate()
            .map(|(i, v)| (*v, PROBE_POINTS[(round + i) % PROBE_POINTS.len()] + i as f64 * 0.1))
            .collect();
        let (Some(x), Some(y)) = (a.eval(&assignment), b.eval(&assignment)) else {
            continue;
        };
        let tolerance = 1e-6 * x.abs().max(y.abs()).max(1.0);
        if (x - y).abs() > tolerance {
            return false;
        }
        compared += 1;
    }
    compared > 0
}

fn parse_expr(text: &str) -> Option<Expr> {
    let mut parser = Parser {
        chars: text.chars().collect(),
        pos: 0,
    };
    let expr = parser.expr()?;
    (parser.pos == parser.chars.len()).then_some(expr)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn peek_command(&self) -> Option<String> {
        if self.peek() != Some('\\') {
            return None;
        }
        let name: String = self.chars[self.pos + 1..]
            .iter()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        (!name.is_empty()).then_some(name)
    }

    fn eat_command(&mut self, name: &str) -> bool {
        if self.peek_command().as_deref() == Some(name) {
            self.pos += 1 + name.len();
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Option<Expr> {
        let mut lhs = self.term()?;
        loop {
            if self.eat('+') {
                lhs = Expr::Add(Box::new(lhs), Box::new(self.term()?));
            } else if self.eat('-') {
                lhs = Expr::Sub(Box::new(lhs), Box::new(self.term()?));
            } else {
                return Some(lhs);
            }
        }
    }

    fn term(&mut self) -> Option<Expr> {
        let mut lhs = self.unary()?;
        loop {
            if self.eat('*') || self.eat_command("cdot") || self.eat_command("times") {
                lhs = Expr::Mul(Box::new(lhs), Box::new(self.unary()?));
            } else if self.eat('/') || self.eat_command("div") {
                lhs = Expr::Div(Box::new(lhs), Box::new(self.unary()?));
            } else if self.starts_atom() {
                lhs = Expr::Mul(Box::new(lhs), Box::new(self.power()?));
            } else {
                return Some(lhs);
            }
        }
    }

    fn unary(&mut self) -> Option<Expr> {
        if self.eat('-') {
            return Some(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat('+') {
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> Option<Expr> {
        let base = self.atom()?;
        if self.eat('^') {
            let exponent = if self.peek() == Some('{') {
                self.group()?
            } else if self.eat('-') {
                Expr::Neg(Box::new(self.atom()?))
            } else {
                self.single()?
            };
            return Some(Expr::Pow(Box::new(base), Box::new(exponent)));
        }
        Some(base)
    }

    fn starts_atom(&self) -> bool {
        match self.peek() {
            Some(c) if c.is_ascii_digit() || c.is_ascii_alphabetic() => true,
            Some('(') | Some('{') | Some('.') => true,
            Some('\\') => matches!(
                self.peek_command().as_deref(),
                Some("frac") | Some("sqrt") | Some("pi")
            ),
            _ => false,
        }
    }

    fn group(&mut self) -> Option<Expr> {
        let (open, close) = match self.peek()? {
            '{' => ('{', '}'),
            '(' => ('(', ')'),
            '[' => ('[', ']'),
            _ => return None,
        };
        self.eat(open);
        let inner = self.expr()?;
        self.eat(close).then_some(inner)
    }

    /// A braced group or a single digit or letter, as in `\frac12`.
    fn argument(&mut self) -> Option<Expr> {
        if self.peek() == Some('{') {
            return self.group();
        }
        self.single()
    }

    fn single(&mut self) -> Option<Expr> {
        let c = self.peek()?;
        if c.is_ascii_digit() {
            self.pos += 1;
            return Some(Expr::Num(f64::from(c.to_digit(10)?)));
        }
        if c.is_ascii_alphabetic() {
            self.pos += 1;
            return Some(Expr::Var(c));
        }
        self.atom()
    }

    fn atom(&mut self) -> Option<Expr> {
        match self.peek()? {
            c if c.is_ascii_digit() || c == '.' => self.number(),
            c if c.is_ascii_alphabetic() => {
                self.pos += 1;
                Some(Expr::Var(c))
            }
            '(' | '{' | '[' => self.group(),
            '\\' => {
                if self.eat_command("frac") {
                    let numerator = self.argument()?;
                    let denominator = self.argument()?;
                    Some(Expr::Div(Box::new(numerator), Box::new(denominator)))
                } else if self.eat_command("sqrt") {
                    let index = if self.peek() == Some('[') {
                        self.group()?
                    } else {
                        Expr::Num(2.0)
                    };
                    let radicand = self.argument()?;
                    Some(Expr::Pow(
                        Box::new(radicand),
                        Box::new(Expr::Div(Box::new(Expr::Num(1.0)), Box::new(index))),
                    ))
                } else if self.eat_command("pi") {
                    Some(Expr::Num(std::f64::consts::PI))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn number(&mut self) -> Option<Expr> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }
        let literal: String = self.chars[start..self.pos].iter().collect();
        literal.parse::<f64>().ok().map(Expr::Num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractions_sum_to_one() {
        assert!(match_latex("$\\frac{1}{2}+\\frac{1}{2}$", "1"));
        assert!(match_latex("\\dfrac12", "0.5"));
    }

    #[test]
    fn lists_compare_as_multisets() {
        assert!(match_latex("2,3,4", "3,2,4"));
        assert!(match_latex("a,b,c", "c,b,a"));
        assert!(!match_latex("2,3,4", "2,5"));
        assert!(!match_latex("2,2,3", "2,3,3"));
    }

    #[test]
    fn identical_answers_match() {
        for x in ["\\sqrt{2}", "(1,2]", "x^2+1", "\\text{Monday}", "7"] {
            assert!(match_latex(x, x), "{x}");
        }
    }

    #[test]
    fn symbolic_forms_are_compared_numerically() {
        assert!(match_latex("2x+2", "2(x+1)"));
        assert!(match_latex("\\sqrt{4}", "2"));
        assert!(match_latex("\\frac{\\sqrt{3}}{3}", "\\frac{1}{\\sqrt{3}}"));
        assert!(match_latex("x^{2}", "x\\cdot x"));
        assert!(!match_latex("x^2", "2x"));
    }

    #[test]
    fn decorations_are_ignored() {
        assert!(match_latex("\\boxed{10}", "10"));
        assert!(match_latex("45^\\circ", "45"));
        assert!(match_latex("50\\%", "50"));
        assert!(match_latex("x=3", "3"));
        assert!(match_latex("5\\text{ cm}", "5cm"));
        assert!(match_latex("\\left(3\\right)", "3"));
    }

    #[test]
    fn empty_answers_never_match() {
        assert!(!match_latex("1", ""));
        assert!(!match_latex("", ""));
    }

    #[test]
    fn last_boxed_handles_nesting() {
        assert_eq!(
            last_boxed("so \\boxed{1} then \\boxed{\\frac{1}{2}}."),
            Some("\\frac{1}{2}")
        );
        assert_eq!(last_boxed("no box"), None);
    }

    #[tokio::test]
    async fn scorer_reads_boxed_solution() {
        let sample = Sample::new("1", "q", "The total is $\\boxed{\\frac{3}{4}}$.");
        assert_eq!(MathScorer.score(&sample, "0.75").await.unwrap().value, 1.0);
        assert_eq!(MathScorer.score(&sample, "").await.unwrap().value, 0.0);
    }
}
