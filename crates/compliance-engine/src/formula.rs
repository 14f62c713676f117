//! 公式求值
//!
//! 受限的算术表达式语言：数字、四则运算、取模、乘方、括号，以及固定的
//! 聚合函数表。标识符只能作为函数名或名称参数出现，不会解析到宿主状态。
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := '-' unary | power
//! power   := primary ('^' unary)?
//! primary := NUMBER | STRING | IDENT | IDENT '(' [expr (',' expr)*] ')' | '(' expr ')'
//! ```

use crate::building::{BuildingModel, BuildingObject};
use crate::error::FormulaError;
use crate::spatial::SpatialAnalyzer;

type FormulaResult<T> = std::result::Result<T, FormulaError>;

const MAX_DEPTH: usize = 64;

static END: Token = Token::End;

/// 求值上下文：匹配对象用于无类型参数的聚合，整个模型用于带类型参数的聚合
pub struct FormulaContext<'a> {
    pub analyzer: &'a SpatialAnalyzer,
    pub model: &'a BuildingModel,
    pub matched: &'a [&'a BuildingObject],
}

/// 解析并求值公式
pub fn evaluate(formula: &str, ctx: &FormulaContext<'_>) -> FormulaResult<f64> {
    Formula::parse(formula)?.evaluate(ctx)
}

/// 已解析的公式
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    root: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> FormulaResult<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.expr()?;
        match parser.peek() {
            Token::End => Ok(Self { root }),
            _ => Err(parser.syntax("多余的输入")),
        }
    }

    pub fn evaluate(&self, ctx: &FormulaContext<'_>) -> FormulaResult<f64> {
        let value = eval(&self.root, ctx)?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(FormulaError::NonFinite)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Text(String),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
    End,
}

fn tokenize(source: &str) -> FormulaResult<Vec<(usize, Token)>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '0'..='9' | '.' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // 科学计数法
                if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && matches!(chars[j], '+' | '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| FormulaError::Syntax {
                    position: start,
                    message: format!("无效的数字 '{}'", text),
                })?;
                tokens.push((start, Token::Number(value)));
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
                continue;
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let body_start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(FormulaError::UnexpectedEnd);
                }
                tokens.push((start, Token::Text(chars[body_start..i].iter().collect())));
                i += 1;
                continue;
            }
            '+' | '-' | '*' | '/' | '%' | '^' => tokens.push((start, Token::Op(c))),
            '(' => tokens.push((start, Token::LParen)),
            ')' => tokens.push((start, Token::RParen)),
            ',' => tokens.push((start, Token::Comma)),
            other => {
                return Err(FormulaError::Syntax {
                    position: start,
                    message: format!("无法识别的字符 '{}'", other),
                });
            }
        }
        i += 1;
    }

    tokens.push((chars.len(), Token::End));
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|(_, t)| t)
            .unwrap_or(&END)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or_default()
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn syntax(&self, message: &str) -> FormulaError {
        FormulaError::Syntax {
            position: self.position(),
            message: message.to_string(),
        }
    }

    fn expr(&mut self) -> FormulaResult<Expr> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.syntax("嵌套层级过深"));
        }

        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Token::Op('+') => BinOp::Add,
                Token::Op('-') => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }

        self.depth -= 1;
        Ok(left)
    }

    fn term(&mut self) -> FormulaResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Op('*') => BinOp::Mul,
                Token::Op('/') => BinOp::Div,
                Token::Op('%') => BinOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> FormulaResult<Expr> {
        if matches!(self.peek(), Token::Op('-')) {
            self.advance();
            self.depth += 1;
            if self.depth > MAX_DEPTH {
                return Err(self.syntax("嵌套层级过深"));
            }
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.power()
    }

    fn power(&mut self) -> FormulaResult<Expr> {
        let base = self.primary()?;
        if matches!(self.peek(), Token::Op('^')) {
            self.advance();
            self.depth += 1;
            if self.depth > MAX_DEPTH {
                return Err(self.syntax("嵌套层级过深"));
            }
            let exponent = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Binary(Box::new(base), BinOp::Pow, Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> FormulaResult<Expr> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Text(s) => Ok(Expr::Text(s)),
            Token::Ident(name) => {
                if !matches!(self.peek(), Token::LParen) {
                    return Ok(Expr::Call(name, Vec::new()));
                }
                self.advance();
                let mut args = Vec::new();
                if matches!(self.peek(), Token::RParen) {
                    self.advance();
                    return Ok(Expr::Call(name, args));
                }
                loop {
                    args.push(self.expr()?);
                    match self.advance() {
                        Token::Comma => continue,
                        Token::RParen => break,
                        Token::End => return Err(FormulaError::UnexpectedEnd),
                        _ => {
                            self.pos -= 1;
                            return Err(self.syntax("函数参数之间缺少 ','"));
                        }
                    }
                }
                Ok(Expr::Call(name, args))
            }
            Token::LParen => {
                let inner = self.expr()?;
                match self.advance() {
                    Token::RParen => Ok(inner),
                    Token::End => Err(FormulaError::UnexpectedEnd),
                    _ => {
                        self.pos -= 1;
                        Err(self.syntax("缺少 ')'"))
                    }
                }
            }
            Token::End => Err(FormulaError::UnexpectedEnd),
            _ => {
                self.pos -= 1;
                Err(self.syntax("意外的符号"))
            }
        }
    }
}

fn eval(expr: &Expr, ctx: &FormulaContext<'_>) -> FormulaResult<f64> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Text(s) => Err(FormulaError::InvalidArgument {
            function: "literal".to_string(),
            message: format!("字符串 '{}' 不能作为数值使用", s),
        }),
        Expr::Neg(inner) => Ok(-eval(inner, ctx)?),
        Expr::Binary(left, op, right) => {
            let l = eval(left, ctx)?;
            let r = eval(right, ctx)?;
            match op {
                BinOp::Add => Ok(l + r),
                BinOp::Sub => Ok(l - r),
                BinOp::Mul => Ok(l * r),
                BinOp::Div if r == 0.0 => Err(FormulaError::DivisionByZero),
                BinOp::Div => Ok(l / r),
                BinOp::Rem if r == 0.0 => Err(FormulaError::DivisionByZero),
                BinOp::Rem => Ok(l % r),
                BinOp::Pow => Ok(l.powf(r)),
            }
        }
        Expr::Call(name, args) => call(name, args, ctx),
    }
}

fn call(name: &str, args: &[Expr], ctx: &FormulaContext<'_>) -> FormulaResult<f64> {
    let analyzer = ctx.analyzer;
    match name {
        "area" => {
            arity(name, args, 0, Some(0))?;
            Ok(analyzer.total_area(ctx.matched.iter().copied()))
        }
        "volume" => {
            arity(name, args, 0, Some(0))?;
            Ok(analyzer.total_volume(ctx.matched.iter().copied()))
        }
        "count" => {
            arity(name, args, 0, Some(1))?;
            Ok(scope(name, args.first(), ctx)?.len() as f64)
        }
        "total_area" => {
            arity(name, args, 0, Some(1))?;
            Ok(analyzer.total_area(scope(name, args.first(), ctx)?))
        }
        "total_volume" => {
            arity(name, args, 0, Some(1))?;
            Ok(analyzer.total_volume(scope(name, args.first(), ctx)?))
        }
        "sum" | "avg" => {
            arity(name, args, 1, Some(2))?;
            let property = name_arg(name, &args[0])?;
            let values: Vec<f64> = scope(name, args.get(1), ctx)?
                .into_iter()
                .filter_map(|o| o.number(&property))
                .collect();
            let total: f64 = values.iter().sum();
            if name == "sum" || values.is_empty() {
                Ok(total)
            } else {
                Ok(total / values.len() as f64)
            }
        }
        "total_load" => {
            arity(name, args, 1, Some(1))?;
            let system = name_arg(name, &args[0])?;
            Ok(ctx
                .model
                .objects
                .iter()
                .filter(|o| {
                    o.attribute("system_type")
                        .is_some_and(|v| v.as_str() == Some(system.as_str()))
                })
                .filter_map(|o| o.number("load"))
                .sum())
        }
        "electrical_load" => domain_total(name, args, ctx, &["electrical_outlet"], "load", 1.0),
        "plumbing_flow" => {
            domain_total(name, args, ctx, &["sink", "toilet", "shower"], "flow_rate", 1.0)
        }
        "hvac_capacity" => domain_total(name, args, ctx, &["hvac_unit"], "capacity", 1.0),
        "structural_load" => {
            domain_total(name, args, ctx, &["wall", "column", "beam"], "load", 1.0)
        }
        // 每位使用者 0.3 英寸疏散宽度
        "fire_egress" => domain_total(name, args, ctx, &["room"], "occupancy", 0.3),
        "abs" => Ok(unary_arg(name, args, ctx)?.abs()),
        "round" => Ok(unary_arg(name, args, ctx)?.round()),
        "sqrt" => {
            let x = unary_arg(name, args, ctx)?;
            if x < 0.0 {
                return Err(FormulaError::InvalidArgument {
                    function: name.to_string(),
                    message: format!("负数 {} 不能开平方", x),
                });
            }
            Ok(x.sqrt())
        }
        "min" | "max" => {
            arity(name, args, 1, None)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, ctx)?);
            }
            let fold: fn(f64, f64) -> f64 = if name == "min" { f64::min } else { f64::max };
            let init = if name == "min" {
                f64::INFINITY
            } else {
                f64::NEG_INFINITY
            };
            Ok(values.into_iter().fold(init, fold))
        }
        other => Err(FormulaError::UnknownFunction(other.to_string())),
    }
}

fn arity(name: &str, args: &[Expr], min: usize, max: Option<usize>) -> FormulaResult<()> {
    let ok = args.len() >= min && max.is_none_or(|m| args.len() <= m);
    if ok {
        return Ok(());
    }
    let expected = match max {
        Some(m) if m == min => m.to_string(),
        Some(m) => format!("{}-{}", min, m),
        None => format!("至少 {}", min),
    };
    Err(FormulaError::Arity {
        function: name.to_string(),
        expected,
        found: args.len(),
    })
}

fn unary_arg(name: &str, args: &[Expr], ctx: &FormulaContext<'_>) -> FormulaResult<f64> {
    arity(name, args, 1, Some(1))?;
    eval(&args[0], ctx)
}

/// 名称参数：裸标识符或字符串字面量
fn name_arg(function: &str, arg: &Expr) -> FormulaResult<String> {
    match arg {
        Expr::Call(name, args) if args.is_empty() => Ok(name.clone()),
        Expr::Text(s) => Ok(s.clone()),
        _ => Err(FormulaError::InvalidArgument {
            function: function.to_string(),
            message: "期望类型、属性或系统名称".to_string(),
        }),
    }
}

/// 聚合范围：未指定类型时为匹配对象，指定类型时为模型中该类型的全部对象
fn scope<'a>(
    function: &str,
    type_arg: Option<&Expr>,
    ctx: &FormulaContext<'a>,
) -> FormulaResult<Vec<&'a BuildingObject>> {
    match type_arg {
        None => Ok(ctx.matched.to_vec()),
        Some(arg) => {
            let object_type = name_arg(function, arg)?;
            Ok(ctx
                .model
                .objects
                .iter()
                .filter(|o| o.object_type == object_type)
                .collect())
        }
    }
}

fn domain_total(
    name: &str,
    args: &[Expr],
    ctx: &FormulaContext<'_>,
    types: &[&str],
    property: &str,
    factor: f64,
) -> FormulaResult<f64> {
    arity(name, args, 0, Some(0))?;
    let total: f64 = ctx
        .matched
        .iter()
        .filter(|o| types.contains(&o.object_type.as_str()))
        .filter_map(|o| o.number(property))
        .sum();
    Ok(total * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::building::Location;
    use crate::config::SpatialSettings;

    fn model() -> BuildingModel {
        BuildingModel::new(
            "b-1",
            "Clinic",
            vec![
                BuildingObject::new("r1", "room")
                    .with_property("area", 40)
                    .with_property("occupancy", 10),
                BuildingObject::new("r2", "room")
                    .with_property("area", 60)
                    .with_property("occupancy", 20),
                BuildingObject::new("o1", "electrical_outlet")
                    .with_property("load", 180)
                    .with_property("system_type", "electrical"),
                BuildingObject::new("o2", "electrical_outlet")
                    .with_property("load", 120)
                    .with_property("system_type", "electrical"),
                BuildingObject::new("h1", "hvac_unit")
                    .with_property("capacity", 5000)
                    .with_location(Location::new(0.0, 0.0, 0.0).with_size(2.0, 3.0, 1.0)),
            ],
        )
    }

    fn run(formula: &str, matched_ids: &[&str]) -> FormulaResult<f64> {
        let model = model();
        let analyzer = SpatialAnalyzer::new(SpatialSettings::default());
        let matched: Vec<&BuildingObject> = model
            .objects
            .iter()
            .filter(|o| matched_ids.contains(&o.id.as_str()))
            .collect();
        let ctx = FormulaContext {
            analyzer: &analyzer,
            model: &model,
            matched: &matched,
        };
        evaluate(formula, &ctx)
    }

    #[test]
    fn test_total_area_by_type_halved() {
        assert_eq!(run("total_area(room) / 2", &[]).unwrap(), 50.0);
        assert_eq!(run("total_area('room') / 2", &[]).unwrap(), 50.0);
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(run("1 + 2 * 3", &[]).unwrap(), 7.0);
        assert_eq!(run("(1 + 2) * 3", &[]).unwrap(), 9.0);
        assert_eq!(run("2 ^ 3 ^ 2", &[]).unwrap(), 512.0);
        assert_eq!(run("-2 ^ 2", &[]).unwrap(), -4.0);
        assert_eq!(run("10 % 4", &[]).unwrap(), 2.0);
        assert_eq!(run("1.5e2", &[]).unwrap(), 150.0);
    }

    #[test]
    fn test_untyped_forms_use_matched_objects() {
        assert_eq!(run("count()", &["r1"]).unwrap(), 1.0);
        assert_eq!(run("count", &["r1", "r2"]).unwrap(), 2.0);
        assert_eq!(run("count(room)", &["r1"]).unwrap(), 2.0);
        assert_eq!(run("area()", &["r2"]).unwrap(), 60.0);
        assert_eq!(run("volume()", &["h1"]).unwrap(), 6.0);
        assert_eq!(run("avg(area)", &["r1", "r2"]).unwrap(), 50.0);
        assert_eq!(run("sum(load, electrical_outlet)", &[]).unwrap(), 300.0);
        assert_eq!(run("avg(area)", &[]).unwrap(), 0.0);
    }

    #[test]
    fn test_domain_calculators() {
        let all = ["r1", "r2", "o1", "o2", "h1"];
        assert_eq!(run("electrical_load()", &all).unwrap(), 300.0);
        assert_eq!(run("hvac_capacity()", &all).unwrap(), 5000.0);
        assert_eq!(run("fire_egress()", &all).unwrap(), 9.0);
        assert_eq!(run("plumbing_flow()", &all).unwrap(), 0.0);
        assert_eq!(run("structural_load()", &all).unwrap(), 0.0);
        assert_eq!(run("total_load(electrical)", &[]).unwrap(), 300.0);
    }

    #[test]
    fn test_math_functions() {
        assert_eq!(run("abs(-3)", &[]).unwrap(), 3.0);
        assert_eq!(run("round(2.5)", &[]).unwrap(), 3.0);
        assert_eq!(run("sqrt(16)", &[]).unwrap(), 4.0);
        assert_eq!(run("min(3, 1, 2)", &[]).unwrap(), 1.0);
        assert_eq!(run("max(3, total_area(room))", &[]).unwrap(), 100.0);
    }

    #[test]
    fn test_errors() {
        assert_eq!(run("1 / 0", &[]).unwrap_err(), FormulaError::DivisionByZero);
        assert_eq!(run("5 % 0", &[]).unwrap_err(), FormulaError::DivisionByZero);
        assert_eq!(
            run("exec(1)", &[]).unwrap_err(),
            FormulaError::UnknownFunction("exec".to_string())
        );
        assert!(matches!(
            run("sqrt(1, 2)", &[]).unwrap_err(),
            FormulaError::Arity { found: 2, .. }
        ));
        assert!(matches!(
            run("min()", &[]).unwrap_err(),
            FormulaError::Arity { found: 0, .. }
        ));
        assert!(matches!(
            run("sqrt(-1)", &[]).unwrap_err(),
            FormulaError::InvalidArgument { .. }
        ));
        assert_eq!(run("(1 + 2", &[]).unwrap_err(), FormulaError::UnexpectedEnd);
        assert!(matches!(
            run("1 + 2 3", &[]).unwrap_err(),
            FormulaError::Syntax { position: 6, .. }
        ));
        assert!(matches!(
            run("area; drop", &[]).unwrap_err(),
            FormulaError::Syntax { position: 4, .. }
        ));
        assert!(matches!(
            run("'room' * 2", &[]).unwrap_err(),
            FormulaError::InvalidArgument { .. }
        ));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let formula = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(matches!(
            run(&formula, &[]).unwrap_err(),
            FormulaError::Syntax { .. }
        ));
    }

    #[test]
    fn test_non_finite_result() {
        assert_eq!(run("10 ^ 400", &[]).unwrap_err(), FormulaError::NonFinite);
    }
}
