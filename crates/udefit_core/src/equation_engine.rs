use crate::error::{Result, UdeError};
use crate::models::KnownDynamics;
use crate::traits::{constant, ParametricSystem, Scalar};
use std::collections::HashMap;

/// OpCodes for the stack-based virtual machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant. Named constants are folded into this at compile time.
    LoadConst(f64),
    /// Pushes a state variable (by index in the variable list).
    LoadVar(usize),
    /// Pushes an entry of the learnable parameter vector.
    LoadParam(usize),
    /// Pushes the current time.
    LoadTime,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Sin,
    Cos,
    Exp,
    Tanh,
    Sqrt,
    Neg,
}

impl OpCode {
    /// Net change in stack height.
    fn stack_effect(self) -> isize {
        match self {
            OpCode::LoadConst(_)
            | OpCode::LoadVar(_)
            | OpCode::LoadParam(_)
            | OpCode::LoadTime => 1,
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => -1,
            OpCode::Sin
            | OpCode::Cos
            | OpCode::Exp
            | OpCode::Tanh
            | OpCode::Sqrt
            | OpCode::Neg => 0,
        }
    }

    fn operands(self) -> usize {
        match self {
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => 2,
            OpCode::Sin
            | OpCode::Cos
            | OpCode::Exp
            | OpCode::Tanh
            | OpCode::Sqrt
            | OpCode::Neg => 1,
            _ => 0,
        }
    }
}

/// A compiled expression. Construction through `Compiler` guarantees the
/// program never underflows the stack and leaves exactly one value.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    ops: Vec<OpCode>,
    max_depth: usize,
}

impl Bytecode {
    fn from_ops(ops: Vec<OpCode>) -> Result<Self> {
        let mut depth = 0isize;
        let mut max_depth = 0isize;
        for op in &ops {
            if (depth as usize) < op.operands() {
                return Err(UdeError::Equation(format!("stack underflow at {op:?}")));
            }
            depth += op.stack_effect();
            max_depth = max_depth.max(depth);
        }
        if depth != 1 {
            return Err(UdeError::Equation(format!(
                "expression leaves {depth} values on the stack"
            )));
        }
        Ok(Self {
            ops,
            max_depth: max_depth as usize,
        })
    }

    pub fn ops(&self) -> &[OpCode] {
        &self.ops
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

/// Stack-based virtual machine for evaluating compiled expressions.
pub struct VM;

impl VM {
    /// Executes the bytecode against a state, a parameter vector and a time.
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        t: T,
        vars: &[T],
        params: &[T],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(constant(val)),
                OpCode::LoadVar(idx) => stack.push(vars.get(idx).copied().unwrap_or_else(T::nan)),
                OpCode::LoadParam(idx) => {
                    stack.push(params.get(idx).copied().unwrap_or_else(T::nan))
                }
                OpCode::LoadTime => stack.push(t),
                OpCode::Add => binary(stack, |a, b| a + b),
                OpCode::Sub => binary(stack, |a, b| a - b),
                OpCode::Mul => binary(stack, |a, b| a * b),
                OpCode::Div => binary(stack, |a, b| a / b),
                OpCode::Pow => binary(stack, pow),
                OpCode::Sin => unary(stack, T::sin),
                OpCode::Cos => unary(stack, T::cos),
                OpCode::Exp => unary(stack, T::exp),
                OpCode::Tanh => unary(stack, T::tanh),
                OpCode::Sqrt => unary(stack, T::sqrt),
                OpCode::Neg => unary(stack, |a| -a),
            }
        }

        stack.pop().unwrap_or_else(T::nan)
    }
}

fn binary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T, T) -> T) {
    let b = stack.pop().unwrap_or_else(T::nan);
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a, b));
}

fn unary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T) -> T) {
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a));
}

/// Small integer exponents go through `powi` so that negative populations
/// and zero bases stay well-defined.
fn pow<T: Scalar>(base: T, exponent: T) -> T {
    if let Some(e) = exponent.to_f64() {
        if e.fract() == 0.0 && e.abs() <= 16.0 {
            return base.powi(e as i32);
        }
    }
    base.powf(exponent)
}

// --- AST & Compiler ---

/// Abstract syntax tree for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>),
    Unary(char, Box<Expr>),
    Call(String, Box<Expr>),
}

/// Resolves names to state indices, parameter indices or constants and
/// lowers an `Expr` into `Bytecode`.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
    pub constants: HashMap<String, f64>,
}

impl Compiler {
    pub fn new(var_names: &[&str], param_names: &[&str]) -> Self {
        let var_map = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();
        let param_map = param_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();
        Self {
            var_map,
            param_map,
            constants: HashMap::new(),
        }
    }

    pub fn with_constants(mut self, constants: &[(&str, f64)]) -> Self {
        for (name, value) in constants {
            self.constants.insert(name.to_string(), *value);
        }
        self
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Bytecode::from_ops(ops)
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                if let Some(&idx) = self.var_map.get(name) {
                    ops.push(OpCode::LoadVar(idx));
                } else if let Some(&idx) = self.param_map.get(name) {
                    ops.push(OpCode::LoadParam(idx));
                } else if let Some(&value) = self.constants.get(name) {
                    ops.push(OpCode::LoadConst(value));
                } else if name == "t" {
                    ops.push(OpCode::LoadTime);
                } else {
                    return Err(UdeError::Equation(format!(
                        "unknown variable or parameter: {name}"
                    )));
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => {
                        return Err(UdeError::Equation(format!(
                            "unknown binary operator: {op}"
                        )))
                    }
                });
            }
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    '-' => ops.push(OpCode::Neg),
                    _ => {
                        return Err(UdeError::Equation(format!(
                            "unknown unary operator: {op}"
                        )))
                    }
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "exp" => OpCode::Exp,
                    "tanh" => OpCode::Tanh,
                    "sqrt" => OpCode::Sqrt,
                    _ => return Err(UdeError::Equation(format!("unknown function: {func}"))),
                });
            }
        }
        Ok(())
    }
}

// --- Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        return Err(UdeError::Equation(format!(
            "unexpected trailing token {token:?} in \"{input}\""
        )));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign =
                    (d == '-' || d == '+') && matches!(num_str.chars().last(), Some('e' | 'E'));
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| UdeError::Equation(format!("invalid number literal: {num_str}")))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => {
                    return Err(UdeError::Equation(format!(
                        "unexpected character '{c}' in \"{input}\""
                    )))
                }
            });
            chars.next();
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

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(UdeError::Equation("expected ')'".to_string())),
        }
    }

    // expression := term (('+' | '-') term)*
    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => '+',
                Some(Token::Minus) => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // term := unary (('*' | '/') unary)*
    fn parse_term(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => '*',
                Some(Token::Slash) => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // unary := '-' unary | power, so that -x^2 parses as -(x^2)
    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    // power := primary ('^' unary)?, right-associative
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(UdeError::Equation(format!("unexpected token {token:?}"))),
            None => Err(UdeError::Equation("unexpected end of expression".to_string())),
        }
    }
}

// --- EquationSystem ---

/// A vector field given as one compiled expression per state variable.
///
/// Parameters named at compile time are read from the parameter vector on
/// every evaluation, so the same compiled system serves any candidate.
#[derive(Debug, Clone)]
pub struct EquationSystem {
    pub equations: Vec<Bytecode>,
    pub var_names: Vec<String>,
    pub param_names: Vec<String>,
    stack_capacity: usize,
}

impl EquationSystem {
    /// Compiles one right-hand side per variable.
    pub fn compile(
        equations: &[&str],
        var_names: &[&str],
        param_names: &[&str],
        constants: &[(&str, f64)],
    ) -> Result<Self> {
        if equations.len() != var_names.len() {
            return Err(UdeError::Equation(format!(
                "{} equations given for {} variables",
                equations.len(),
                var_names.len()
            )));
        }
        let compiler = Compiler::new(var_names, param_names).with_constants(constants);
        let mut bytecodes = Vec::with_capacity(equations.len());
        for source in equations {
            let expr = parse(source)?;
            bytecodes.push(compiler.compile(&expr)?);
        }
        let stack_capacity = bytecodes.iter().map(Bytecode::max_depth).max().unwrap_or(0);
        Ok(Self {
            equations: bytecodes,
            var_names: var_names.iter().map(|s| s.to_string()).collect(),
            param_names: param_names.iter().map(|s| s.to_string()).collect(),
            stack_capacity,
        })
    }

    fn evaluate_with<T: Scalar>(&self, t: T, x: &[T], p: &[T], out: &mut [T]) {
        let mut stack = Vec::with_capacity(self.stack_capacity);
        for (i, eq) in self.equations.iter().enumerate() {
            out[i] = VM::execute(eq, t, x, p, &mut stack);
        }
    }
}

impl<T: Scalar> ParametricSystem<T> for EquationSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn parameter_count(&self) -> usize {
        self.param_names.len()
    }

    fn apply(&self, t: T, x: &[T], p: &[T], out: &mut [T]) {
        self.evaluate_with(t, x, p, out);
    }
}

/// A parameter-free equation system can serve as the fixed analytic term of
/// a hybrid model. Systems compiled with parameter names are refused.
impl KnownDynamics for EquationSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn validate(&self) -> Result<()> {
        if self.param_names.is_empty() {
            return Ok(());
        }
        Err(UdeError::Equation(format!(
            "known dynamics cannot have free parameters, got [{}]",
            self.param_names.join(", ")
        )))
    }

    fn evaluate<T: Scalar>(&self, t: T, x: &[T], out: &mut [T]) {
        self.evaluate_with(t, x, &[], out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str, vars: &[f64], params: &[f64]) -> f64 {
        let compiler = Compiler::new(&["x", "y"], &["a", "b"]).with_constants(&[("k", 10.0)]);
        let expr = parse(source).expect("parse");
        let code = compiler.compile(&expr).expect("compile");
        let mut stack = Vec::new();
        VM::execute(&code, 0.5, vars, params, &mut stack)
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval("1 + 2 * 3", &[0.0, 0.0], &[0.0, 0.0]), 7.0);
        assert_eq!(eval("-x^2", &[3.0, 0.0], &[0.0, 0.0]), -9.0);
        assert_eq!(eval("2^3^2", &[0.0, 0.0], &[0.0, 0.0]), 512.0);
        assert_eq!(eval("8 / 4 / 2", &[0.0, 0.0], &[0.0, 0.0]), 1.0);
    }

    #[test]
    fn resolves_variables_parameters_constants_and_time() {
        let value = eval("a*x - b*x*y + k + t", &[2.0, 3.0], &[1.5, 1.0]);
        assert!((value - (3.0 - 6.0 + 10.0 + 0.5)).abs() < 1e-12);
    }

    #[test]
    fn scientific_notation_and_functions() {
        let value = eval("1.5e-1 * tanh(x) + sqrt(4)", &[0.0, 0.0], &[0.0, 0.0]);
        assert!((value - 2.0).abs() < 1e-12);
    }

    #[test]
    fn compile_errors_are_reported() {
        let compiler = Compiler::new(&["x"], &[]);
        let expr = parse("z + 1").expect("parse");
        assert_err_contains(compiler.compile(&expr), "unknown variable or parameter: z");
        assert_err_contains(parse("(x + 1"), "expected ')'");
        assert_err_contains(parse("x $ 1"), "unexpected character");
        assert_err_contains(parse("x 1"), "trailing token");
        assert_err_contains(
            parse("floor(x)").and_then(|e| compiler.compile(&e)),
            "unknown function",
        );
    }

    #[test]
    fn equation_system_reads_parameters_at_evaluation() {
        let system = EquationSystem::compile(
            &["alpha*x - beta*x*y", "-gamma*y + delta*x*y"],
            &["x", "y"],
            &["alpha", "beta", "gamma", "delta"],
            &[],
        )
        .expect("system");
        assert_eq!(ParametricSystem::<f64>::parameter_count(&system), 4);

        let mut out = [0.0; 2];
        system.apply(0.0, &[1.0, 1.0], &[1.5, 1.0, 3.0, 1.0], &mut out);
        assert_eq!(out, [0.5, -2.0]);
        system.apply(0.0, &[1.0, 1.0], &[2.0, 1.0, 3.0, 1.0], &mut out);
        assert_eq!(out, [1.0, -2.0]);
    }

    #[test]
    fn parameter_free_system_serves_as_known_dynamics() {
        use crate::models::{HybridModel, InteractionTerm, LotkaVolterraKnown};

        let constants = [("a", 1.5), ("g", 3.0)];
        let known = EquationSystem::compile(&["a*x", "-g*y"], &["x", "y"], &[], &constants)
            .expect("system");
        let from_equations = HybridModel::new(known, InteractionTerm).expect("model");
        let built_in =
            HybridModel::new(LotkaVolterraKnown::new(1.5, 3.0), InteractionTerm).expect("model");

        let mut lhs = [0.0; 2];
        let mut rhs = [0.0; 2];
        from_equations.apply(0.0, &[1.2, 0.7], &[1.0, 1.0], &mut lhs);
        built_in.apply(0.0, &[1.2, 0.7], &[1.0, 1.0], &mut rhs);
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn known_dynamics_with_free_parameters_are_refused() {
        use crate::models::{HybridModel, InteractionTerm};

        let known = EquationSystem::compile(&["a*x", "-3*y"], &["x", "y"], &["a"], &[])
            .expect("system");
        let err = HybridModel::new(known, InteractionTerm).expect_err("free parameter");
        assert!(matches!(err, UdeError::Equation(_)), "got {err}");
        assert!(format!("{err}").contains("cannot have free parameters, got [a]"));
    }

    #[test]
    fn equation_count_must_match_variables() {
        assert_err_contains(
            EquationSystem::compile(&["x"], &["x", "y"], &[], &[]),
            "1 equations given for 2 variables",
        );
    }
}
