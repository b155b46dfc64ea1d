//! Postfix token stream and the operator/function catalog.
//!
//! The original engine modeled every operator as its own class; here the
//! whole vocabulary folds into two tagged variants: [`OpCode`] for stateless
//! operators and functions, and [`Stateful`] for tokens that own a private
//! window (running aggregates, historic lookups). The only process-wide
//! state permitted is the read-only catalog table in [`lookup_function`].

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::value::Operand;

/// One entry in an expression's postfix stream.
#[derive(Debug, Clone)]
pub enum Token {
    /// Literal constant from the source text.
    Const(crate::value::Value),
    /// Variable reference, by index into the expression's variable table.
    Var(usize),
    /// Stateless operator or function.
    Op(OpCode),
    /// Stateful function carrying its own window.
    Stateful(Stateful),
}

impl Token {
    pub fn has_state(&self) -> bool {
        matches!(self, Token::Stateful(_))
    }
}

/// Stateless operators and functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    // arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    // comparison (int 0/1 result)
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // logical
    And,
    Or,
    Xor,
    Not,
    Iif,
    // math functions
    Abs,
    Sqr,
    Exp,
    Log,
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atn,
    Atn2,
    Floor,
    Ceiling,
    Round,
    Frac,
    Int,
    Fix,
    Sgn,
    Pwr,
    Rnd,
    // string functions
    Len,
    Left,
    Right,
    Mid,
    Trim,
    LTrim,
    RTrim,
    InStr,
    Replace,
    StrComp,
    Upper,
    Lower,
    Hex,
    HexToDec,
    Space,
    StrReverse,
    // conversion
    ToFloat,
    ToInt,
    ToDate,
    FormatFloat,
    FormatTime,
    // time
    Timestamp,
    SetTimestamp,
    SystemTime,
    SourceTime,
}

impl OpCode {
    /// Number of operands popped from the evaluation stack.
    pub fn arity(&self) -> usize {
        use OpCode::*;
        match self {
            Neg | Not | Abs | Sqr | Exp | Log | Log10 | Sin | Cos | Tan | Asin | Acos | Atn
            | Floor | Ceiling | Frac | Int | Fix | Sgn | Len | Trim | LTrim | RTrim
            | Upper | Lower | Hex | HexToDec | Space | StrReverse | ToFloat | ToInt | ToDate
            | Timestamp => 1,
            Add | Sub | Mul | Div | Mod | Pow | Eq | Ne | Lt | Le | Gt | Ge | And | Or | Xor
            | Atn2 | Round | Pwr | Left | Right | InStr | StrComp | FormatFloat | FormatTime
            | SetTimestamp => 2,
            Iif | Mid | Replace => 3,
            SystemTime | SourceTime | Rnd => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        use OpCode::*;
        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Mod => "MOD",
            Pow => "^",
            Neg => "-",
            Eq => "=",
            Ne => "<>",
            Lt => "<",
            Le => "<=",
            Gt => ">",
            Ge => ">=",
            And => "AND",
            Or => "OR",
            Xor => "XOR",
            Not => "NOT",
            Iif => "IIF",
            Abs => "ABS",
            Sqr => "SQR",
            Exp => "EXP",
            Log => "LOG",
            Log10 => "LOG10",
            Sin => "SIN",
            Cos => "COS",
            Tan => "TAN",
            Asin => "ASIN",
            Acos => "ACOS",
            Atn => "ATN",
            Atn2 => "ATN2",
            Floor => "FLOOR",
            Ceiling => "CEILING",
            Round => "ROUND",
            Frac => "FRAC",
            Int => "INT",
            Fix => "FIX",
            Sgn => "SGN",
            Pwr => "PWR",
            Rnd => "RND",
            Len => "LEN",
            Left => "LEFT",
            Right => "RIGHT",
            Mid => "MID",
            Trim => "TRIM",
            LTrim => "LTRIM",
            RTrim => "RTRIM",
            InStr => "INSTR",
            Replace => "REPLACE",
            StrComp => "STRCOMP",
            Upper => "UPPERCASE",
            Lower => "LOWERCASE",
            Hex => "HEX",
            HexToDec => "HEXTODEC",
            Space => "SPACE",
            StrReverse => "STRREVERSE",
            ToFloat => "FLOAT",
            ToInt => "TOINT",
            ToDate => "TODATE",
            FormatFloat => "FORMATFLOAT",
            FormatTime => "FORMATTIME",
            Timestamp => "TIMESTAMP",
            SetTimestamp => "SETTIMESTAMP",
            SystemTime => "SYSTEMTIME",
            SourceTime => "SOURCETIME",
        }
    }
}

/// Aggregate computed over a window by the running functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggKind {
    Avg,
    Max,
    Min,
    Median,
    StdDev,
    Total,
}

impl AggKind {
    pub fn name(&self) -> &'static str {
        match self {
            AggKind::Avg => "AVG",
            AggKind::Max => "MAX",
            AggKind::Min => "MIN",
            AggKind::Median => "MEDIAN",
            AggKind::StdDev => "STDDEV",
            AggKind::Total => "TOTAL",
        }
    }
}

/// How a running window is bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// `XXXRUN(value, count)`: last N samples.
    Count,
    /// `XXXRUNOVERTIME(value, stamp, window_ms)`: samples within a
    /// trailing time window keyed on the supplied stamps.
    OverTime,
    /// `XXXRUNOVERTIMEWITHRESET(value, stamp, reset)`: as OverTime but the
    /// window clears when the reset boundary derived from the previous
    /// sample's stamp is crossed.
    OverTimeWithReset,
}

/// A stateful function instance: kind plus its private window.
#[derive(Debug, Clone)]
pub struct Stateful {
    pub kind: StatefulKind,
    pub samples: VecDeque<(f64, DateTime<Utc>)>,
    /// Stamp of the previous input, used for reset boundary detection.
    pub last_stamp: Option<DateTime<Utc>>,
    /// Previous operand for `LAST`.
    pub prev: Option<Operand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatefulKind {
    /// `LAST(v)`: value from the previous evaluation.
    Last,
    Running(AggKind, WindowKind),
    /// `VALUEATTIME(v, stamp, age_ms, default)`.
    ValueAtTime,
}

impl Stateful {
    pub fn new(kind: StatefulKind) -> Self {
        Self {
            kind,
            samples: VecDeque::new(),
            last_stamp: None,
            prev: None,
        }
    }

    pub fn arity(&self) -> usize {
        match self.kind {
            StatefulKind::Last => 1,
            StatefulKind::Running(_, WindowKind::Count) => 2,
            StatefulKind::Running(_, _) => 3,
            StatefulKind::ValueAtTime => 4,
        }
    }

    /// Clear every piece of private state. Called on expression (re)start.
    pub fn reset_state(&mut self) {
        self.samples.clear();
        self.last_stamp = None;
        self.prev = None;
    }
}

/// Catalog entry resolved by the factory for a function-style identifier.
#[derive(Debug, Clone, Copy)]
pub enum FnSpec {
    Op(OpCode),
    Stateful(StatefulKind),
}

impl FnSpec {
    pub fn arity(&self) -> usize {
        match self {
            FnSpec::Op(op) => op.arity(),
            FnSpec::Stateful(kind) => Stateful::new(*kind).arity(),
        }
    }
}

/// Resolve an identifier (already upper-cased) as a function name.
pub fn lookup_function(name: &str) -> Option<FnSpec> {
    use AggKind::*;
    use OpCode::*;
    use WindowKind::*;
    let spec = match name {
        "ABS" => FnSpec::Op(Abs),
        "SQR" => FnSpec::Op(Sqr),
        "EXP" => FnSpec::Op(Exp),
        "LOG" | "LN" => FnSpec::Op(Log),
        "LOG10" => FnSpec::Op(Log10),
        "SIN" => FnSpec::Op(Sin),
        "COS" => FnSpec::Op(Cos),
        "TAN" => FnSpec::Op(Tan),
        "ASIN" => FnSpec::Op(Asin),
        "ACOS" => FnSpec::Op(Acos),
        "ATN" => FnSpec::Op(Atn),
        "ATN2" => FnSpec::Op(Atn2),
        "FLOOR" => FnSpec::Op(Floor),
        "CEILING" => FnSpec::Op(Ceiling),
        "ROUND" => FnSpec::Op(Round),
        "FRAC" => FnSpec::Op(Frac),
        "INT" => FnSpec::Op(Int),
        "FIX" => FnSpec::Op(Fix),
        "SGN" => FnSpec::Op(Sgn),
        "PWR" => FnSpec::Op(Pwr),
        "RND" => FnSpec::Op(Rnd),
        "IIF" => FnSpec::Op(Iif),
        "LEN" => FnSpec::Op(Len),
        "LEFT" => FnSpec::Op(Left),
        "RIGHT" => FnSpec::Op(Right),
        "MID" => FnSpec::Op(Mid),
        "TRIM" => FnSpec::Op(Trim),
        "LTRIM" => FnSpec::Op(LTrim),
        "RTRIM" => FnSpec::Op(RTrim),
        "INSTR" => FnSpec::Op(InStr),
        "REPLACE" => FnSpec::Op(Replace),
        "STRCOMP" => FnSpec::Op(StrComp),
        "UPPERCASE" | "UCASE" => FnSpec::Op(Upper),
        "LOWERCASE" | "LCASE" => FnSpec::Op(Lower),
        "HEX" => FnSpec::Op(Hex),
        "HEXTODEC" => FnSpec::Op(HexToDec),
        "SPACE" => FnSpec::Op(Space),
        "STRREVERSE" => FnSpec::Op(StrReverse),
        "FLOAT" | "TOFLOAT" => FnSpec::Op(ToFloat),
        "TOINT" => FnSpec::Op(ToInt),
        "TODATE" => FnSpec::Op(ToDate),
        "FORMATFLOAT" => FnSpec::Op(FormatFloat),
        "FORMATTIME" => FnSpec::Op(FormatTime),
        "TIMESTAMP" => FnSpec::Op(Timestamp),
        "SETTIMESTAMP" => FnSpec::Op(SetTimestamp),
        "SYSTEMTIME" => FnSpec::Op(SystemTime),
        "SOURCETIME" | "SERVERTIME" => FnSpec::Op(SourceTime),
        "LAST" => FnSpec::Stateful(StatefulKind::Last),
        "AVGRUN" => FnSpec::Stateful(StatefulKind::Running(Avg, Count)),
        "MAXRUN" => FnSpec::Stateful(StatefulKind::Running(Max, Count)),
        "MINRUN" => FnSpec::Stateful(StatefulKind::Running(Min, Count)),
        "MEDIANRUN" => FnSpec::Stateful(StatefulKind::Running(Median, Count)),
        "STDDEV" => FnSpec::Stateful(StatefulKind::Running(StdDev, Count)),
        "TOTAL" => FnSpec::Stateful(StatefulKind::Running(Total, Count)),
        "AVGRUNOVERTIME" => FnSpec::Stateful(StatefulKind::Running(Avg, OverTime)),
        "MAXRUNOVERTIME" => FnSpec::Stateful(StatefulKind::Running(Max, OverTime)),
        "MINRUNOVERTIME" => FnSpec::Stateful(StatefulKind::Running(Min, OverTime)),
        "MEDIANRUNOVERTIME" => FnSpec::Stateful(StatefulKind::Running(Median, OverTime)),
        "STDDEVOVERTIME" => FnSpec::Stateful(StatefulKind::Running(StdDev, OverTime)),
        "TOTALOVERTIME" => FnSpec::Stateful(StatefulKind::Running(Total, OverTime)),
        "AVGRUNOVERTIMEWITHRESET" => {
            FnSpec::Stateful(StatefulKind::Running(Avg, OverTimeWithReset))
        }
        "MAXRUNOVERTIMEWITHRESET" => {
            FnSpec::Stateful(StatefulKind::Running(Max, OverTimeWithReset))
        }
        "MINRUNOVERTIMEWITHRESET" => {
            FnSpec::Stateful(StatefulKind::Running(Min, OverTimeWithReset))
        }
        "STDDEVOVERTIMEWITHRESET" => {
            FnSpec::Stateful(StatefulKind::Running(StdDev, OverTimeWithReset))
        }
        "TOTALOVERTIMEWITHRESET" => {
            FnSpec::Stateful(StatefulKind::Running(Total, OverTimeWithReset))
        }
        "VALUEATTIME" => FnSpec::Stateful(StatefulKind::ValueAtTime),
        _ => return None,
    };
    Some(spec)
}
