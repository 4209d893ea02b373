//! Runtime values for the cinder VM

use std::fmt;

use crate::gc::{Handle, Heap};
use crate::object::Object;

/// A runtime value. Everything that is not a number, boolean or nil lives
/// on the heap and is referenced through a [`Handle`].
#[derive(Clone, Copy, PartialEq)]
pub enum Value {
    /// Numeric value
    Number(f64),

    /// Boolean value
    Bool(bool),

    /// Nil value
    Nil,

    /// Reference to a heap object
    Obj(Handle),
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<Handle> {
        match self {
            Value::Obj(handle) => Some(*handle),
            _ => None,
        }
    }

    /// Name of the value's type, for diagnostics
    pub fn type_name(&self, heap: &Heap) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Bool(_) => "bool",
            Value::Nil => "nil",
            Value::Obj(handle) => heap.get(*handle).map_or("object", |o| o.obj_type().name()),
        }
    }

    /// Render the value the way PRINT shows it, without running user code
    pub fn display(&self, heap: &Heap) -> String {
        let mut out = String::new();
        write_value(&mut out, *self, heap, &mut Vec::new());
        out
    }
}

fn write_value(out: &mut String, value: Value, heap: &Heap, open: &mut Vec<Handle>) {
    let handle = match value {
        Value::Obj(handle) => handle,
        other => {
            out.push_str(&format!("{:?}", other));
            return;
        }
    };

    let object = match heap.get(handle) {
        Some(object) => object,
        None => {
            out.push_str("<freed>");
            return;
        }
    };

    let name_of = |name: Handle| heap.get_string(name).unwrap_or("?");
    let fn_name = |function: Handle| match heap.get_function(function).and_then(|f| f.name) {
        Some(name) => format!("<fn {}>", name_of(name)),
        None => "<script>".to_string(),
    };

    match object {
        Object::String(s) => out.push_str(&s.chars),
        Object::Function(_) => out.push_str(&fn_name(handle)),
        Object::Native(_) => out.push_str("<native fn>"),
        Object::Closure(c) => out.push_str(&fn_name(c.function)),
        Object::Upvalue(_) => out.push_str("upvalue"),
        Object::Class(c) => out.push_str(name_of(c.name)),
        Object::Instance(i) => {
            let class = heap.get_class(i.class).map_or("?", |c| name_of(c.name));
            out.push_str(&format!("{} instance", class));
        }
        Object::BoundMethod(b) => {
            let function = heap.get_closure(b.method).map(|c| c.function);
            out.push_str(&function.map_or_else(|| "<fn ?>".to_string(), |f| fn_name(f)));
        }
        Object::Enum(e) => out.push_str(&format!("{} enum", name_of(e.name))),
        Object::List(_) | Object::Dict(_) if open.contains(&handle) => out.push_str("[...]"),
        Object::List(list) => {
            open.push(handle);
            out.push('[');
            for (i, item) in list.items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(out, *item, heap, open);
            }
            out.push(']');
            open.pop();
        }
        Object::Dict(dict) => {
            open.push(handle);
            out.push('{');
            for (i, (key, item)) in dict.entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(name_of(*key));
                out.push_str(": ");
                write_value(out, *item, heap, open);
            }
            out.push('}');
            open.pop();
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Handle> for Value {
    fn from(handle: Handle) -> Self {
        Value::Obj(handle)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Nil => write!(f, "nil"),
            Value::Obj(handle) => write!(f, "<obj #{}>", handle.0),
        }
    }
}

/// Format a number the way C's `%g` does: six significant digits, trailing
/// zeros removed, scientific notation for very small or large magnitudes.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0".to_string() } else { "0".to_string() };
    }

    // Rounding to six significant digits may bump the exponent (9.9999996 -> 10),
    // so take the exponent from the rounded scientific form.
    let sci = format!("{:.5e}", n);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some(parts) => parts,
        None => return sci,
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= 6 {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    } else {
        let decimals = (5 - exponent).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, n)).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}
