use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;

use crate::{Closure, Exception, FixnumRange, GuestThread};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u64);

/// A plain heap object: a class name plus named instance fields.
#[derive(Debug)]
pub struct GuestObject {
    pub id: ObjectId,
    pub class_name: Arc<str>,
    fields: RwLock<HashMap<String, Value>>,
}

/// Shared reference to a [`GuestObject`]. Equality is identity.
#[derive(Debug, Clone)]
pub struct ObjectRef(Arc<GuestObject>);

impl ObjectRef {
    pub fn new(class_name: &str) -> Self {
        let id = ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed));
        Self(Arc::new(GuestObject {
            id,
            class_name: Arc::from(class_name),
            fields: RwLock::new(HashMap::new()),
        }))
    }

    pub fn id(&self) -> ObjectId {
        self.0.id
    }

    pub fn class_name(&self) -> &str {
        &self.0.class_name
    }

    /// Reads a field, `nil` when it was never written.
    pub fn field(&self, name: &str) -> Value {
        self.0.fields.read().get(name).cloned().unwrap_or(Value::Nil)
    }

    pub fn set_field(&self, name: &str, value: Value) {
        self.0.fields.write().insert(name.to_string(), value);
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ObjectRef {}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Fixnum(i64),
    String(Arc<str>),
    Symbol(Arc<str>),
    Array(Vec<Value>),
    Range(FixnumRange),
    Object(ObjectRef),
    Proc(Closure),
    Exception(Exception),
    Thread(Arc<GuestThread>),
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::String(Arc::from(s))
    }

    pub fn symbol(s: &str) -> Self {
        Value::Symbol(Arc::from(s))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Everything except `nil` and `false` is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_fixnum(&self) -> Option<i64> {
        match self {
            Value::Fixnum(n) => Some(*n),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "NilClass",
            Value::Bool(true) => "TrueClass",
            Value::Bool(false) => "FalseClass",
            Value::Fixnum(_) => "Integer",
            Value::String(_) => "String",
            Value::Symbol(_) => "Symbol",
            Value::Array(_) => "Array",
            Value::Range(_) => "Range",
            Value::Object(_) => "Object",
            Value::Proc(_) => "Proc",
            Value::Exception(_) => "Exception",
            Value::Thread(_) => "Thread",
        }
    }

    /// Identity comparison: heap values compare by reference, immediates
    /// by value.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            (Value::Thread(a), Value::Thread(b)) => Arc::ptr_eq(a, b),
            (Value::Proc(a), Value::Proc(b)) => a == b,
            (Value::String(a), Value::String(b)) => Arc::ptr_eq(a, b),
            (Value::Array(_), Value::Array(_)) => false,
            _ => self == other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Proc(a), Value::Proc(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            (Value::Thread(a), Value::Thread(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Fixnum(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

// inspect-style rendering
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Fixnum(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Symbol(s) => write!(f, ":{s}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Range(range) => write!(f, "{range}"),
            Value::Object(obj) => {
                write!(f, "#<{}:{}>", obj.class_name(), obj.id().0)
            }
            Value::Proc(block) => {
                let loc = block.binding().location();
                write!(f, "#<Proc:{}:{}", loc.file, loc.line)?;
                if block.kind() == crate::BlockKind::Lambda {
                    write!(f, " (lambda)")?;
                }
                write!(f, ">")
            }
            Value::Exception(e) => {
                write!(f, "#<{}: {}>", e.class().name(), e.message())
            }
            Value::Thread(t) => {
                write!(f, "#<Thread:{} {}>", t.id, t.status().name())
            }
        }
    }
}
