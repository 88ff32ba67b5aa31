use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;

use crate::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: Arc<str>,
    pub line: u32,
    pub label: Arc<str>,
}

impl SourceLocation {
    pub fn new(file: &str, line: u32, label: &str) -> Self {
        Self {
            file: Arc::from(file),
            line,
            label: Arc::from(label),
        }
    }

    /// Location of code implemented by the runtime itself.
    pub fn native(label: &str) -> Self {
        Self::new("<internal>", 0, label)
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:in `{}'", self.file, self.line, self.label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Public,
    Private,
    Protected,
    ModuleFunction,
}

/// The method a block was lexically created in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodId {
    pub owner: Arc<str>,
    pub name: Arc<str>,
}

impl MethodId {
    pub fn new(owner: &str, name: &str) -> Self {
        Self {
            owner: Arc::from(owner),
            name: Arc::from(name),
        }
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.name)
    }
}

#[derive(Debug)]
struct ScopeNode {
    name: Arc<str>,
    parent: DynamicScope,
}

/// Persistent chain of dynamic scopes (module nesting). Cheap to clone,
/// compared by identity.
#[derive(Debug, Clone, Default)]
pub struct DynamicScope(Option<Arc<ScopeNode>>);

impl DynamicScope {
    pub fn root() -> Self {
        Self(None)
    }

    pub fn push(&self, name: &str) -> Self {
        Self(Some(Arc::new(ScopeNode {
            name: Arc::from(name),
            parent: self.clone(),
        })))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.as_ref().map(|node| &*node.name)
    }

    pub fn parent(&self) -> Option<&DynamicScope> {
        self.0.as_ref().map(|node| &node.parent)
    }

    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cur = self;
        while let Some(parent) = cur.parent() {
            depth += 1;
            cur = parent;
        }
        depth
    }

    pub fn same(&self, other: &DynamicScope) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Lexical locals of one block-literal scope.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    locals: HashMap<String, Value>,
}

impl Frame {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.locals.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.locals.insert(name.to_string(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.locals.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.locals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }
}

/// A frame shared by every closure captured from the same scope.
/// The lock only keeps single reads and writes memory safe.
pub type FrameRef = Arc<RwLock<Frame>>;

/// Captured lexical context of a block. Locals live in the shared frame;
/// everything else is fixed at capture. Eval clones get a new binding via
/// [`Binding::rebind`].
#[derive(Debug)]
pub struct Binding {
    self_value: Value,
    frame: FrameRef,
    visibility: Visibility,
    scope: DynamicScope,
    method: Option<MethodId>,
    location: SourceLocation,
}

impl Binding {
    pub fn new(
        self_value: Value,
        frame: FrameRef,
        visibility: Visibility,
        scope: DynamicScope,
        method: Option<MethodId>,
        location: SourceLocation,
    ) -> Arc<Self> {
        Arc::new(Self {
            self_value,
            frame,
            visibility,
            scope,
            method,
            location,
        })
    }

    /// Binding with a fresh, empty frame and default visibility/scope.
    pub fn toplevel(self_value: Value, location: SourceLocation) -> Arc<Self> {
        Self::new(
            self_value,
            Self::new_frame(),
            Visibility::Private,
            DynamicScope::root(),
            None,
            location,
        )
    }

    pub fn new_frame() -> FrameRef {
        Arc::new(RwLock::new(Frame::default()))
    }

    pub fn self_value(&self) -> Value {
        self.self_value.clone()
    }

    pub fn frame(&self) -> &FrameRef {
        &self.frame
    }

    pub fn local(&self, name: &str) -> Option<Value> {
        self.frame.read().get(name).cloned()
    }

    pub fn set_local(&self, name: &str, value: Value) {
        self.frame.write().set(name, value);
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn scope(&self) -> &DynamicScope {
        &self.scope
    }

    pub fn method(&self) -> Option<&MethodId> {
        self.method.as_ref()
    }

    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    /// Copy with its own frame: later writes on either side stay private.
    pub fn duplicate(&self) -> Arc<Self> {
        let frame = self.frame.read().clone();
        Self::new(
            self.self_value(),
            Arc::new(RwLock::new(frame)),
            self.visibility,
            self.scope.clone(),
            self.method.clone(),
            self.location.clone(),
        )
    }

    /// Copy sharing the frame but running against another `self`.
    pub fn rebind(&self, self_value: Value) -> Arc<Self> {
        Self::new(
            self_value,
            Arc::clone(&self.frame),
            self.visibility,
            self.scope.clone(),
            self.method.clone(),
            self.location.clone(),
        )
    }
}

impl PartialEq for Binding {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        Arc::ptr_eq(&self.frame, &other.frame)
            && self.scope.same(&other.scope)
            && self.self_value.identical(&other.self_value)
    }
}
