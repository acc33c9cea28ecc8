//! Shared fixtures for the integration suites: a class builder on top of
//! the crate's own writer, an in-memory host process and a small bytecode
//! interpreter that runs woven bodies and routes `Spy` calls into the real
//! dispatch bridge.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use jvm_weaver::boundary::HostProcess;
use jvm_weaver::bytecode::opcodes::*;
use jvm_weaver::bytecode::{assemble, decode, Insn, Label, MethodBody, MethodContext, SuperclassHierarchy, TryCatch};
use jvm_weaver::classfile::{access::*, AttributeInfo, ClassFile, CodeAttribute, ConstantPool, CpInfo, MethodInfo};
use jvm_weaver::descriptor::{to_internal_name, to_java_name, JavaType, MethodDescriptor};
use jvm_weaver::error::{HostError, ListenerCallbackError, ListenerError};
use jvm_weaver::event::{Event, EventTypes, ObjectRef, Value, Verdict};
use jvm_weaver::listener::{next_listener_id, EventListener, ListenerRegistration, ListenerRegistry};
use jvm_weaver::spy;
use jvm_weaver::structure::LoadingBoundary;
use jvm_weaver::transformer::ClassFileTransformer;

pub const OBJECT: &str = "java/lang/Object";

// ---------------------------------------------------------------------------
// class builder
// ---------------------------------------------------------------------------

/// Builds a class whose methods are written as symbolic instructions and
/// assembled (frames included) by the crate.
pub struct ClassBuilder {
    class: ClassFile,
    hierarchy: SuperclassHierarchy,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        Self::with_super(name, OBJECT)
    }

    pub fn with_super(name: &str, super_name: &str) -> Self {
        let mut constant_pool = ConstantPool::new();
        let this_class = constant_pool.add_class(name).unwrap();
        let super_class = constant_pool.add_class(super_name).unwrap();
        constant_pool.add_utf8("Code").unwrap();
        let mut hierarchy = SuperclassHierarchy::new();
        hierarchy.insert(name, super_name);
        for (class, parent) in BUILTIN_SUPERS {
            hierarchy.insert(*class, *parent);
        }
        Self {
            class: ClassFile {
                minor_version: 0,
                major_version: 52,
                constant_pool,
                access_flags: ACC_PUBLIC | ACC_SUPER,
                this_class,
                super_class,
                interfaces: Vec::new(),
                fields: Vec::new(),
                methods: Vec::new(),
                attributes: Vec::new(),
            },
            hierarchy,
        }
    }

    pub fn interface(mut self, name: &str) -> Self {
        let index = self.class.constant_pool.add_class(name).unwrap();
        self.class.interfaces.push(index);
        self
    }

    /// Class file major version; methods added afterwards follow it.
    pub fn version(mut self, major: u16) -> Self {
        self.class.major_version = major;
        self
    }

    /// Teach the frame computation that `class` extends `super_name`.
    pub fn knows(mut self, class: &str, super_name: &str) -> Self {
        self.hierarchy.insert(class, super_name);
        self
    }

    pub fn name(&self) -> String {
        self.class.this_class_name().unwrap().to_string()
    }

    /// Add a method whose body `f` writes.
    pub fn method(mut self, access_flags: u16, name: &str, desc: &str, f: impl FnOnce(&mut Code<'_>)) -> Self {
        let owner = self.name();
        let descriptor = MethodDescriptor::parse(desc).unwrap();
        let mut body = MethodBody::new();
        {
            let mut code = Code { cp: &mut self.class.constant_pool, body: &mut body };
            f(&mut code);
        }
        let ctx = MethodContext { owner: &owner, access_flags, name, descriptor: &descriptor };
        let code = assemble(&body, ctx, &mut self.class.constant_pool, &self.hierarchy, self.class.major_version)
            .unwrap_or_else(|e| panic!("{owner}.{name}{desc} does not assemble: {e}"));
        self.push_method(access_flags, name, desc, vec![AttributeInfo::Code(code)])
    }

    /// Add a method whose code attribute is given as is.
    pub fn raw_method(mut self, access_flags: u16, name: &str, desc: &str, code: CodeAttribute) -> Self {
        for attribute in &code.attributes {
            self.class.constant_pool.add_utf8(attribute.name()).unwrap();
        }
        self.push_method(access_flags, name, desc, vec![AttributeInfo::Code(code)])
    }

    /// Add a method without code.
    pub fn abstract_method(self, access_flags: u16, name: &str, desc: &str) -> Self {
        self.push_method(access_flags, name, desc, Vec::new())
    }

    /// The usual `<init>()V` calling the superclass constructor.
    pub fn default_constructor(self) -> Self {
        let super_name = self.class.super_class_name().unwrap().unwrap_or(OBJECT).to_string();
        self.method(ACC_PUBLIC, "<init>", "()V", |c| {
            c.var(ALOAD, 0);
            c.invoke(INVOKESPECIAL, &super_name, "<init>", "()V");
            c.op(RETURN);
        })
    }

    fn push_method(mut self, access_flags: u16, name: &str, desc: &str, attributes: Vec<AttributeInfo>) -> Self {
        let name_index = self.class.constant_pool.add_utf8(name).unwrap();
        let descriptor_index = self.class.constant_pool.add_utf8(desc).unwrap();
        self.class.methods.push(MethodInfo { access_flags, name_index, descriptor_index, attributes });
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.class.to_bytes().unwrap()
    }
}

/// Writes one method body.
pub struct Code<'a> {
    pub cp: &'a mut ConstantPool,
    body: &'a mut MethodBody,
}

impl Code<'_> {
    pub fn label(&mut self) -> Label {
        self.body.new_label()
    }

    pub fn place(&mut self, label: Label) {
        self.body.insns.push(Insn::Label(label));
    }

    pub fn line(&mut self, line: u16) {
        let label = self.label();
        self.place(label);
        self.body.insns.push(Insn::Line(line));
    }

    pub fn op(&mut self, op: u8) {
        self.body.insns.push(Insn::Simple(op));
    }

    pub fn int(&mut self, value: i32) {
        let insn = match value {
            -1..=5 => Insn::Simple((ICONST_0 as i32 + value) as u8),
            -128..=127 => Insn::Int { op: BIPUSH, value },
            -32768..=32767 => Insn::Int { op: SIPUSH, value },
            _ => Insn::Ldc { index: self.cp.add_integer(value).unwrap() },
        };
        self.body.insns.push(insn);
    }

    pub fn string(&mut self, value: &str) {
        let index = self.cp.add_string(value).unwrap();
        self.body.insns.push(Insn::Ldc { index });
    }

    pub fn var(&mut self, op: u8, slot: u16) {
        self.body.insns.push(Insn::Var { op, slot });
    }

    pub fn jump(&mut self, op: u8, target: Label) {
        self.body.insns.push(Insn::Jump { op, target });
    }

    pub fn invoke(&mut self, op: u8, owner: &str, name: &str, desc: &str) {
        let index = self.cp.add_methodref(owner, name, desc).unwrap();
        self.body.insns.push(Insn::Method { op, index });
    }

    pub fn type_insn(&mut self, op: u8, class: &str) {
        let class = self.cp.add_class(class).unwrap();
        self.body.insns.push(Insn::Type { op, class });
    }

    pub fn field(&mut self, op: u8, owner: &str, name: &str, desc: &str) {
        let index = self.cp.add_fieldref(owner, name, desc).unwrap();
        self.body.insns.push(Insn::Field { op, index });
    }

    /// `throw new <class>(message)`
    pub fn throw_new(&mut self, class: &str, message: &str) {
        self.type_insn(NEW, class);
        self.op(DUP);
        self.string(message);
        self.invoke(INVOKESPECIAL, class, "<init>", "(Ljava/lang/String;)V");
        self.op(ATHROW);
    }

    pub fn try_catch(&mut self, start: Label, end: Label, handler: Label, catch_type: Option<&str>) {
        let catch_type = catch_type.map_or(0, |c| self.cp.add_class(c).unwrap());
        self.body.try_catch.push(TryCatch { start, end, handler, catch_type });
    }
}

// ---------------------------------------------------------------------------
// listeners
// ---------------------------------------------------------------------------

pub type Events = Arc<Mutex<Vec<Event>>>;

/// A listener that records every event it sees, then lets `react` decide.
pub fn recording<F>(react: F) -> (Events, Arc<dyn EventListener>)
where
    F: Fn(&mut Event) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    let events: Events = Arc::default();
    let sink = events.clone();
    let listener: Arc<dyn EventListener> = Arc::new(move |event: &mut Event| {
        sink.lock().unwrap().push(event.clone());
        react(event)
    });
    (events, listener)
}

pub fn quiet(_: &mut Event) -> Result<(), ListenerError> {
    Ok(())
}

/// Route `namespace` straight to a fresh registry holding one listener,
/// without going through a boundary. Returns the listener id.
pub fn register_direct(namespace: &str, event_types: EventTypes, listener: Arc<dyn EventListener>) -> i32 {
    let registry = Arc::new(ListenerRegistry::new());
    let listener_id = registry.register(ListenerRegistration {
        listener_id: next_listener_id(),
        event_types,
        namespace: namespace.to_string(),
        enable_unsafe: false,
        listener,
    });
    spy::init(namespace, registry);
    listener_id
}

/// Register one more listener in a registry the caller routes with
/// `spy::init`.
pub fn register_into(
    registry: &Arc<ListenerRegistry>,
    namespace: &str,
    event_types: EventTypes,
    listener: Arc<dyn EventListener>,
) -> i32 {
    registry.register(ListenerRegistration {
        listener_id: next_listener_id(),
        event_types,
        namespace: namespace.to_string(),
        enable_unsafe: false,
        listener,
    })
}

/// Compact rendering of events for order assertions.
pub fn describe(events: &Events) -> Vec<String> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|event| match event {
            Event::Before { method_name, arguments, .. } => format!("before {method_name} {arguments:?}"),
            Event::Return { value } => format!("return {value:?}"),
            Event::Throws { throwable } => format!("throws {}", class_of(throwable)),
            Event::Line { line } => format!("line {line}"),
            Event::CallBefore { owner, name, .. } => format!("call {owner}.{name}"),
            Event::CallReturn => "call-return".to_string(),
            Event::CallThrows { throwable_class } => format!("call-throws {throwable_class}"),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// host
// ---------------------------------------------------------------------------

/// Host process that keeps transformers in a list and applies them in
/// registration order when asked to load a class.
#[derive(Default)]
pub struct TestHost {
    pub bootstrap: Mutex<Vec<String>>,
    transformers: Mutex<Vec<Arc<dyn ClassFileTransformer>>>,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run the load hook for `bytes` and return what would be defined.
    pub fn load(&self, boundary: &LoadingBoundary, bytes: &[u8]) -> Vec<u8> {
        let name = ClassFile::parse(bytes).unwrap().this_class_name().unwrap().to_string();
        let transformers: Vec<Arc<dyn ClassFileTransformer>> = self.transformers.lock().unwrap().clone();
        let mut current = bytes.to_vec();
        for transformer in transformers {
            if let Some(rewritten) = transformer.transform(boundary, &name, None, &current) {
                current = rewritten;
            }
        }
        current
    }

    pub fn transformer_count(&self) -> usize {
        self.transformers.lock().unwrap().len()
    }
}

impl HostProcess for TestHost {
    fn define_bootstrap_class(&self, internal_name: &str, _bytes: &[u8]) -> Result<(), HostError> {
        self.bootstrap.lock().unwrap().push(internal_name.to_string());
        Ok(())
    }

    fn add_transformer(&self, transformer: Arc<dyn ClassFileTransformer>) -> Result<(), HostError> {
        self.transformers.lock().unwrap().push(transformer);
        Ok(())
    }

    fn remove_transformer(&self, transformer: &Arc<dyn ClassFileTransformer>) -> Result<(), HostError> {
        self.transformers.lock().unwrap().retain(|t| !Arc::ptr_eq(t, transformer));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// interpreter
// ---------------------------------------------------------------------------

const BUILTIN_SUPERS: &[(&str, &str)] = &[
    ("java/lang/Throwable", OBJECT),
    ("java/lang/Exception", "java/lang/Throwable"),
    ("java/lang/Error", "java/lang/Throwable"),
    ("java/lang/RuntimeException", "java/lang/Exception"),
    ("java/io/IOException", "java/lang/Exception"),
    ("java/lang/IllegalStateException", "java/lang/RuntimeException"),
    ("java/lang/IllegalArgumentException", "java/lang/RuntimeException"),
    ("java/lang/ArithmeticException", "java/lang/RuntimeException"),
    ("java/lang/ClassCastException", "java/lang/RuntimeException"),
    ("java/lang/NullPointerException", "java/lang/RuntimeException"),
    ("java/lang/UnsupportedOperationException", "java/lang/RuntimeException"),
    ("java/lang/Number", OBJECT),
    ("java/lang/Integer", "java/lang/Number"),
    ("java/lang/Long", "java/lang/Number"),
    ("java/lang/Short", "java/lang/Number"),
    ("java/lang/Byte", "java/lang/Number"),
    ("java/lang/Float", "java/lang/Number"),
    ("java/lang/Double", "java/lang/Number"),
    ("java/lang/Boolean", OBJECT),
    ("java/lang/Character", OBJECT),
    ("java/lang/String", OBJECT),
];

/// A plain object: its fields by name.
#[derive(Default)]
pub struct Instance {
    pub fields: Mutex<HashMap<String, Value>>,
}

struct Array(Mutex<Vec<Value>>);

struct Ret {
    state: i32,
    respond: Value,
}

struct ClassObject(String);

/// A throwable of `class` (internal name) carrying `message`.
pub fn throwable(class: &str, message: &str) -> Value {
    let instance = Instance::default();
    instance.fields.lock().unwrap().insert("message".into(), Value::string(message));
    Value::Object(ObjectRef::new(&to_java_name(class), instance))
}

/// Java class name of a thrown value.
pub fn class_of(value: &Value) -> String {
    value.class_name().unwrap_or("null").to_string()
}

pub fn message_of(value: &Value) -> Option<String> {
    let Value::Object(object) = value else { return None };
    let instance = object.downcast_ref::<Instance>()?;
    let fields = instance.fields.lock().unwrap();
    match fields.get("message") {
        Some(Value::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn new_array(values: Vec<Value>) -> Value {
    Value::Object(ObjectRef::new("[Ljava.lang.Object;", Array(Mutex::new(values))))
}

fn as_str(value: &Value) -> &str {
    match value {
        Value::String(s) => s,
        other => panic!("expected a string, got {other:?}"),
    }
}

fn as_int(value: &Value) -> i32 {
    value.as_i32().unwrap_or_else(|| match value {
        Value::Boolean(b) => *b as i32,
        other => panic!("expected an int, got {other:?}"),
    })
}

fn as_long(value: &Value) -> i64 {
    match value {
        Value::Long(v) => *v,
        other => panic!("expected a long, got {other:?}"),
    }
}

fn as_double(value: &Value) -> f64 {
    match value {
        Value::Double(v) => *v,
        other => panic!("expected a double, got {other:?}"),
    }
}

fn is_wide(value: &Value) -> bool {
    matches!(value, Value::Long(_) | Value::Double(_))
}

enum Flow {
    Next,
    Jump(Label),
    Return(Value),
    Throw(Value),
}

/// Runs methods of loaded classes.
#[derive(Default)]
pub struct Vm {
    classes: HashMap<String, ClassFile>,
    statics: Mutex<HashMap<String, Value>>,
}

impl Vm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a class; returns its internal name.
    pub fn load(&mut self, bytes: &[u8]) -> String {
        let class = ClassFile::parse(bytes).unwrap();
        let name = class.this_class_name().unwrap().to_string();
        self.classes.insert(name.clone(), class);
        name
    }

    pub fn invoke_static(&self, owner: &str, name: &str, desc: &str, args: Vec<Value>) -> Result<Value, Value> {
        self.call_method(owner, name, desc, None, args)
    }

    pub fn invoke_virtual(&self, receiver: Value, name: &str, desc: &str, args: Vec<Value>) -> Result<Value, Value> {
        let class = to_internal_name(receiver.class_name().expect("receiver is not null"));
        self.call_method(&class, name, desc, Some(receiver), args)
    }

    /// `new owner(args)`
    pub fn construct(&self, owner: &str, desc: &str, args: Vec<Value>) -> Result<Value, Value> {
        let object = Value::Object(ObjectRef::new(&to_java_name(owner), Instance::default()));
        self.call_method(owner, "<init>", desc, Some(object.clone()), args)?;
        Ok(object)
    }

    fn find_method(&self, owner: &str, name: &str, desc: &str) -> Option<(&ClassFile, &MethodInfo)> {
        let mut current = Some(owner.to_string());
        while let Some(class_name) = current {
            let class = self.classes.get(&class_name)?;
            let cp = &class.constant_pool;
            let found = class
                .methods
                .iter()
                .find(|m| m.name(cp).ok() == Some(name) && m.descriptor(cp).ok() == Some(desc));
            if let Some(method) = found {
                return Some((class, method));
            }
            current = class.super_class_name().unwrap().map(str::to_string);
        }
        None
    }

    fn call_method(
        &self,
        owner: &str,
        name: &str,
        desc: &str,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Value, Value> {
        let (class, method) = self
            .find_method(owner, name, desc)
            .unwrap_or_else(|| panic!("no method {owner}.{name}{desc}"));
        self.execute(class, method, receiver, args)
    }

    fn execute(&self, class: &ClassFile, method: &MethodInfo, receiver: Option<Value>, args: Vec<Value>) -> Result<Value, Value> {
        let cp = &class.constant_pool;
        let code = method.code().expect("method has code");
        let body = decode(code).expect("decodable body");
        let labels: HashMap<Label, usize> = body
            .insns
            .iter()
            .enumerate()
            .filter_map(|(i, insn)| if let Insn::Label(l) = insn { Some((*l, i)) } else { None })
            .collect();

        let descriptor = MethodDescriptor::parse(method.descriptor(cp).unwrap()).unwrap();
        let slots = descriptor.parameter_slots() + 1;
        let mut locals = vec![Value::Null; (code.max_locals as usize).max(slots)];
        let mut slot = 0;
        if let Some(this) = receiver {
            locals[0] = this;
            slot = 1;
        }
        for (value, ty) in args.into_iter().zip(&descriptor.parameters) {
            locals[slot] = value;
            slot += ty.size();
        }

        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0;
        loop {
            let insn = body.insns.get(pc).unwrap_or_else(|| panic!("fell off the end of the code"));
            match self.step(cp, insn, &mut stack, &mut locals) {
                Flow::Next => pc += 1,
                Flow::Jump(label) => pc = labels[&label],
                Flow::Return(value) => return Ok(value),
                Flow::Throw(exception) => {
                    let handler = body.try_catch.iter().find(|tc| {
                        let covered = labels[&tc.start] <= pc && pc < labels[&tc.end];
                        covered
                            && (tc.catch_type == 0 || self.is_instance(&exception, cp.class_name(tc.catch_type).unwrap()))
                    });
                    match handler {
                        Some(tc) => {
                            stack.clear();
                            stack.push(exception);
                            pc = labels[&tc.handler];
                        }
                        None => return Err(exception),
                    }
                }
            }
        }
    }

    fn super_of(&self, name: &str) -> Option<String> {
        if name == OBJECT {
            return None;
        }
        if let Some(class) = self.classes.get(name) {
            return class.super_class_name().unwrap().map(str::to_string);
        }
        let parent = BUILTIN_SUPERS.iter().find(|(c, _)| *c == name).map_or(OBJECT, |(_, p)| *p);
        Some(parent.to_string())
    }

    /// `checkcast` semantics: null is an instance of everything.
    fn is_instance(&self, value: &Value, target: &str) -> bool {
        let Some(class) = value.class_name() else { return true };
        let mut current = Some(to_internal_name(class));
        while let Some(name) = current {
            if name == target {
                return true;
            }
            current = self.super_of(&name);
        }
        false
    }

    fn throw(&self, class: &str, message: &str) -> Flow {
        Flow::Throw(throwable(class, message))
    }

    fn step(&self, cp: &ConstantPool, insn: &Insn, stack: &mut Vec<Value>, locals: &mut [Value]) -> Flow {
        let pop = |stack: &mut Vec<Value>| stack.pop().expect("operand stack underflow");
        match insn {
            Insn::Label(_) | Insn::Line(_) => {}
            Insn::Int { value, .. } => stack.push(Value::Int(*value)),
            Insn::Var { op, slot } => {
                let slot = *slot as usize;
                match *op {
                    ILOAD | LLOAD | FLOAD | DLOAD | ALOAD => stack.push(locals[slot].clone()),
                    _ => locals[slot] = pop(stack),
                }
            }
            Insn::Iinc { slot, delta } => {
                let slot = *slot as usize;
                locals[slot] = Value::Int(as_int(&locals[slot]).wrapping_add(*delta as i32));
            }
            Insn::Ldc { index } => stack.push(match cp.get(*index).unwrap() {
                CpInfo::Integer(v) => Value::Int(*v),
                CpInfo::Float(v) => Value::Float(*v),
                CpInfo::Long(v) => Value::Long(*v),
                CpInfo::Double(v) => Value::Double(*v),
                CpInfo::String { string_index } => Value::string(cp.get_utf8(*string_index).unwrap()),
                other => panic!("unsupported constant {other:?}"),
            }),
            Insn::Jump { op, target } => {
                let taken = match *op {
                    GOTO => true,
                    IFEQ | IFNE | IFLT | IFGE | IFGT | IFLE => {
                        let v = as_int(&pop(stack));
                        match *op {
                            IFEQ => v == 0,
                            IFNE => v != 0,
                            IFLT => v < 0,
                            IFGE => v >= 0,
                            IFGT => v > 0,
                            _ => v <= 0,
                        }
                    }
                    IF_ICMPEQ | IF_ICMPNE | IF_ICMPLT | IF_ICMPGE | IF_ICMPGT | IF_ICMPLE => {
                        let b = as_int(&pop(stack));
                        let a = as_int(&pop(stack));
                        match *op {
                            IF_ICMPEQ => a == b,
                            IF_ICMPNE => a != b,
                            IF_ICMPLT => a < b,
                            IF_ICMPGE => a >= b,
                            IF_ICMPGT => a > b,
                            _ => a <= b,
                        }
                    }
                    IF_ACMPEQ | IF_ACMPNE => {
                        let b = pop(stack);
                        let a = pop(stack);
                        (a == b) == (*op == IF_ACMPEQ)
                    }
                    IFNULL => pop(stack).is_null(),
                    IFNONNULL => !pop(stack).is_null(),
                    other => panic!("unsupported branch {other:#x}"),
                };
                if taken {
                    return Flow::Jump(*target);
                }
            }
            Insn::Type { op, class } => {
                let class = cp.class_name(*class).unwrap();
                match *op {
                    NEW => stack.push(Value::Object(ObjectRef::new(&to_java_name(class), Instance::default()))),
                    ANEWARRAY => {
                        let count = as_int(&pop(stack));
                        if count < 0 {
                            return self.throw("java/lang/NegativeArraySizeException", "");
                        }
                        stack.push(new_array(vec![Value::Null; count as usize]));
                    }
                    CHECKCAST => {
                        let value = stack.last().expect("operand stack underflow");
                        if !self.is_instance(value, class) {
                            let message = format!("{} cannot be cast to {}", class_of(value), to_java_name(class));
                            return self.throw("java/lang/ClassCastException", &message);
                        }
                    }
                    INSTANCEOF => {
                        let value = pop(stack);
                        let result = !value.is_null() && self.is_instance(&value, class);
                        stack.push(Value::Int(result as i32));
                    }
                    other => panic!("unsupported type instruction {other:#x}"),
                }
            }
            Insn::Field { op, index } => {
                let (owner, name, _) = cp.member_ref(*index).unwrap();
                match *op {
                    GETSTATIC => {
                        let value = self.statics.lock().unwrap().get(&format!("{owner}.{name}")).cloned();
                        stack.push(value.unwrap_or(Value::Int(0)));
                    }
                    PUTSTATIC => {
                        let value = pop(stack);
                        self.statics.lock().unwrap().insert(format!("{owner}.{name}"), value);
                    }
                    GETFIELD => {
                        let target = pop(stack);
                        let Value::Object(object) = &target else {
                            return self.throw("java/lang/NullPointerException", name);
                        };
                        if let Some(ret) = object.downcast_ref::<Ret>() {
                            stack.push(match name {
                                spy::RET_STATE_FIELD => Value::Int(ret.state),
                                _ => ret.respond.clone(),
                            });
                        } else {
                            let instance = object.downcast_ref::<Instance>().expect("plain object");
                            let value = instance.fields.lock().unwrap().get(name).cloned();
                            stack.push(value.unwrap_or(Value::Int(0)));
                        }
                    }
                    _ => {
                        let value = pop(stack);
                        let target = pop(stack);
                        let Value::Object(object) = &target else {
                            return self.throw("java/lang/NullPointerException", name);
                        };
                        let instance = object.downcast_ref::<Instance>().expect("plain object");
                        instance.fields.lock().unwrap().insert(name.to_string(), value);
                    }
                }
            }
            Insn::Method { op, index } => {
                let (owner, name, desc) = cp.member_ref(*index).unwrap();
                let descriptor = MethodDescriptor::parse(desc).unwrap();
                let args = stack.split_off(stack.len() - descriptor.parameters.len());
                let receiver = if *op == INVOKESTATIC { None } else { Some(pop(stack)) };
                if receiver.as_ref().map_or(false, Value::is_null) {
                    return self.throw("java/lang/NullPointerException", name);
                }
                match self.invoke(*op, owner, name, desc, receiver, args) {
                    Ok(value) => {
                        if descriptor.return_type != JavaType::Void {
                            stack.push(value);
                        }
                    }
                    Err(exception) => return Flow::Throw(exception),
                }
            }
            Insn::Simple(op) => return self.simple(*op, stack),
            other => panic!("unsupported instruction {other:?}"),
        }
        Flow::Next
    }

    fn simple(&self, op: u8, stack: &mut Vec<Value>) -> Flow {
        let pop = |stack: &mut Vec<Value>| stack.pop().expect("operand stack underflow");
        match op {
            NOP => {}
            ACONST_NULL => stack.push(Value::Null),
            ICONST_M1..=ICONST_5 => stack.push(Value::Int(op as i32 - ICONST_0 as i32)),
            LCONST_0 | LCONST_1 => stack.push(Value::Long((op - LCONST_0) as i64)),
            FCONST_0..=FCONST_2 => stack.push(Value::Float((op - FCONST_0) as f32)),
            DCONST_0 | DCONST_1 => stack.push(Value::Double((op - DCONST_0) as f64)),
            POP => {
                pop(stack);
            }
            POP2 => {
                if !is_wide(&pop(stack)) {
                    pop(stack);
                }
            }
            DUP => {
                let top = stack.last().expect("operand stack underflow").clone();
                stack.push(top);
            }
            DUP_X1 => {
                let a = pop(stack);
                let b = pop(stack);
                stack.extend([a.clone(), b, a]);
            }
            DUP2 => {
                let top = stack.last().expect("operand stack underflow").clone();
                if is_wide(&top) {
                    stack.push(top);
                } else {
                    let below = stack[stack.len() - 2].clone();
                    stack.extend([below, top]);
                }
            }
            SWAP => {
                let a = pop(stack);
                let b = pop(stack);
                stack.extend([a, b]);
            }
            IADD | ISUB | IMUL | IDIV | IREM => {
                let b = as_int(&pop(stack));
                let a = as_int(&pop(stack));
                if (op == IDIV || op == IREM) && b == 0 {
                    return self.throw("java/lang/ArithmeticException", "/ by zero");
                }
                stack.push(Value::Int(match op {
                    IADD => a.wrapping_add(b),
                    ISUB => a.wrapping_sub(b),
                    IMUL => a.wrapping_mul(b),
                    IDIV => a.wrapping_div(b),
                    _ => a.wrapping_rem(b),
                }));
            }
            INEG => {
                let a = as_int(&pop(stack));
                stack.push(Value::Int(a.wrapping_neg()));
            }
            LADD | LSUB | LMUL => {
                let b = as_long(&pop(stack));
                let a = as_long(&pop(stack));
                stack.push(Value::Long(match op {
                    LADD => a.wrapping_add(b),
                    LSUB => a.wrapping_sub(b),
                    _ => a.wrapping_mul(b),
                }));
            }
            DADD | DMUL => {
                let b = as_double(&pop(stack));
                let a = as_double(&pop(stack));
                stack.push(Value::Double(if op == DADD { a + b } else { a * b }));
            }
            I2L => {
                let a = as_int(&pop(stack));
                stack.push(Value::Long(a as i64));
            }
            L2I => {
                let a = as_long(&pop(stack));
                stack.push(Value::Int(a as i32));
            }
            I2D => {
                let a = as_int(&pop(stack));
                stack.push(Value::Double(a as f64));
            }
            AALOAD | AASTORE | ARRAYLENGTH => {
                let value = if op == AASTORE { Some(pop(stack)) } else { None };
                let index = if op == ARRAYLENGTH { 0 } else { as_int(&pop(stack)) as usize };
                let array = pop(stack);
                let Value::Object(object) = &array else {
                    return self.throw("java/lang/NullPointerException", "array");
                };
                let Array(items) = object.downcast_ref::<Array>().expect("array");
                let mut items = items.lock().unwrap();
                match (op, value) {
                    (AASTORE, Some(value)) => items[index] = value,
                    (AALOAD, _) => stack.push(items[index].clone()),
                    _ => stack.push(Value::Int(items.len() as i32)),
                }
            }
            IRETURN | LRETURN | FRETURN | DRETURN | ARETURN => return Flow::Return(pop(stack)),
            RETURN => return Flow::Return(Value::Null),
            ATHROW => {
                let exception = pop(stack);
                if exception.is_null() {
                    return self.throw("java/lang/NullPointerException", "throw null");
                }
                return Flow::Throw(exception);
            }
            other => panic!("unsupported opcode {other:#x}"),
        }
        Flow::Next
    }

    fn invoke(
        &self,
        op: u8,
        owner: &str,
        name: &str,
        desc: &str,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Value, Value> {
        if owner == spy::SPY_CLASS {
            return self.spy(name, args);
        }
        if self.classes.contains_key(owner) {
            let class = match (&receiver, op) {
                (Some(r), INVOKEVIRTUAL | INVOKEINTERFACE) => to_internal_name(r.class_name().unwrap_or(owner)),
                _ => owner.to_string(),
            };
            return self.call_method(&class, name, desc, receiver, args);
        }
        if name == "valueOf" {
            return Ok(box_value(owner, &args[0]));
        }
        let this = receiver.unwrap_or_default();
        Ok(match (owner, name) {
            (_, "<init>") => {
                if let (Value::Object(object), Some(Value::String(message))) = (&this, args.first()) {
                    if let Some(instance) = object.downcast_ref::<Instance>() {
                        instance.fields.lock().unwrap().insert("message".into(), Value::String(message.clone()));
                    }
                }
                Value::Null
            }
            (_, "getMessage") => message_of(&this).map_or(Value::Null, |m| Value::string(&m)),
            (_, "getClass") => {
                let name = this.class_name().unwrap_or("null").to_string();
                Value::Object(ObjectRef::new("java.lang.Class", ClassObject(name)))
            }
            ("java/lang/Class", "getName") => {
                let Value::Object(object) = &this else { unreachable!() };
                Value::string(&object.downcast_ref::<ClassObject>().expect("class object").0)
            }
            ("java/lang/String", "length") => Value::Int(as_str(&this).encode_utf16().count() as i32),
            ("java/lang/Math", "abs") => Value::Int(as_int(&args[0]).wrapping_abs()),
            (_, "booleanValue") => match this {
                Value::Boolean(b) => Value::Int(b as i32),
                other => panic!("booleanValue on {other:?}"),
            },
            (_, "charValue") => match this {
                Value::Char(c) => Value::Int(c as i32),
                other => panic!("charValue on {other:?}"),
            },
            (_, number) if number.ends_with("Value") => unbox_number(number, &this),
            _ => panic!("unsupported call {owner}.{name}{desc}"),
        })
    }

    fn spy(&self, name: &str, args: Vec<Value>) -> Result<Value, Value> {
        let verdict = match name {
            spy::ON_BEFORE => {
                let Value::Object(array) = &args[0] else { panic!("argument array") };
                let Array(items) = array.downcast_ref::<Array>().expect("array");
                let mut arguments = items.lock().unwrap().clone();
                let verdict = spy::spy_method_on_before(
                    &mut arguments,
                    as_str(&args[1]),
                    as_int(&args[2]),
                    as_int(&args[3]),
                    as_str(&args[4]),
                    as_str(&args[5]),
                    as_str(&args[6]),
                    args[7].clone(),
                );
                *items.lock().unwrap() = arguments;
                verdict
            }
            spy::ON_RETURN => spy::spy_method_on_return(args[0].clone(), as_str(&args[1]), as_int(&args[2])),
            spy::ON_THROWS => spy::spy_method_on_throws(args[0].clone(), as_str(&args[1]), as_int(&args[2])),
            spy::ON_LINE => spy::spy_method_on_line(as_int(&args[0]), as_str(&args[1]), as_int(&args[2])),
            spy::ON_CALL_BEFORE => spy::spy_method_on_call_before(
                as_int(&args[0]),
                as_str(&args[1]),
                as_str(&args[2]),
                as_str(&args[3]),
                as_str(&args[4]),
                as_int(&args[5]),
            ),
            spy::ON_CALL_RETURN => spy::spy_method_on_call_return(as_str(&args[0]), as_int(&args[1])),
            spy::ON_CALL_THROWS => {
                spy::spy_method_on_call_throws(as_str(&args[0]), as_str(&args[1]), as_int(&args[2]))
            }
            other => panic!("unknown dispatch {other}"),
        };
        ret_value(verdict)
    }
}

fn ret_value(verdict: Result<Verdict, ListenerCallbackError>) -> Result<Value, Value> {
    let (state, respond) = match verdict {
        Ok(Verdict::Continue) => (spy::RET_STATE_NONE, Value::Null),
        Ok(Verdict::Return(value)) => (spy::RET_STATE_RETURN, value),
        Ok(Verdict::Throw(value)) => (spy::RET_STATE_THROWS, value),
        Err(error) => return Err(throwable("java/lang/RuntimeException", &error.to_string())),
    };
    Ok(Value::Object(ObjectRef::new(&to_java_name(spy::RET_CLASS), Ret { state, respond })))
}

fn box_value(owner: &str, value: &Value) -> Value {
    match (owner, value) {
        ("java/lang/Boolean", v) => Value::Boolean(as_int(v) != 0),
        ("java/lang/Character", v) => Value::Char(as_int(v) as u16),
        ("java/lang/Byte", v) => Value::Byte(as_int(v) as i8),
        ("java/lang/Short", v) => Value::Short(as_int(v) as i16),
        ("java/lang/Integer", v) => Value::Int(as_int(v)),
        (_, v) => v.clone(),
    }
}

fn unbox_number(name: &str, value: &Value) -> Value {
    let (integral, real) = match value {
        Value::Byte(v) => (*v as i64, *v as f64),
        Value::Short(v) => (*v as i64, *v as f64),
        Value::Int(v) => (*v as i64, *v as f64),
        Value::Long(v) => (*v, *v as f64),
        Value::Float(v) => (*v as i64, *v as f64),
        Value::Double(v) => (*v as i64, *v),
        other => panic!("{name} on {other:?}"),
    };
    match name {
        "byteValue" => Value::Int(integral as i8 as i32),
        "shortValue" => Value::Int(integral as i16 as i32),
        "intValue" => Value::Int(integral as i32),
        "longValue" => Value::Long(integral),
        "floatValue" => Value::Float(real as f32),
        _ => Value::Double(real),
    }
}

/// Sign codes of the named methods of `class` (java name).
pub fn signs(class: &str, methods: &[&str]) -> Vec<String> {
    methods.iter().map(|m| format!("{class}#{m}")).collect()
}
