//! Class-level weaving.
//!
//! [`Weaver::weave`] parses a class, rewrites every method whose signature
//! code was selected and serializes the result. A method that cannot be
//! rewritten legally fails the whole class with a [`WeavingError`]; callers
//! keep the original bytes in that case.

mod control;
mod emit;
mod lock;
mod method;

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, trace};

use crate::bytecode::TypeHierarchy;
use crate::classfile::{AttributeInfo, ClassFile, MethodInfo};
use crate::descriptor::{to_java_name, JavaType, MethodDescriptor};
use crate::error::{TransformError, WeavingError};
use crate::event::EventTypes;
use crate::structure::sign_code;

use self::method::{weave_method, WeavePlan};

/// Method attribute listing the listener ids already woven into a method.
pub const LISTENERS_ATTRIBUTE: &str = "jvmweaver.Listeners";

/// Where woven dispatches are addressed and which events they report.
#[derive(Clone, Copy)]
pub struct Weaver<'a> {
    pub namespace: &'a str,
    pub listener_id: i32,
    pub event_types: EventTypes,
    /// Resolves reference merges between types other than the woven class.
    pub hierarchy: Option<&'a dyn TypeHierarchy>,
}

impl fmt::Debug for Weaver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Weaver")
            .field("namespace", &self.namespace)
            .field("listener_id", &self.listener_id)
            .field("event_types", &self.event_types)
            .field("hierarchy", &self.hierarchy.is_some())
            .finish()
    }
}

/// Output of one weaving pass.
#[derive(Debug, Clone)]
pub struct Woven {
    pub bytes: Vec<u8>,
    /// Signature codes of the methods rewritten by this pass.
    pub behaviors: Vec<String>,
}

impl Woven {
    pub fn is_modified(&self) -> bool {
        !self.behaviors.is_empty()
    }
}

impl<'a> Weaver<'a> {
    pub fn new(namespace: &'a str, listener_id: i32, event_types: EventTypes) -> Self {
        Self { namespace, listener_id, event_types, hierarchy: None }
    }

    /// Consult `hierarchy` when two unrelated reference types meet at a
    /// point the class's own frames do not describe.
    pub fn with_hierarchy(mut self, hierarchy: &'a dyn TypeHierarchy) -> Self {
        self.hierarchy = Some(hierarchy);
        self
    }

    /// Rewrite the methods of `bytes` whose signature code is in
    /// `signatures`. Methods without code, and methods this listener was
    /// already woven into, are left alone.
    pub fn weave(&self, loader_id: i32, bytes: &[u8], signatures: &[String]) -> Result<Woven, TransformError> {
        let mut class = ClassFile::parse(bytes)?;
        let owner = class.this_class_name()?.to_string();
        let class_name = to_java_name(&owner);
        let hierarchy = WovenClassHierarchy {
            owner: &owner,
            super_name: class.super_class_name()?.map(str::to_string),
            outer: self.hierarchy,
        };
        let selected: HashSet<&str> = signatures.iter().map(String::as_str).collect();
        let plan = WeavePlan {
            namespace: self.namespace,
            listener_id: self.listener_id,
            loader_id,
            event_types: self.event_types,
            class_name: &class_name,
        };

        let mut methods = std::mem::take(&mut class.methods);
        let mut woven = Vec::new();
        for method in &mut methods {
            let cp = &mut class.constant_pool;
            let name = method.name(cp)?.to_string();
            let descriptor = MethodDescriptor::parse(method.descriptor(cp)?)?;
            let params: Vec<String> = descriptor.parameters.iter().map(JavaType::java_name).collect();
            let code_sign = sign_code(&class_name, &name, &params);
            if !selected.contains(code_sign.as_str()) {
                continue;
            }
            let mut listeners = woven_listeners(method);
            if listeners.contains(&self.listener_id) {
                trace!(class = %class_name, method = %code_sign, listener_id = self.listener_id, "already woven");
                continue;
            }
            let Some(code) = method.code() else { continue };

            let ctx = crate::bytecode::MethodContext {
                owner: &owner,
                access_flags: method.access_flags,
                name: &name,
                descriptor: &descriptor,
            };
            let rewritten = weave_method(code, ctx, cp, &hierarchy, class.major_version, &plan)
                .map_err(|source| WeavingError::Method { method: code_sign.clone(), source })?;
            for attr in &mut method.attributes {
                if let AttributeInfo::Code(code) = attr {
                    *code = rewritten;
                    break;
                }
            }

            listeners.push(self.listener_id);
            cp.add_utf8(LISTENERS_ATTRIBUTE).map_err(WeavingError::from)?;
            method.set_raw_attribute(LISTENERS_ATTRIBUTE, encode_listeners(&listeners));
            woven.push(code_sign);
        }
        class.methods = methods;

        if woven.is_empty() {
            return Ok(Woven { bytes: bytes.to_vec(), behaviors: woven });
        }
        let bytes = class.to_bytes().map_err(WeavingError::from)?;
        debug!(
            class = %class_name,
            namespace = self.namespace,
            listener_id = self.listener_id,
            methods = woven.len(),
            "class woven"
        );
        Ok(Woven { bytes, behaviors: woven })
    }
}

/// Resolves the woven class through its declared superclass and every
/// other type through `outer`.
struct WovenClassHierarchy<'a> {
    owner: &'a str,
    super_name: Option<String>,
    outer: Option<&'a dyn TypeHierarchy>,
}

impl WovenClassHierarchy<'_> {
    fn lift<'n>(&'n self, name: &'n str) -> &'n str {
        match &self.super_name {
            Some(super_name) if name == self.owner => super_name,
            _ => name,
        }
    }
}

impl TypeHierarchy for WovenClassHierarchy<'_> {
    fn common_super_class(&self, a: &str, b: &str) -> String {
        if a == b {
            return a.to_string();
        }
        let (a, b) = (self.lift(a), self.lift(b));
        if a == b {
            return a.to_string();
        }
        match self.outer {
            Some(outer) => outer.common_super_class(a, b),
            None => crate::bytecode::ObjectHierarchy.common_super_class(a, b),
        }
    }
}

/// Convenience form of [`Weaver::weave`] returning only the bytes.
pub fn weave(
    loader_id: i32,
    bytes: &[u8],
    signatures: &[String],
    namespace: &str,
    listener_id: i32,
    event_types: EventTypes,
) -> Result<Vec<u8>, TransformError> {
    Weaver::new(namespace, listener_id, event_types)
        .weave(loader_id, bytes, signatures)
        .map(|w| w.bytes)
}

/// Listener ids recorded on `method` by earlier passes.
pub fn woven_listeners(method: &MethodInfo) -> Vec<i32> {
    let Some(raw) = method.raw_attribute(LISTENERS_ATTRIBUTE) else {
        return Vec::new();
    };
    let Some(count) = raw.get(..2).map(|b| u16::from_be_bytes([b[0], b[1]]) as usize) else {
        return Vec::new();
    };
    raw[2..]
        .chunks_exact(4)
        .take(count)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn encode_listeners(ids: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 4 * ids.len());
    out.extend_from_slice(&(ids.len() as u16).to_be_bytes());
    for id in ids {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out
}
