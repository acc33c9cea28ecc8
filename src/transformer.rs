//! Per-class entry point of the load/redefine pipeline.

use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::boundary::HostProcess;
use crate::bytecode::{ObjectHierarchy, TypeHierarchy};
use crate::descriptor::to_java_name;
use crate::error::{MatchEvaluationError, TransformError};
use crate::event::EventTypes;
use crate::listener::{panic_message, ListenerRegistration};
use crate::matcher::{Matcher, UnsafeGuard};
use crate::statistic::AffectStatistic;
use crate::structure::{LoadingBoundary, StructuralType, TypeHandle, ENGINE_PACKAGE_PREFIX};
use crate::weaver::Weaver;

/// Called by the host for every class it loads or redefines.
///
/// `class_name` is the internal name (`demo/Sample`). Returning `None`
/// keeps the class as it is.
pub trait ClassFileTransformer: Send + Sync {
    fn transform(
        &self,
        boundary: &LoadingBoundary,
        class_name: &str,
        redefined: Option<&dyn TypeHandle>,
        bytes: &[u8],
    ) -> Option<Vec<u8>>;
}

/// Matches and weaves classes for one listener registration.
pub struct TransformCoordinator {
    namespace: String,
    listener_id: i32,
    event_types: EventTypes,
    matcher: UnsafeGuard<Arc<dyn Matcher>>,
    statistic: AffectStatistic,
    dump_path: Option<PathBuf>,
    host: Option<Arc<dyn HostProcess>>,
}

/// Reference merges answered by the host's view of one loading scope.
struct HostHierarchy<'a> {
    host: &'a dyn HostProcess,
    boundary: &'a LoadingBoundary,
}

impl TypeHierarchy for HostHierarchy<'_> {
    fn common_super_class(&self, a: &str, b: &str) -> String {
        self.host
            .common_super_class(self.boundary, a, b)
            .unwrap_or_else(|| ObjectHierarchy.common_super_class(a, b))
    }
}

impl TransformCoordinator {
    pub fn new(registration: &ListenerRegistration, matcher: Arc<dyn Matcher>, dump_path: Option<PathBuf>) -> Self {
        Self {
            namespace: registration.namespace.clone(),
            listener_id: registration.listener_id,
            event_types: registration.event_types,
            matcher: UnsafeGuard::new(matcher, registration.enable_unsafe),
            statistic: AffectStatistic::new(),
            dump_path,
            host: None,
        }
    }

    /// Ask `host` for the common superclass of types merged in woven
    /// methods.
    pub fn with_host(mut self, host: Arc<dyn HostProcess>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn listener_id(&self) -> i32 {
        self.listener_id
    }

    pub fn statistic(&self) -> &AffectStatistic {
        &self.statistic
    }

    /// The full pipeline with errors surfaced. `Ok(None)` means no change.
    pub fn transform_class(
        &self,
        boundary: &LoadingBoundary,
        class_name: &str,
        redefined: Option<&dyn TypeHandle>,
        bytes: &[u8],
    ) -> Result<Option<Vec<u8>>, TransformError> {
        let java_name = to_java_name(class_name);
        if boundary.is_engine() || java_name.starts_with(ENGINE_PACKAGE_PREFIX) {
            return Ok(None);
        }

        let structure = match redefined {
            Some(handle) => StructuralType { boundary: boundary.clone(), ..StructuralType::from_handle(handle)? },
            None => StructuralType::from_bytes(bytes, boundary.clone())?,
        };
        let matched = catch_unwind(AssertUnwindSafe(|| self.matcher.matching(&structure)))
            .map_err(|panic| MatchEvaluationError::Panicked(panic_message(panic.as_ref())))??;
        if !matched.is_matched() {
            return Ok(None);
        }

        let hierarchy = self.host.as_deref().map(|host| HostHierarchy { host, boundary });
        let mut weaver = Weaver::new(&self.namespace, self.listener_id, self.event_types);
        if let Some(hierarchy) = &hierarchy {
            weaver = weaver.with_hierarchy(hierarchy);
        }
        let woven = weaver.weave(boundary.object_id(), bytes, &matched.sign_codes())?;
        if !woven.is_modified() || woven.bytes == bytes {
            return Ok(None);
        }

        self.statistic.record(boundary, &java_name, woven.behaviors.iter().cloned());
        if let Some(dir) = &self.dump_path {
            self.dump(dir, class_name, &woven.bytes);
        }
        debug!(
            namespace = %self.namespace,
            listener_id = self.listener_id,
            class = %java_name,
            loader = %boundary,
            behaviors = ?woven.behaviors,
            "class transformed"
        );
        Ok(Some(woven.bytes))
    }

    fn dump(&self, dir: &Path, class_name: &str, bytes: &[u8]) {
        let path = dir.join(format!("{class_name}.class"));
        let written = match path.parent() {
            Some(parent) => fs::create_dir_all(parent).and_then(|_| fs::write(&path, bytes)),
            None => fs::write(&path, bytes),
        };
        if let Err(error) = written {
            warn!(
                namespace = %self.namespace,
                listener_id = self.listener_id,
                class = class_name,
                path = %path.display(),
                %error,
                "failed to dump woven class"
            );
        }
    }
}

impl ClassFileTransformer for TransformCoordinator {
    fn transform(
        &self,
        boundary: &LoadingBoundary,
        class_name: &str,
        redefined: Option<&dyn TypeHandle>,
        bytes: &[u8],
    ) -> Option<Vec<u8>> {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.transform_class(boundary, class_name, redefined, bytes)));
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => {
                warn!(
                    namespace = %self.namespace,
                    listener_id = self.listener_id,
                    class = class_name,
                    loader = %boundary,
                    %error,
                    "class left unchanged"
                );
                None
            }
            Err(panic) => {
                warn!(
                    namespace = %self.namespace,
                    listener_id = self.listener_id,
                    class = class_name,
                    loader = %boundary,
                    panic = %panic_message(panic.as_ref()),
                    "transform panicked; class left unchanged"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ListenerError;
    use crate::event::Event;
    use crate::classfile::access::*;
    use crate::classfile::{AttributeInfo, ClassFile, CodeAttribute, ConstantPool, MethodInfo};
    use crate::error::{ClassFileError, HostError};
    use crate::matcher::{MatchAll, MatchingResult};
    use crate::structure::StructuralBehavior;

    fn coordinator(matcher: Arc<dyn Matcher>) -> TransformCoordinator {
        let registration = ListenerRegistration {
            listener_id: 1,
            event_types: EventTypes::BEFORE,
            namespace: "transformer-test".into(),
            enable_unsafe: false,
            listener: Arc::new(|_: &mut Event| -> Result<(), ListenerError> { Ok(()) }),
        };
        TransformCoordinator::new(&registration, matcher, None)
    }

    struct Panicking;

    impl Matcher for Panicking {
        fn matching(&self, _ty: &StructuralType) -> Result<MatchingResult, MatchEvaluationError> {
            panic!("bad matcher")
        }
    }

    #[test]
    fn engine_types_are_skipped_before_parsing() {
        let c = coordinator(Arc::new(MatchAll));
        let app = LoadingBoundary::Application { id: 1 };
        assert!(matches!(c.transform_class(&app, "jvmweaver/spy/Spy", None, b"not a class"), Ok(None)));
        let engine = LoadingBoundary::Engine { namespace: "x".into() };
        assert!(matches!(c.transform_class(&engine, "demo/App", None, b"not a class"), Ok(None)));
    }

    #[test]
    fn failures_become_no_change() {
        let c = coordinator(Arc::new(MatchAll));
        let app = LoadingBoundary::Application { id: 1 };
        assert!(matches!(
            c.transform_class(&app, "demo/App", None, b"not a class"),
            Err(TransformError::Malformed(_))
        ));
        assert_eq!(c.transform(&app, "demo/App", None, b"not a class"), None);
        assert_eq!(c.statistic().classes_affected(), 0);
    }

    fn plain_class() -> Vec<u8> {
        let mut constant_pool = ConstantPool::new();
        let this_class = constant_pool.add_class("demo/Plain").unwrap();
        let super_class = constant_pool.add_class("java/lang/Object").unwrap();
        ClassFile {
            minor_version: 0,
            major_version: 52,
            constant_pool,
            access_flags: 0x21,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        }
        .to_bytes()
        .unwrap()
    }

    #[test]
    fn matcher_panics_are_contained() {
        let c = coordinator(Arc::new(Panicking));
        let app = LoadingBoundary::Application { id: 1 };
        let result = c.transform_class(&app, "demo/Plain", None, &plain_class());
        assert!(matches!(result, Err(TransformError::Match(MatchEvaluationError::Panicked(_)))));
        assert_eq!(c.transform(&app, "demo/Plain", None, &plain_class()), None);
    }

    /// `demo.Plain` with one `void run()` that returns.
    fn runnable_class() -> Vec<u8> {
        let mut class = ClassFile::parse(&plain_class()).unwrap();
        let cp = &mut class.constant_pool;
        cp.add_utf8("Code").unwrap();
        let name_index = cp.add_utf8("run").unwrap();
        let descriptor_index = cp.add_utf8("()V").unwrap();
        let code = CodeAttribute {
            max_stack: 0,
            max_locals: 1,
            code: vec![0xb1],
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };
        class.methods.push(MethodInfo {
            access_flags: ACC_PUBLIC,
            name_index,
            descriptor_index,
            attributes: vec![AttributeInfo::Code(code)],
        });
        class.to_bytes().unwrap()
    }

    /// A loaded `demo.Plain` whose handle names the given loader.
    struct Loaded(LoadingBoundary);

    impl TypeHandle for Loaded {
        fn java_name(&self) -> String {
            "demo.Plain".into()
        }

        fn super_name(&self) -> Option<String> {
            Some("java.lang.Object".into())
        }

        fn interface_names(&self) -> Vec<String> {
            Vec::new()
        }

        fn access_flags(&self) -> u16 {
            ACC_PUBLIC | ACC_SUPER
        }

        fn annotation_names(&self) -> Vec<String> {
            Vec::new()
        }

        fn behaviors(&self) -> Result<Vec<StructuralBehavior>, ClassFileError> {
            Ok(vec![StructuralBehavior::new("demo.Plain", "run", "()V", ACC_PUBLIC)?])
        }

        fn boundary(&self) -> LoadingBoundary {
            self.0.clone()
        }
    }

    #[test]
    fn redefinition_is_guarded_by_the_boundary_the_host_reports() {
        let c = coordinator(Arc::new(MatchAll));
        let bytes = runnable_class();
        let app = LoadingBoundary::Application { id: 1 };

        let stale = Loaded(app.clone());
        let result = c.transform_class(&LoadingBoundary::Bootstrap, "demo/Plain", Some(&stale), &bytes);
        assert!(matches!(result, Ok(None)));
        assert_eq!(c.statistic().classes_affected(), 0);

        let reported_bootstrap = Loaded(LoadingBoundary::Bootstrap);
        let woven = c.transform_class(&app, "demo/Plain", Some(&reported_bootstrap), &bytes).unwrap();
        assert!(woven.is_some());
        assert_eq!(c.statistic().classes_affected(), 1);
    }

    /// Knows that `demo/B` and `demo/C` share `demo/A`.
    struct SiblingHost;

    impl HostProcess for SiblingHost {
        fn define_bootstrap_class(&self, _internal_name: &str, _bytes: &[u8]) -> Result<(), HostError> {
            Ok(())
        }

        fn add_transformer(&self, _transformer: Arc<dyn ClassFileTransformer>) -> Result<(), HostError> {
            Ok(())
        }

        fn remove_transformer(&self, _transformer: &Arc<dyn ClassFileTransformer>) -> Result<(), HostError> {
            Ok(())
        }

        fn common_super_class(&self, boundary: &LoadingBoundary, a: &str, b: &str) -> Option<String> {
            let siblings = ["demo/B", "demo/C"];
            (boundary.object_id() == 1 && siblings.contains(&a) && siblings.contains(&b)).then(|| "demo/A".to_string())
        }
    }

    #[test]
    fn host_answers_merges_for_its_own_loader() {
        let app = LoadingBoundary::Application { id: 1 };
        let other = LoadingBoundary::Application { id: 2 };
        let hierarchy = HostHierarchy { host: &SiblingHost, boundary: &app };
        assert_eq!(hierarchy.common_super_class("demo/B", "demo/C"), "demo/A");
        assert_eq!(hierarchy.common_super_class("demo/B", "demo/X"), "java/lang/Object");
        let elsewhere = HostHierarchy { host: &SiblingHost, boundary: &other };
        assert_eq!(elsewhere.common_super_class("demo/B", "demo/C"), "java/lang/Object");

        let c = coordinator(Arc::new(MatchAll)).with_host(Arc::new(SiblingHost));
        let woven = c.transform_class(&app, "demo/Plain", None, &runnable_class()).unwrap();
        assert!(woven.is_some());
    }
}
