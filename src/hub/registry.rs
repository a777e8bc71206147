//! Hub method table.
//!
//! Built once per hub type from [`Hub::register`](super::Hub::register) and
//! shared immutably afterwards. Each entry pairs a [`HubMethodDescriptor`]
//! with a binder that decodes raw positional arguments into the handler's
//! declared parameter tuple and returns a call ready to run against a hub
//! instance.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::protocol::{FromArguments, ProtocolError};

use super::{AuthorizationRequirements, Hub, HubError, RESERVED_METHOD_NAMES};

/// A decoded call waiting for its hub instance.
pub type BoundInvocation<H> =
    Box<dyn FnOnce(H) -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

type Binder<H> =
    Arc<dyn Fn(Vec<Value>) -> Result<BoundInvocation<H>, ProtocolError> + Send + Sync>;

/// Static description of one invocable method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubMethodDescriptor {
    /// Wire name.
    pub name: String,
    /// Declared parameter type names, in order.
    pub parameter_types: Vec<&'static str>,
    /// Method-level requirements; overrides the hub's defaults when set.
    pub authorization: Option<AuthorizationRequirements>,
}

impl HubMethodDescriptor {
    /// Declared parameter count.
    pub fn arity(&self) -> usize {
        self.parameter_types.len()
    }
}

/// One registered method.
pub struct RegisteredMethod<H> {
    descriptor: Arc<HubMethodDescriptor>,
    binder: Binder<H>,
}

impl<H> fmt::Debug for RegisteredMethod<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredMethod")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl<H> RegisteredMethod<H> {
    /// Method descriptor.
    pub fn descriptor(&self) -> &Arc<HubMethodDescriptor> {
        &self.descriptor
    }

    /// Decode `arguments` into the declared parameters.
    ///
    /// Arity mismatches come back as [`ProtocolError::ArgumentCount`].
    pub fn bind(&self, arguments: Vec<Value>) -> Result<BoundInvocation<H>, ProtocolError> {
        (self.binder)(arguments)
    }
}

/// Registration surface handed to [`Hub::register`](super::Hub::register).
///
/// Validation happens when the registry is built, so registration itself never
/// fails.
pub struct HubMethods<H> {
    entries: Vec<RegisteredMethod<H>>,
}

impl<H> fmt::Debug for HubMethods<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| &e.descriptor.name))
            .finish()
    }
}

impl<H: Hub> HubMethods<H> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a method. The parameter tuple `A` fixes the wire arity.
    pub fn method<A, R, F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        A: FromArguments,
        R: Serialize + Send + 'static,
        F: Fn(H, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.push(name, None, handler)
    }

    /// Register a method with its own authorization requirements.
    pub fn authorized_method<A, R, F, Fut>(
        &mut self,
        name: &str,
        requirements: AuthorizationRequirements,
        handler: F,
    ) -> &mut Self
    where
        A: FromArguments,
        R: Serialize + Send + 'static,
        F: Fn(H, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.push(name, Some(requirements), handler)
    }

    fn push<A, R, F, Fut>(
        &mut self,
        name: &str,
        authorization: Option<AuthorizationRequirements>,
        handler: F,
    ) -> &mut Self
    where
        A: FromArguments,
        R: Serialize + Send + 'static,
        F: Fn(H, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let binder: Binder<H> = Arc::new(
            move |arguments: Vec<Value>| -> Result<BoundInvocation<H>, ProtocolError> {
                let params = A::from_arguments(arguments)?;
                let handler = Arc::clone(&handler);
                Ok(Box::new(move |hub: H| {
                    let call = (*handler)(hub, params);
                    async move {
                        let result = call.await?;
                        anyhow::Ok(serde_json::to_value(result)?)
                    }
                    .boxed()
                }))
            },
        );

        self.entries.push(RegisteredMethod {
            descriptor: Arc::new(HubMethodDescriptor {
                name: name.to_string(),
                parameter_types: A::parameter_types(),
                authorization,
            }),
            binder,
        });
        self
    }
}

/// Immutable method table for one hub type.
pub struct HubMethodRegistry<H> {
    methods: HashMap<String, RegisteredMethod<H>>,
}

impl<H> fmt::Debug for HubMethodRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubMethodRegistry")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<H: Hub> HubMethodRegistry<H> {
    /// Run `H::register` and validate the result.
    ///
    /// Fails on empty, duplicate or reserved names.
    pub fn build() -> Result<Self, HubError> {
        let mut methods = HubMethods::new();
        H::register(&mut methods);

        let mut table = HashMap::with_capacity(methods.entries.len());
        for entry in methods.entries {
            let name = entry.descriptor.name.clone();
            if name.is_empty() {
                return Err(HubError::EmptyMethodName);
            }
            if RESERVED_METHOD_NAMES.contains(&name.as_str()) {
                return Err(HubError::ReservedMethodName(name));
            }
            if table.contains_key(&name) {
                return Err(HubError::DuplicateMethod(name));
            }
            table.insert(name, entry);
        }

        log::debug!("[Hub] {} registered {} method(s)", H::name(), table.len());
        Ok(Self { methods: table })
    }
}

impl<H> HubMethodRegistry<H> {
    /// Look up a method by wire name.
    pub fn get(&self, name: &str) -> Option<&RegisteredMethod<H>> {
        self.methods.get(name)
    }

    /// Every descriptor, sorted by name.
    pub fn descriptors(&self) -> Vec<Arc<HubMethodDescriptor>> {
        let mut all: Vec<_> = self
            .methods
            .values()
            .map(|m| Arc::clone(&m.descriptor))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Number of methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the hub declares no methods.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubContext;
    use serde_json::json;

    struct Calc;

    impl Hub for Calc {
        fn activate(_context: HubContext) -> Self {
            Self
        }

        fn register(methods: &mut HubMethods<Self>) {
            methods
                .method("Add", |_hub: Self, (a, b): (i64, i64)| async move {
                    anyhow::Ok(a + b)
                })
                .method("Ping", |_hub: Self, (): ()| async move { anyhow::Ok("pong") });
        }
    }

    macro_rules! broken_hub {
        ($name:ident, $($method:expr),*) => {
            struct $name;

            impl Hub for $name {
                fn activate(_context: HubContext) -> Self {
                    Self
                }

                fn register(methods: &mut HubMethods<Self>) {
                    $(methods.method($method, |_hub: Self, (): ()| async move { anyhow::Ok(()) });)*
                }
            }
        };
    }

    broken_hub!(Duplicate, "Same", "Same");
    broken_hub!(Empty, "");
    broken_hub!(Reserved, "OnConnected");

    #[test]
    fn test_build_collects_descriptors() {
        let registry = HubMethodRegistry::<Calc>::build().unwrap();
        assert_eq!(registry.len(), 2);

        let add = registry.get("Add").unwrap().descriptor();
        assert_eq!(add.arity(), 2);
        assert_eq!(add.parameter_types, vec!["i64", "i64"]);
        assert!(add.authorization.is_none());

        let names: Vec<_> = registry.descriptors().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["Add", "Ping"]);
    }

    #[test]
    fn test_startup_errors() {
        assert!(matches!(
            HubMethodRegistry::<Duplicate>::build().unwrap_err(),
            HubError::DuplicateMethod(name) if name == "Same"
        ));
        assert!(matches!(
            HubMethodRegistry::<Empty>::build().unwrap_err(),
            HubError::EmptyMethodName
        ));
        assert!(matches!(
            HubMethodRegistry::<Reserved>::build().unwrap_err(),
            HubError::ReservedMethodName(_)
        ));
    }

    #[test]
    fn test_bind_checks_arity_and_types() {
        let registry = HubMethodRegistry::<Calc>::build().unwrap();
        let add = registry.get("Add").unwrap();

        assert!(matches!(
            add.bind(vec![json!(1)]),
            Err(ProtocolError::ArgumentCount { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            add.bind(vec![json!(1), json!("two")]),
            Err(ProtocolError::ArgumentType { index: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_bound_call_runs_against_instance() {
        let registry = HubMethodRegistry::<Calc>::build().unwrap();
        let bound = registry
            .get("Add")
            .unwrap()
            .bind(vec![json!(2), json!(40)])
            .unwrap();
        assert_eq!(bound(Calc).await.unwrap(), json!(42));
    }
}
