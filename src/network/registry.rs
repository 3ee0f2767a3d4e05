//! Service registry
//!
//! Services are registered explicitly: each one lists its methods together
//! with a typed handler. Handlers are erased into [`MethodType`] descriptors
//! at registration time so the request loop can decode arguments and invoke
//! methods without knowing their concrete types.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecType;
use crate::error::{RpcError, RpcResult};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A decoded, type-erased call argument
pub type Argv = Box<dyn Any + Send>;

type DecodeFn = Box<dyn Fn(CodecType, &[u8]) -> RpcResult<Argv> + Send + Sync>;
type InvokeFn = Box<dyn Fn(Argv, CodecType) -> BoxFuture<RpcResult<Vec<u8>>> + Send + Sync>;

/// Descriptor of one invocable method
pub struct MethodType {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    decode: DecodeFn,
    invoke: InvokeFn,
}

impl MethodType {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rust type name of the argument
    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// Rust type name of the reply
    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of times the method has been invoked
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode a request body into this method's argument type
    pub fn decode_argv(&self, codec: CodecType, body: &[u8]) -> RpcResult<Argv> {
        (self.decode)(codec, body)
    }

    /// Run the method and encode its reply with `codec`.
    ///
    /// An error returned by the method comes back as [`RpcError::Remote`].
    pub fn invoke(&self, argv: Argv, codec: CodecType) -> BoxFuture<RpcResult<Vec<u8>>> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.invoke)(argv, codec)
    }
}

impl std::fmt::Debug for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodType")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// A named set of methods ready to be registered
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodType>>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodType>> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// A receiver that knows how to describe its own methods
pub trait RpcService: Send + Sync + Sized + 'static {
    fn register_methods(builder: ServiceBuilder<Self>) -> ServiceBuilder<Self>;
}

/// Builds a [`Service`] around a shared receiver
pub struct ServiceBuilder<S> {
    name: String,
    receiver: Arc<S>,
    methods: HashMap<String, Arc<MethodType>>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    /// Start a service named after the receiver's type
    pub fn new(receiver: S) -> Self {
        Self::from_arc(Arc::new(receiver))
    }

    pub fn from_arc(receiver: Arc<S>) -> Self {
        Self {
            name: short_type_name::<S>().to_string(),
            receiver,
            methods: HashMap::new(),
        }
    }

    /// Override the service name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a method.
    ///
    /// Method names that are empty or contain `.` cannot be addressed as
    /// `"Service.Method"` and are skipped.
    pub fn method<A, R, E, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        if name.is_empty() || name.contains('.') {
            tracing::debug!("rpc server: skipping ineligible method {:?}", name);
            return self;
        }

        let receiver = self.receiver.clone();
        let handler = Arc::new(handler);

        let decode: DecodeFn = Box::new(|codec: CodecType, body: &[u8]| -> RpcResult<Argv> {
            let argv: A = codec.decode(body)?;
            Ok(Box::new(argv))
        });

        let invoke: InvokeFn = Box::new(
            move |argv: Argv, codec: CodecType| -> BoxFuture<RpcResult<Vec<u8>>> {
                Box::pin(call_handler(handler.clone(), receiver.clone(), argv, codec))
            },
        );

        self.methods.insert(
            name.to_string(),
            Arc::new(MethodType {
                name: name.to_string(),
                arg_type: type_name::<A>(),
                reply_type: type_name::<R>(),
                num_calls: AtomicU64::new(0),
                decode,
                invoke,
            }),
        );
        self
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

async fn call_handler<S, A, R, E, F, Fut>(
    handler: Arc<F>,
    receiver: Arc<S>,
    argv: Argv,
    codec: CodecType,
) -> RpcResult<Vec<u8>>
where
    A: 'static,
    R: Serialize,
    E: Display,
    F: Fn(Arc<S>, A) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let args = argv
        .downcast::<A>()
        .map_err(|_| RpcError::Decode(format!("argument is not a {}", type_name::<A>())))?;
    let reply = (*handler)(receiver, *args)
        .await
        .map_err(|e| RpcError::Remote(e.to_string()))?;
    Ok(codec.encode(&reply)?)
}

/// `my_crate::module::Arith` -> `Arith`
fn short_type_name<T>() -> &'static str {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Name -> service map shared by every connection of a server
#[derive(Default)]
pub struct Registry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service; an existing service with the same name is kept
    pub fn register(&self, service: Service) -> RpcResult<()> {
        if service.name.is_empty() || service.name.contains('.') {
            return Err(RpcError::InvalidService(service.name));
        }

        let mut services = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(&service.name) {
            return Err(RpcError::DuplicateService(service.name));
        }

        for method in service.methods.values() {
            tracing::info!(
                "rpc server: register {}.{} ({} -> {})",
                service.name,
                method.name,
                method.arg_type,
                method.reply_type
            );
        }
        services.insert(service.name.clone(), Arc::new(service));
        Ok(())
    }

    /// Find the method addressed by `"Service.Method"`.
    ///
    /// Every failure is reported the same way so a caller cannot tell which
    /// half of the name was wrong.
    pub fn resolve(&self, service_method: &str) -> RpcResult<Arc<MethodType>> {
        let malformed = || RpcError::MalformedRequest(service_method.to_string());

        let (service_name, method_name) = service_method.rsplit_once('.').ok_or_else(malformed)?;
        let services = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        services
            .get(service_name)
            .and_then(|service| service.methods.get(method_name))
            .cloned()
            .ok_or_else(malformed)
    }

    /// Get a registered service by name
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}
