//! Router module for HTTP request routing.
//!
//! Routes map a method and a path pattern to a handler, optionally wrapped
//! in middlewares. The table is built once and immutable afterwards; all
//! engines read it lock-free through an `Arc`.
//!
//! # Examples
//!
//! ```
//! use troika_engine::{handler_fn, Response};
//! use troika_engine::router::Router;
//! use http::Method;
//!
//! let router = Router::builder()
//!     .get("/hello", handler_fn(|_req| Response::ok().with_body("Hello, World!")))
//!     .get("/users/{id}", handler_fn(|req| {
//!         let id = req.path_param("id").unwrap_or("").to_string();
//!         Response::ok().with_body(id)
//!     }))
//!     .build()
//!     .unwrap();
//! # let _ = router;
//! ```
//!
//! # Matching
//!
//! 1. The path is normalized (leading `/`, collapsed slashes; the request
//!    path was percent-decoded at parse time).
//! 2. An exact-static fast path is consulted first.
//! 3. Otherwise routes are scanned in precedence order: registration
//!    priority, then pattern specificity score, then pattern length, then
//!    registration order.
//! 4. A path that matches under a different method yields
//!    [`RouteOutcome::MethodNotAllowed`] carrying the allowed set; a full
//!    miss yields [`RouteOutcome::NotFound`].

mod pattern;

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use thiserror::Error;
use tracing::debug;

use crate::handler::{compose, Handler, Middleware};

pub use pattern::{normalize_path, Pattern, PatternError};

/// Errors raised while building a router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A route pattern failed to compile.
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

/// An immutable, priority-ordered routing table.
pub struct Router {
    /// Exact-static fast path: (method, normalized path) -> route index.
    static_routes: HashMap<(Method, String), usize>,
    /// All routes in precedence order.
    routes: Vec<CompiledRoute>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("routes", &self.routes.len()).finish()
    }
}

struct CompiledRoute {
    method: Method,
    pattern: Pattern,
    handler: Arc<dyn Handler>,
    priority: i32,
    seq: usize,
}

/// The result of routing one request.
pub enum RouteOutcome<'router> {
    /// A handler matched; `params` holds the path parameter bindings.
    Matched { handler: &'router Arc<dyn Handler>, params: HashMap<String, String> },
    /// The path exists under other methods; carries the allowed set.
    MethodNotAllowed(Vec<Method>),
    /// Nothing matched the path at all.
    NotFound,
}

impl std::fmt::Debug for RouteOutcome<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Matched { params, .. } => f.debug_struct("Matched").field("params", params).finish_non_exhaustive(),
            Self::MethodNotAllowed(allowed) => f.debug_tuple("MethodNotAllowed").field(allowed).finish(),
            Self::NotFound => write!(f, "NotFound"),
        }
    }
}

impl Router {
    /// Creates a new builder.
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Routes a request to a handler.
    ///
    /// `path` is the percent-decoded request path; normalization happens
    /// here so callers can pass it straight from the request.
    pub fn route(&self, method: &Method, path: &str) -> RouteOutcome<'_> {
        let normalized = normalize_path(path);

        if let Some(&index) = self.static_routes.get(&(method.clone(), normalized.clone())) {
            let route = &self.routes[index];
            return RouteOutcome::Matched { handler: &route.handler, params: HashMap::new() };
        }

        let mut allowed: Vec<Method> = Vec::new();
        for route in &self.routes {
            if let Some(params) = route.pattern.matches(&normalized) {
                if &route.method == method {
                    debug!(pattern = route.pattern.raw(), "route matched");
                    return RouteOutcome::Matched { handler: &route.handler, params };
                }
                if !allowed.contains(&route.method) {
                    allowed.push(route.method.clone());
                }
            }
        }

        if allowed.is_empty() {
            RouteOutcome::NotFound
        } else {
            allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            RouteOutcome::MethodNotAllowed(allowed)
        }
    }
}

/// A handler plus its per-route middlewares and priority.
///
/// Any [`Handler`] converts into an endpoint; use the builder methods to
/// attach route middlewares or adjust the priority:
///
/// ```
/// use troika_engine::router::Endpoint;
/// use troika_engine::{handler_fn, Response};
///
/// let endpoint = Endpoint::new(handler_fn(|_req| Response::ok())).priority(5);
/// # let _ = endpoint;
/// ```
pub struct Endpoint {
    handler: Arc<dyn Handler>,
    middlewares: Vec<Arc<dyn Middleware>>,
    priority: i32,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("middlewares", &self.middlewares.len())
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Wraps a handler as an endpoint with priority 0.
    pub fn new<H: Handler>(handler: H) -> Self {
        Self { handler: Arc::new(handler), middlewares: Vec::new(), priority: 0 }
    }

    /// Adds a middleware that runs only for this route, after the globals.
    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Overrides the registration priority; higher wins.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl<H: Handler> From<H> for Endpoint {
    fn from(handler: H) -> Self {
        Endpoint::new(handler)
    }
}

/// The CRUD handler set consumed by [`RouterBuilder::resource`].
///
/// Each slot is optional; only the provided handlers are registered.
#[derive(Debug, Default)]
pub struct ResourceHandlers {
    /// `GET {base}`
    pub index: Option<Endpoint>,
    /// `POST {base}`
    pub create: Option<Endpoint>,
    /// `GET {base}/{id}`
    pub show: Option<Endpoint>,
    /// `PUT {base}/{id}`
    pub update: Option<Endpoint>,
    /// `DELETE {base}/{id}`
    pub delete: Option<Endpoint>,
}

/// Builder accumulating routes, groups and global middlewares.
pub struct RouterBuilder {
    routes: Vec<RouteDef>,
    globals: Vec<Arc<dyn Middleware>>,
    prefix: String,
}

impl std::fmt::Debug for RouterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterBuilder")
            .field("routes", &self.routes.len())
            .field("globals", &self.globals.len())
            .field("prefix", &self.prefix)
            .finish()
    }
}

struct RouteDef {
    method: Method,
    pattern: String,
    endpoint: Endpoint,
}

impl RouterBuilder {
    fn new() -> Self {
        Self { routes: Vec::new(), globals: Vec::new(), prefix: String::new() }
    }

    /// Registers a route.
    pub fn register(mut self, method: Method, pattern: &str, endpoint: impl Into<Endpoint>) -> Self {
        let pattern = format!("{}{}", self.prefix, pattern);
        self.routes.push(RouteDef { method, pattern, endpoint: endpoint.into() });
        self
    }

    /// Registers a `GET` route.
    pub fn get(self, pattern: &str, endpoint: impl Into<Endpoint>) -> Self {
        self.register(Method::GET, pattern, endpoint)
    }

    /// Registers a `POST` route.
    pub fn post(self, pattern: &str, endpoint: impl Into<Endpoint>) -> Self {
        self.register(Method::POST, pattern, endpoint)
    }

    /// Registers a `PUT` route.
    pub fn put(self, pattern: &str, endpoint: impl Into<Endpoint>) -> Self {
        self.register(Method::PUT, pattern, endpoint)
    }

    /// Registers a `DELETE` route.
    pub fn delete(self, pattern: &str, endpoint: impl Into<Endpoint>) -> Self {
        self.register(Method::DELETE, pattern, endpoint)
    }

    /// Registers a `HEAD` route.
    pub fn head(self, pattern: &str, endpoint: impl Into<Endpoint>) -> Self {
        self.register(Method::HEAD, pattern, endpoint)
    }

    /// Adds a global middleware; globals run before route middlewares in
    /// registration order.
    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.globals.push(Arc::new(middleware));
        self
    }

    /// Registers routes under a shared path prefix.
    ///
    /// ```
    /// use troika_engine::router::Router;
    /// use troika_engine::{handler_fn, Response};
    ///
    /// let router = Router::builder()
    ///     .scope("/api", |api| {
    ///         api.get("/status", handler_fn(|_req| Response::ok()))
    ///     })
    ///     .build()
    ///     .unwrap();
    /// # let _ = router;
    /// ```
    pub fn scope(mut self, prefix: &str, f: impl FnOnce(RouterBuilder) -> RouterBuilder) -> Self {
        let saved = self.prefix.clone();
        self.prefix = format!("{}{}", self.prefix, prefix);
        let mut nested = f(self);
        nested.prefix = saved;
        nested
    }

    /// Registers the CRUD five-tuple for a resource base path.
    pub fn resource(mut self, base: &str, handlers: ResourceHandlers) -> Self {
        let item = format!("{base}/{{id}}");
        if let Some(endpoint) = handlers.index {
            self = self.register(Method::GET, base, endpoint);
        }
        if let Some(endpoint) = handlers.create {
            self = self.register(Method::POST, base, endpoint);
        }
        if let Some(endpoint) = handlers.show {
            self = self.register(Method::GET, &item, endpoint);
        }
        if let Some(endpoint) = handlers.update {
            self = self.register(Method::PUT, &item, endpoint);
        }
        if let Some(endpoint) = handlers.delete {
            self = self.register(Method::DELETE, &item, endpoint);
        }
        self
    }

    /// Compiles patterns, folds middleware chains and freezes the table.
    pub fn build(self) -> Result<Router, RouterError> {
        let globals = self.globals;

        let mut routes = Vec::with_capacity(self.routes.len());
        for (seq, def) in self.routes.into_iter().enumerate() {
            let pattern = Pattern::parse(&def.pattern)?;

            // fold: globals first, then route middlewares, then the handler
            let mut middlewares = globals.clone();
            middlewares.extend(def.endpoint.middlewares);
            let handler = compose(&middlewares, def.endpoint.handler);

            routes.push(CompiledRoute { method: def.method, pattern, handler, priority: def.endpoint.priority, seq });
        }

        // precedence: priority desc, specificity desc, pattern length desc,
        // registration order asc
        routes.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.pattern.score().cmp(&a.pattern.score()))
                .then(b.pattern.raw().len().cmp(&a.pattern.raw().len()))
                .then(a.seq.cmp(&b.seq))
        });

        let mut static_routes = HashMap::new();
        for (index, route) in routes.iter().enumerate() {
            if !route.pattern.is_static() {
                continue;
            }
            let path = normalize_path(route.pattern.raw());
            // The fast path must agree with the full precedence scan: a
            // static route only gets an index entry if nothing sorted ahead
            // of it (e.g. a dynamic route with a higher explicit priority)
            // also matches its literal path.
            let shadowed = routes[..index]
                .iter()
                .any(|earlier| earlier.method == route.method && earlier.pattern.matches(&path).is_some());
            if !shadowed {
                static_routes.insert((route.method.clone(), path), index);
            }
        }

        Ok(Router { static_routes, routes })
    }
}
